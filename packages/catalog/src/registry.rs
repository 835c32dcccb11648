use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use common::config::CatalogConfig;
use common::{AssetType, Scope, TimeBounds};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Select, Set, SqlErr,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::database::init_db;
use crate::entity::{asset, link_marker};
use crate::error::{CatalogError, Result};
use crate::record::{AssetRecord, NewAsset};

/// Join a parent id set into the marker key form: sorted, deduplicated, `-` separated.
pub fn parent_key(ids: &[i32]) -> String {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids.iter()
        .map(i32::to_string)
        .collect::<Vec<_>>()
        .join("-")
}

/// Durable catalog of assets and processed links.
///
/// Every mutating call holds `write_lock` for its whole read-check-write
/// sequence, so concurrent workers sharing a clone see a single writer.
/// Reads go straight to the pool.
#[derive(Clone)]
pub struct AssetRegistry {
    db: DatabaseConnection,
    write_lock: Arc<Mutex<()>>,
}

impl AssetRegistry {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Open the configured database, syncing the schema.
    pub async fn connect(config: &CatalogConfig) -> Result<Self> {
        let db = init_db(config).await?;
        info!(url = %config.url, "Catalog connected");
        Ok(Self::new(db))
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    fn scoped(scope: &Scope) -> Select<asset::Entity> {
        asset::Entity::find()
            .filter(asset::Column::Network.eq(scope.network.as_str()))
            .filter(asset::Column::Station.eq(scope.station.as_str()))
            .filter(asset::Column::Survey.eq(scope.survey.as_str()))
    }

    /// Insert a new asset and return its id.
    ///
    /// Refuses with [`CatalogError::Duplicate`] when the same remote path is
    /// already registered for this scope and type.
    pub async fn insert(&self, entry: NewAsset) -> Result<i32> {
        entry.validate()?;
        let _guard = self.write_lock.lock().await;

        if let Some(remote) = entry.remote_path.as_deref() {
            let existing = Self::scoped(&entry.scope)
                .filter(asset::Column::AssetType.eq(entry.asset_type))
                .filter(asset::Column::RemotePath.eq(remote))
                .one(&self.db)
                .await?;
            if existing.is_some() {
                debug!(
                    remote_path = remote,
                    asset_type = %entry.asset_type,
                    "Duplicate insert refused"
                );
                return Err(CatalogError::Duplicate {
                    remote_path: remote.to_string(),
                });
            }
        }

        let model = asset::ActiveModel {
            network: Set(entry.scope.network.clone()),
            station: Set(entry.scope.station.clone()),
            survey: Set(entry.scope.survey.clone()),
            asset_type: Set(entry.asset_type),
            local_path: Set(entry
                .local_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())),
            remote_path: Set(entry.remote_path.clone()),
            remote_kind: Set(entry.remote_kind),
            timestamp_start: Set(entry.timestamp_start),
            timestamp_end: Set(entry.timestamp_end),
            created_at: Set(Utc::now()),
            parent_id: Set(entry.parent_id),
            ..Default::default()
        };

        match model.insert(&self.db).await {
            Ok(inserted) => {
                debug!(
                    asset_id = inserted.id,
                    asset_type = %inserted.asset_type,
                    scope = %entry.scope,
                    "Asset registered"
                );
                Ok(inserted.id)
            }
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Err(CatalogError::Duplicate {
                    remote_path: entry.remote_path.unwrap_or_default(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: i32) -> Result<AssetRecord> {
        asset::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .map(AssetRecord::from)
            .ok_or(CatalogError::NotFound(id))
    }

    /// Fetch several records; ids that do not exist are skipped.
    pub async fn get_many(&self, ids: &[i32]) -> Result<Vec<AssetRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let models = asset::Entity::find()
            .filter(asset::Column::Id.is_in(ids.to_vec()))
            .order_by_asc(asset::Column::Id)
            .all(&self.db)
            .await?;
        Ok(models.into_iter().map(AssetRecord::from).collect())
    }

    /// All assets in `scope`, optionally restricted to one type.
    pub async fn query(
        &self,
        scope: &Scope,
        asset_type: Option<AssetType>,
    ) -> Result<Vec<AssetRecord>> {
        let mut select = Self::scoped(scope);
        if let Some(t) = asset_type {
            select = select.filter(asset::Column::AssetType.eq(t));
        }
        let models = select.order_by_asc(asset::Column::Id).all(&self.db).await?;
        Ok(models.into_iter().map(AssetRecord::from).collect())
    }

    /// Derived assets whose `parent_id` is `parent_id`.
    pub async fn children_of(
        &self,
        parent_id: i32,
        asset_type: Option<AssetType>,
    ) -> Result<Vec<AssetRecord>> {
        let mut select = asset::Entity::find().filter(asset::Column::ParentId.eq(parent_id));
        if let Some(t) = asset_type {
            select = select.filter(asset::Column::AssetType.eq(t));
        }
        let models = select.order_by_asc(asset::Column::Id).all(&self.db).await?;
        Ok(models.into_iter().map(AssetRecord::from).collect())
    }

    pub async fn remote_exists(
        &self,
        scope: &Scope,
        asset_type: AssetType,
        remote_path: &str,
    ) -> Result<bool> {
        let found = Self::scoped(scope)
            .filter(asset::Column::AssetType.eq(asset_type))
            .filter(asset::Column::RemotePath.eq(remote_path))
            .one(&self.db)
            .await?;
        Ok(found.is_some())
    }

    /// Number of assets per type in `scope`. With `local_only`, only assets
    /// that have a local path are counted.
    pub async fn count_by_type(
        &self,
        scope: &Scope,
        local_only: bool,
    ) -> Result<BTreeMap<AssetType, u64>> {
        let mut select = Self::scoped(scope);
        if local_only {
            select = select.filter(asset::Column::LocalPath.is_not_null());
        }
        let types: Vec<AssetType> = select
            .select_only()
            .column(asset::Column::AssetType)
            .into_tuple()
            .all(&self.db)
            .await?;

        let mut counts = BTreeMap::new();
        for t in types {
            *counts.entry(t).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Point an asset at a local file. Setting the same path again is a no-op.
    pub async fn update_local_path(&self, id: i32, path: &Path) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if asset::Entity::find_by_id(id).one(&self.db).await?.is_none() {
            return Err(CatalogError::NotFound(id));
        }
        asset::Entity::update_many()
            .col_expr(
                asset::Column::LocalPath,
                Expr::value(path.to_string_lossy().into_owned()),
            )
            .filter(asset::Column::Id.eq(id))
            .exec(&self.db)
            .await?;

        debug!(asset_id = id, local_path = %path.display(), "Local path updated");
        Ok(())
    }

    /// Widen the stored time bounds of `id` to cover `bounds`.
    ///
    /// Start and end are widened independently and never narrowed; unset
    /// endpoints take the new value. Returns the bounds now stored.
    pub async fn widen_time_bounds(&self, id: i32, bounds: TimeBounds) -> Result<TimeBounds> {
        let _guard = self.write_lock.lock().await;

        let model = asset::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(CatalogError::NotFound(id))?;

        let start = model
            .timestamp_start
            .map_or(bounds.start, |s| s.min(bounds.start));
        let end = model.timestamp_end.map_or(bounds.end, |e| e.max(bounds.end));

        if model.timestamp_start == Some(start) && model.timestamp_end == Some(end) {
            return Ok(TimeBounds { start, end });
        }

        let mut active: asset::ActiveModel = model.into();
        active.timestamp_start = Set(Some(start));
        active.timestamp_end = Set(Some(end));
        active.update(&self.db).await?;

        debug!(asset_id = id, %start, %end, "Time bounds widened");
        Ok(TimeBounds { start, end })
    }

    /// Whether `parent_id` has already been carried to `target`, either by a
    /// derived child or by a single or batch completion marker.
    pub async fn link_exists(&self, parent_id: i32, target: AssetType) -> Result<bool> {
        let child = asset::Entity::find()
            .filter(asset::Column::ParentId.eq(parent_id))
            .filter(asset::Column::AssetType.eq(target))
            .one(&self.db)
            .await?;
        if child.is_some() {
            return Ok(true);
        }

        let id = parent_id.to_string();
        let marker = link_marker::Entity::find()
            .filter(link_marker::Column::TargetType.eq(target))
            .filter(
                Condition::any()
                    .add(link_marker::Column::ParentIds.eq(id.as_str()))
                    .add(link_marker::Column::ParentIds.starts_with(format!("{id}-")))
                    .add(link_marker::Column::ParentIds.ends_with(format!("-{id}")))
                    .add(link_marker::Column::ParentIds.contains(format!("-{id}-"))),
            )
            .one(&self.db)
            .await?;
        Ok(marker.is_some())
    }

    /// Record that `parent_id` has been carried to `target`.
    pub async fn record_link(&self, parent_id: i32, target: AssetType) -> Result<()> {
        let parent = self.get(parent_id).await?;
        self.insert_marker(&parent.scope, parent.asset_type, target, &[parent_id])
            .await
    }

    /// Whether exactly this set of sources has been merged into `target`.
    pub async fn batch_link_exists(
        &self,
        scope: &Scope,
        source: AssetType,
        target: AssetType,
        ids: &[i32],
    ) -> Result<bool> {
        let found = Self::marker_query(scope, source, target, &parent_key(ids))
            .one(&self.db)
            .await?;
        Ok(found.is_some())
    }

    pub async fn record_batch_link(
        &self,
        scope: &Scope,
        source: AssetType,
        target: AssetType,
        ids: &[i32],
    ) -> Result<()> {
        if ids.is_empty() {
            warn!(%scope, %source, %target, "Refusing to record an empty batch link");
            return Ok(());
        }
        self.insert_marker(scope, source, target, ids).await
    }

    fn marker_query(
        scope: &Scope,
        source: AssetType,
        target: AssetType,
        key: &str,
    ) -> Select<link_marker::Entity> {
        link_marker::Entity::find()
            .filter(link_marker::Column::Network.eq(scope.network.as_str()))
            .filter(link_marker::Column::Station.eq(scope.station.as_str()))
            .filter(link_marker::Column::Survey.eq(scope.survey.as_str()))
            .filter(link_marker::Column::SourceType.eq(source))
            .filter(link_marker::Column::TargetType.eq(target))
            .filter(link_marker::Column::ParentIds.eq(key))
    }

    async fn insert_marker(
        &self,
        scope: &Scope,
        source: AssetType,
        target: AssetType,
        ids: &[i32],
    ) -> Result<()> {
        let key = parent_key(ids);
        let _guard = self.write_lock.lock().await;

        let existing = Self::marker_query(scope, source, target, &key)
            .one(&self.db)
            .await?;
        if existing.is_some() {
            return Ok(());
        }

        let model = link_marker::ActiveModel {
            network: Set(scope.network.clone()),
            station: Set(scope.station.clone()),
            survey: Set(scope.survey.clone()),
            source_type: Set(source),
            target_type: Set(target),
            parent_ids: Set(key.clone()),
            created_at: Set(Utc::now()),
            ..Default::default()
        };
        model.insert(&self.db).await?;

        debug!(%scope, %source, %target, parent_ids = %key, "Link recorded");
        Ok(())
    }
}
