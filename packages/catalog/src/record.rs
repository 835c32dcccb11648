use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use common::{AssetType, RemoteKind, Scope, TimeBounds};
use serde::{Deserialize, Serialize};

use crate::entity::asset;
use crate::error::CatalogError;

/// A catalog entry as seen by the rest of the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: i32,
    pub scope: Scope,
    pub asset_type: AssetType,
    pub local_path: Option<PathBuf>,
    pub remote_path: Option<String>,
    pub remote_kind: Option<RemoteKind>,
    pub timestamp_start: Option<DateTime<Utc>>,
    pub timestamp_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub parent_id: Option<i32>,
}

impl AssetRecord {
    /// Both bounds, when both are known.
    pub fn time_bounds(&self) -> Option<TimeBounds> {
        match (self.timestamp_start, self.timestamp_end) {
            (Some(start), Some(end)) => Some(TimeBounds::new(start, end)),
            _ => None,
        }
    }

    /// True when `local_path` is set and the file is on disk.
    pub fn has_local_file(&self) -> bool {
        self.local_path.as_deref().is_some_and(Path::exists)
    }

    /// Human readable identity for log lines.
    pub fn describe(&self) -> String {
        let location = self
            .local_path
            .as_ref()
            .map(|p| p.display().to_string())
            .or_else(|| self.remote_path.clone())
            .unwrap_or_else(|| "<no location>".to_string());
        format!(
            "asset {} ({} in {}) at {}",
            self.id, self.asset_type, self.scope, location
        )
    }
}

impl From<asset::Model> for AssetRecord {
    fn from(model: asset::Model) -> Self {
        Self {
            id: model.id,
            scope: Scope::new(model.network, model.station, model.survey),
            asset_type: model.asset_type,
            local_path: model.local_path.map(PathBuf::from),
            remote_path: model.remote_path,
            remote_kind: model.remote_kind,
            timestamp_start: model.timestamp_start,
            timestamp_end: model.timestamp_end,
            created_at: model.created_at,
            parent_id: model.parent_id,
        }
    }
}

/// Insert form of an asset; the registry assigns `id` and `created_at`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewAsset {
    pub scope: Scope,
    pub asset_type: AssetType,
    pub local_path: Option<PathBuf>,
    pub remote_path: Option<String>,
    pub remote_kind: Option<RemoteKind>,
    pub timestamp_start: Option<DateTime<Utc>>,
    pub timestamp_end: Option<DateTime<Utc>>,
    pub parent_id: Option<i32>,
}

impl NewAsset {
    fn bare(scope: Scope, asset_type: AssetType) -> Self {
        Self {
            scope,
            asset_type,
            local_path: None,
            remote_path: None,
            remote_kind: None,
            timestamp_start: None,
            timestamp_end: None,
            parent_id: None,
        }
    }

    /// A file already present on disk.
    pub fn local(scope: Scope, asset_type: AssetType, path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: Some(path.into()),
            ..Self::bare(scope, asset_type)
        }
    }

    /// An object that still has to be fetched.
    pub fn remote(
        scope: Scope,
        asset_type: AssetType,
        remote_path: impl Into<String>,
        kind: RemoteKind,
    ) -> Self {
        Self {
            remote_path: Some(remote_path.into()),
            remote_kind: Some(kind),
            ..Self::bare(scope, asset_type)
        }
    }

    /// A derived asset produced from `parent`, in the parent's scope.
    pub fn derived(parent: &AssetRecord, asset_type: AssetType) -> Self {
        Self {
            parent_id: Some(parent.id),
            ..Self::bare(parent.scope.clone(), asset_type)
        }
    }

    /// A derived asset with no single parent (batch merges).
    pub fn merged(scope: Scope, asset_type: AssetType) -> Self {
        Self::bare(scope, asset_type)
    }

    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    pub fn with_bounds(mut self, bounds: Option<TimeBounds>) -> Self {
        if let Some(b) = bounds {
            self.timestamp_start = Some(b.start);
            self.timestamp_end = Some(b.end);
        }
        self
    }

    /// Raw assets must point at bytes somewhere; derived ones may not yet.
    pub(crate) fn validate(&self) -> Result<(), CatalogError> {
        if self.parent_id.is_none()
            && self.local_path.is_none()
            && self.remote_path.is_none()
            && self.asset_type.category() == common::AssetCategory::Raw
        {
            return Err(CatalogError::InvalidRecord(format!(
                "{} asset in {} needs a local_path or a remote_path",
                self.asset_type, self.scope
            )));
        }
        if self.remote_path.is_some() != self.remote_kind.is_some() {
            return Err(CatalogError::InvalidRecord(
                "remote_path and remote_kind must be set together".to_string(),
            ));
        }
        if let (Some(start), Some(end)) = (self.timestamp_start, self.timestamp_end) {
            if start > end {
                return Err(CatalogError::InvalidRecord(format!(
                    "timestamp_start {start} is after timestamp_end {end}"
                )));
            }
        }
        Ok(())
    }
}
