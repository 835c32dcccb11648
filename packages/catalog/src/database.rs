use std::time::Duration;

use common::config::CatalogConfig;
use sea_orm::sea_query::{
    Index, IndexCreateStatement, MysqlQueryBuilder, PostgresQueryBuilder, SqliteQueryBuilder,
};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr};
use tracing::{info, warn};

use crate::entity::{asset, link_marker};

pub async fn init_db(config: &CatalogConfig) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(config.url.to_owned());

    opt.max_connections(config.max_connections)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .sqlx_logging(config.sqlx_logging);

    let db = Database::connect(opt).await?;
    db.get_schema_registry("catalog::entity::*")
        .sync(&db)
        .await?;

    ensure_indexes(&db).await;

    Ok(db)
}

/// Create the composite indexes the entity attributes cannot express.
pub async fn ensure_indexes(db: &DatabaseConnection) {
    // Duplicate-insert guard:
    // one row per remote object within a scope and type
    let remote_unique = Index::create()
        .if_not_exists()
        .unique()
        .name("idx_asset_scope_type_remote")
        .table(asset::Entity)
        .col(asset::Column::Network)
        .col(asset::Column::Station)
        .col(asset::Column::Survey)
        .col(asset::Column::AssetType)
        .col(asset::Column::RemotePath)
        .to_owned();
    create_index(db, "idx_asset_scope_type_remote", remote_unique).await;

    // Candidate lookups:
    // SELECT * FROM asset WHERE network = ? AND station = ? AND survey = ? AND type = ?
    let scope_type = Index::create()
        .if_not_exists()
        .name("idx_asset_scope_type")
        .table(asset::Entity)
        .col(asset::Column::Network)
        .col(asset::Column::Station)
        .col(asset::Column::Survey)
        .col(asset::Column::AssetType)
        .to_owned();
    create_index(db, "idx_asset_scope_type", scope_type).await;

    let marker_lookup = Index::create()
        .if_not_exists()
        .name("idx_link_marker_target_parents")
        .table(link_marker::Entity)
        .col(link_marker::Column::TargetType)
        .col(link_marker::Column::ParentIds)
        .to_owned();
    create_index(db, "idx_link_marker_target_parents", marker_lookup).await;
}

async fn create_index(db: &DatabaseConnection, name: &str, stmt: IndexCreateStatement) {
    let sql = match db.get_database_backend() {
        DbBackend::Postgres => stmt.to_string(PostgresQueryBuilder),
        DbBackend::Sqlite => stmt.to_string(SqliteQueryBuilder),
        _ => stmt.to_string(MysqlQueryBuilder),
    };

    match db.execute_unprepared(&sql).await {
        Ok(_) => info!("Ensured index {} exists", name),
        Err(e) => warn!("Failed to create index {}: {}", name, e),
    }
}
