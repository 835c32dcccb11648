use common::{AssetType, RemoteKind};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One tracked file or derived dataset.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "asset")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    #[sea_orm(indexed)]
    pub network: String,

    #[sea_orm(indexed)]
    pub station: String,

    #[sea_orm(indexed)]
    pub survey: String,

    #[sea_orm(column_name = "type", indexed)]
    pub asset_type: AssetType,

    /// Unset until the bytes exist locally.
    pub local_path: Option<String>,

    /// Unique per scope and type when present (see `ensure_indexes`).
    pub remote_path: Option<String>,

    pub remote_kind: Option<RemoteKind>,

    pub timestamp_start: Option<DateTimeUtc>,

    pub timestamp_end: Option<DateTimeUtc>,

    pub created_at: DateTimeUtc,

    /// Asset this one was derived from. Informational only, never cascades.
    #[sea_orm(indexed)]
    pub parent_id: Option<i32>,
}

impl ActiveModelBehavior for ActiveModel {}
