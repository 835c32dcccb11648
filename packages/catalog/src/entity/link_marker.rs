use common::AssetType;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Completion marker for a processed source -> target link.
///
/// Single links record one parent id; batch links record the whole merged set.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "link_marker")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub network: String,

    pub station: String,

    pub survey: String,

    pub source_type: AssetType,

    #[sea_orm(indexed)]
    pub target_type: AssetType,

    /// Sorted parent ids joined by `-`, e.g. "3-7-12".
    #[sea_orm(indexed)]
    pub parent_ids: String,

    pub created_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
