use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Durable counters; currently holds `video_generation_count`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "system_stats")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,
    pub value: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub const VIDEO_GENERATION_COUNT: &str = "video_generation_count";
