use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Idempotency markers for external callbacks (payment sessions, webhook
/// event ids). Rows older than the marker TTL are purged by a cleanup task.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "processed_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
