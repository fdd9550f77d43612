use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Archived copy of a terminal job record. Bounded to the most recent 1000
/// rows by the archival path.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "job_history")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub character_theme: String,
    pub prompt: String,
    pub status: String,
    pub worker_id: Option<String>,
    pub assigned_at: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub credit_refunded: bool,
    pub download_url: Option<String>,
    pub created_at: i64,
    pub archived_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
