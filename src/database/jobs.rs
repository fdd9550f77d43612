use crate::errors::ReelPipeError;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Active job records, owned by the Job Manager. Terminal jobs are copied
/// into `job_history` and removed from this table.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "jobs")]
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
    pub heartbeat_at: Option<i64>,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Set once recovery has republished the payload for a retrying job.
    pub requeued_at: Option<i64>,
    pub error_message: Option<String>,
    /// Queue the current payload belongs on (scripts before dialog hand-off,
    /// video after).
    pub queue: String,
    pub payload: String, // JSON work message
    pub estimated_duration: Option<i64>,
    pub credit_refunded: bool,
    pub download_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Assigned,
    Processing,
    Completed,
    Failed,
    Retrying,
    Abandoned,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Abandoned
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Assigned => write!(f, "assigned"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Retrying => write!(f, "retrying"),
            JobStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl TryFrom<&str> for JobStatus {
    type Error = ReelPipeError;

    fn try_from(s: &str) -> Result<Self, ReelPipeError> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "assigned" => Ok(JobStatus::Assigned),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            "abandoned" => Ok(JobStatus::Abandoned),
            other => Err(ReelPipeError::InvalidInput(format!(
                "Unknown job status tag: {other}"
            ))),
        }
    }
}

impl Model {
    pub fn status(&self) -> Result<JobStatus, ReelPipeError> {
        JobStatus::try_from(self.status.as_str())
    }
}
