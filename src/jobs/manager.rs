use crate::billing::ledger::CreditLedger;
use crate::database::job_history;
use crate::database::jobs::{self, JobStatus};
use crate::errors::{ReelPipeError, Result};
use crate::kv::KvStore;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, Statement,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Terminal jobs kept in the archive.
const HISTORY_CAP: u64 = 1000;

#[derive(Debug, Clone)]
pub struct CreateJob {
    pub job_id: String,
    pub user_id: String,
    pub title: String,
    pub character_theme: String,
    pub prompt: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub max_retries: i32,
    pub estimated_duration: Option<i64>,
}

#[derive(Debug, Default, Serialize)]
pub struct JobStatistics {
    pub pending: u64,
    pub assigned: u64,
    pub processing: u64,
    pub retrying: u64,
    pub workers_with_jobs: u64,
    pub avg_processing_time: f64,
}

/// UI-facing status snapshot mirrored into the KV layer under `job:{id}`.
/// The jobs table stays authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub updated_at: i64,
}

/// Authoritative job lifecycle state machine. Every state-changing call is
/// a single guarded UPDATE, so two callers racing a transition see one
/// winner and one Forbidden.
#[derive(Clone)]
pub struct JobManager {
    db: Arc<DatabaseConnection>,
    kv: KvStore,
    ledger: Arc<CreditLedger>,
}

impl JobManager {
    pub fn new(db: Arc<DatabaseConnection>, kv: KvStore, ledger: Arc<CreditLedger>) -> Self {
        Self { db, kv, ledger }
    }

    pub async fn create(&self, params: CreateJob) -> Result<jobs::Model> {
        let now = chrono::Utc::now().timestamp_micros();
        let job = jobs::ActiveModel {
            id: Set(params.job_id.clone()),
            user_id: Set(params.user_id),
            title: Set(params.title),
            character_theme: Set(params.character_theme),
            prompt: Set(params.prompt),
            status: Set(JobStatus::Pending.to_string()),
            worker_id: Set(None),
            assigned_at: Set(None),
            started_at: Set(None),
            completed_at: Set(None),
            heartbeat_at: Set(None),
            retry_count: Set(0),
            max_retries: Set(params.max_retries),
            requeued_at: Set(None),
            error_message: Set(None),
            queue: Set(params.queue),
            payload: Set(serde_json::to_string(&params.payload)?),
            estimated_duration: Set(params.estimated_duration),
            credit_refunded: Set(false),
            download_url: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let model = job.insert(self.db.as_ref()).await?;
        self.mirror_snapshot(&model).await;
        tracing::info!("Created job {} for user {}", model.id, model.user_id);
        Ok(model)
    }

    /// PENDING/RETRYING -> ASSIGNED. The only transition that does not
    /// require a matching stored worker_id; it claims the job instead.
    pub async fn assign(&self, job_id: &str, worker_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_micros();
        let result = jobs::Entity::update_many()
            .col_expr(jobs::Column::Status, Expr::value(JobStatus::Assigned.to_string()))
            .col_expr(jobs::Column::WorkerId, Expr::value(worker_id))
            .col_expr(jobs::Column::AssignedAt, Expr::value(now))
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Id.eq(job_id))
            .filter(jobs::Column::Status.is_in([
                JobStatus::Pending.to_string(),
                JobStatus::Retrying.to_string(),
            ]))
            .filter(jobs::Column::WorkerId.is_null())
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            return Err(self.guard_failure(job_id, "assign").await?);
        }
        tracing::info!("Assigned job {} to worker {}", job_id, worker_id);
        self.refresh_snapshot(job_id).await;
        Ok(())
    }

    /// ASSIGNED -> PROCESSING, same worker only.
    pub async fn start(&self, job_id: &str, worker_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_micros();
        let result = jobs::Entity::update_many()
            .col_expr(jobs::Column::Status, Expr::value(JobStatus::Processing.to_string()))
            .col_expr(jobs::Column::StartedAt, Expr::value(now))
            .col_expr(jobs::Column::HeartbeatAt, Expr::value(now))
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Id.eq(job_id))
            .filter(jobs::Column::Status.eq(JobStatus::Assigned.to_string()))
            .filter(jobs::Column::WorkerId.eq(worker_id))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            return Err(self.guard_failure(job_id, "start").await?);
        }
        tracing::info!("Started job {} on worker {}", job_id, worker_id);
        self.refresh_snapshot(job_id).await;
        Ok(())
    }

    pub async fn heartbeat(&self, job_id: &str, worker_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_micros();
        let result = jobs::Entity::update_many()
            .col_expr(jobs::Column::HeartbeatAt, Expr::value(now))
            .filter(jobs::Column::Id.eq(job_id))
            .filter(jobs::Column::WorkerId.eq(worker_id))
            .filter(jobs::Column::Status.is_in([
                JobStatus::Assigned.to_string(),
                JobStatus::Processing.to_string(),
            ]))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            return Err(self.guard_failure(job_id, "heartbeat").await?);
        }
        Ok(())
    }

    /// PROCESSING -> COMPLETED/FAILED, same worker only. A failure refunds
    /// the spent credit exactly once. Idempotent for jobs already archived.
    pub async fn complete(
        &self,
        job_id: &str,
        worker_id: &str,
        success: bool,
        error_message: Option<String>,
        download_url: Option<String>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_micros();
        let status = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };

        let result = jobs::Entity::update_many()
            .col_expr(jobs::Column::Status, Expr::value(status.to_string()))
            .col_expr(jobs::Column::CompletedAt, Expr::value(now))
            .col_expr(jobs::Column::ErrorMessage, Expr::value(error_message.clone()))
            .col_expr(jobs::Column::DownloadUrl, Expr::value(download_url))
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Id.eq(job_id))
            .filter(jobs::Column::Status.eq(JobStatus::Processing.to_string()))
            .filter(jobs::Column::WorkerId.eq(worker_id))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            // A terminal duplicate (same job delivered twice) is a no-op.
            if self.get_archived(job_id).await?.is_some() {
                return Ok(());
            }
            return Err(self.guard_failure(job_id, "complete").await?);
        }

        let job = jobs::Entity::find_by_id(job_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ReelPipeError::JobNotFound(job_id.to_string()))?;

        let job = if success {
            job
        } else {
            self.refund_once(job).await?
        };
        tracing::info!(
            "Completed job {} on worker {}: {}",
            job_id,
            worker_id,
            if success { "success" } else { "failed" }
        );
        self.archive(job).await?;
        Ok(())
    }

    /// ASSIGNED/PROCESSING -> RETRYING: clear the worker, bump retry_count.
    /// Guarded on retry_count < max_retries.
    pub async fn to_retrying(&self, job_id: &str, reason: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_micros();
        let result = jobs::Entity::update_many()
            .col_expr(jobs::Column::Status, Expr::value(JobStatus::Retrying.to_string()))
            .col_expr(jobs::Column::WorkerId, Expr::value(Option::<String>::None))
            .col_expr(jobs::Column::AssignedAt, Expr::value(Option::<i64>::None))
            .col_expr(jobs::Column::StartedAt, Expr::value(Option::<i64>::None))
            .col_expr(jobs::Column::HeartbeatAt, Expr::value(Option::<i64>::None))
            .col_expr(jobs::Column::RequeuedAt, Expr::value(Option::<i64>::None))
            .col_expr(
                jobs::Column::RetryCount,
                Expr::col(jobs::Column::RetryCount).add(1),
            )
            .col_expr(jobs::Column::ErrorMessage, Expr::value(Some(reason.to_string())))
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Id.eq(job_id))
            .filter(jobs::Column::Status.is_in([
                JobStatus::Assigned.to_string(),
                JobStatus::Processing.to_string(),
            ]))
            .filter(Expr::col(jobs::Column::RetryCount).lt(Expr::col(jobs::Column::MaxRetries)))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            return Err(self.guard_failure(job_id, "retry").await?);
        }
        tracing::warn!("Job {} moved to retrying: {}", job_id, reason);
        self.refresh_snapshot(job_id).await;
        Ok(())
    }

    /// ASSIGNED/PROCESSING -> ABANDONED once retries are exhausted. Refunds
    /// the credit and archives.
    pub async fn abandon(&self, job_id: &str, reason: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_micros();
        let result = jobs::Entity::update_many()
            .col_expr(jobs::Column::Status, Expr::value(JobStatus::Abandoned.to_string()))
            .col_expr(jobs::Column::CompletedAt, Expr::value(now))
            .col_expr(jobs::Column::ErrorMessage, Expr::value(Some(reason.to_string())))
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Id.eq(job_id))
            .filter(jobs::Column::Status.is_in([
                JobStatus::Assigned.to_string(),
                JobStatus::Processing.to_string(),
            ]))
            .filter(Expr::col(jobs::Column::RetryCount).gte(Expr::col(jobs::Column::MaxRetries)))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            return Err(self.guard_failure(job_id, "abandon").await?);
        }

        let job = jobs::Entity::find_by_id(job_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ReelPipeError::JobNotFound(job_id.to_string()))?;
        let job = self.refund_once(job).await?;
        tracing::warn!("Abandoned job {} after {} retries", job_id, job.retry_count);
        self.archive(job).await?;
        Ok(())
    }

    /// PENDING/RETRYING -> FAILED for jobs that never reached a worker
    /// (enqueue or dialog-generation failure). Refunds the credit.
    pub async fn fail_unassigned(&self, job_id: &str, reason: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_micros();
        let result = jobs::Entity::update_many()
            .col_expr(jobs::Column::Status, Expr::value(JobStatus::Failed.to_string()))
            .col_expr(jobs::Column::CompletedAt, Expr::value(now))
            .col_expr(jobs::Column::ErrorMessage, Expr::value(Some(reason.to_string())))
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Id.eq(job_id))
            .filter(jobs::Column::Status.is_in([
                JobStatus::Pending.to_string(),
                JobStatus::Retrying.to_string(),
            ]))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            return Err(self.guard_failure(job_id, "fail").await?);
        }

        let job = jobs::Entity::find_by_id(job_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ReelPipeError::JobNotFound(job_id.to_string()))?;
        let job = self.refund_once(job).await?;
        self.archive(job).await?;
        Ok(())
    }

    /// Remove a job that was created but never debited nor enqueued (the
    /// submission rollback path). No refund is owed.
    pub async fn delete_unstarted(&self, job_id: &str) -> Result<()> {
        jobs::Entity::delete_many()
            .filter(jobs::Column::Id.eq(job_id))
            .filter(jobs::Column::Status.eq(JobStatus::Pending.to_string()))
            .exec(self.db.as_ref())
            .await?;
        self.kv.remove(&format!("job:{job_id}")).await;
        Ok(())
    }

    /// Stage hand-off: record which queue the current payload belongs on.
    /// The Job Manager is the sole writer of job rows, so pipeline stages
    /// report hand-offs through here.
    pub async fn update_payload(
        &self,
        job_id: &str,
        queue: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_micros();
        jobs::Entity::update_many()
            .col_expr(jobs::Column::Queue, Expr::value(queue))
            .col_expr(jobs::Column::Payload, Expr::value(serde_json::to_string(payload)?))
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Id.eq(job_id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Recovery republished this retrying job's payload.
    pub async fn mark_requeued(&self, job_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_micros();
        jobs::Entity::update_many()
            .col_expr(jobs::Column::RequeuedAt, Expr::value(Some(now)))
            .col_expr(jobs::Column::UpdatedAt, Expr::value(now))
            .filter(jobs::Column::Id.eq(job_id))
            .filter(jobs::Column::Status.eq(JobStatus::Retrying.to_string()))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<jobs::Model>> {
        Ok(jobs::Entity::find_by_id(job_id).one(self.db.as_ref()).await?)
    }

    pub async fn get_archived(&self, job_id: &str) -> Result<Option<job_history::Model>> {
        Ok(job_history::Entity::find_by_id(job_id)
            .one(self.db.as_ref())
            .await?)
    }

    pub async fn list_active(&self) -> Result<Vec<jobs::Model>> {
        Ok(jobs::Entity::find().all(self.db.as_ref()).await?)
    }

    pub async fn list_by_worker(&self, worker_id: &str) -> Result<Vec<jobs::Model>> {
        Ok(jobs::Entity::find()
            .filter(jobs::Column::WorkerId.eq(worker_id))
            .all(self.db.as_ref())
            .await?)
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<jobs::Model>> {
        Ok(jobs::Entity::find()
            .filter(jobs::Column::UserId.eq(user_id))
            .order_by_desc(jobs::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?)
    }

    pub async fn list_archived_for_user(&self, user_id: &str) -> Result<Vec<job_history::Model>> {
        Ok(job_history::Entity::find()
            .filter(job_history::Column::UserId.eq(user_id))
            .order_by_desc(job_history::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?)
    }

    pub async fn statistics(&self) -> Result<JobStatistics> {
        let statement = Statement::from_sql_and_values(
            self.db.get_database_backend(),
            "SELECT status, COUNT(*) as count FROM jobs GROUP BY status",
            [],
        );
        let rows = self.db.query_all(statement).await?;

        let mut stats = JobStatistics::default();
        for row in rows {
            let status: String = row.try_get("", "status")?;
            let count: i64 = row.try_get("", "count")?;
            match status.as_str() {
                "pending" => stats.pending = count as u64,
                "assigned" => stats.assigned = count as u64,
                "processing" => stats.processing = count as u64,
                "retrying" => stats.retrying = count as u64,
                other => {
                    tracing::warn!("Unknown job status in statistics: {}", other);
                }
            }
        }

        let workers: Vec<Option<String>> = jobs::Entity::find()
            .select_only()
            .column(jobs::Column::WorkerId)
            .filter(jobs::Column::WorkerId.is_not_null())
            .distinct()
            .into_tuple()
            .all(self.db.as_ref())
            .await?;
        stats.workers_with_jobs = workers.into_iter().flatten().count() as u64;

        // Average elapsed time of jobs currently processing, in seconds.
        let started: Vec<Option<i64>> = jobs::Entity::find()
            .select_only()
            .column(jobs::Column::StartedAt)
            .filter(jobs::Column::Status.eq(JobStatus::Processing.to_string()))
            .into_tuple()
            .all(self.db.as_ref())
            .await?;
        let now = chrono::Utc::now().timestamp_micros();
        let times: Vec<f64> = started
            .into_iter()
            .flatten()
            .map(|t| (now - t) as f64 / 1_000_000.0)
            .collect();
        if !times.is_empty() {
            stats.avg_processing_time = times.iter().sum::<f64>() / times.len() as f64;
        }

        Ok(stats)
    }

    async fn refund_once(&self, job: jobs::Model) -> Result<jobs::Model> {
        if job.credit_refunded {
            return Ok(job);
        }
        self.ledger
            .refund(
                &job.user_id,
                &format!("Refund: video generation failed for job {}", job.id),
            )
            .await?;
        jobs::Entity::update_many()
            .col_expr(jobs::Column::CreditRefunded, Expr::value(true))
            .filter(jobs::Column::Id.eq(&job.id))
            .exec(self.db.as_ref())
            .await?;
        tracing::info!("Refunded credit for job {}", job.id);
        Ok(jobs::Model {
            credit_refunded: true,
            ..job
        })
    }

    /// Copy a terminal job into the bounded history and drop it from the
    /// active set.
    async fn archive(&self, job: jobs::Model) -> Result<()> {
        let now = chrono::Utc::now().timestamp_micros();
        let entry = job_history::ActiveModel {
            id: Set(job.id.clone()),
            user_id: Set(job.user_id.clone()),
            title: Set(job.title.clone()),
            character_theme: Set(job.character_theme.clone()),
            prompt: Set(job.prompt.clone()),
            status: Set(job.status.clone()),
            worker_id: Set(job.worker_id.clone()),
            assigned_at: Set(job.assigned_at),
            started_at: Set(job.started_at),
            completed_at: Set(job.completed_at),
            retry_count: Set(job.retry_count),
            max_retries: Set(job.max_retries),
            error_message: Set(job.error_message.clone()),
            credit_refunded: Set(job.credit_refunded),
            download_url: Set(job.download_url.clone()),
            created_at: Set(job.created_at),
            archived_at: Set(now),
        };
        entry.insert(self.db.as_ref()).await?;

        jobs::Entity::delete_by_id(&job.id)
            .exec(self.db.as_ref())
            .await?;

        self.mirror_snapshot(&job).await;
        self.trim_history().await?;
        Ok(())
    }

    async fn trim_history(&self) -> Result<()> {
        let total = job_history::Entity::find()
            .count(self.db.as_ref())
            .await?;
        if total <= HISTORY_CAP {
            return Ok(());
        }
        let excess = total - HISTORY_CAP;
        let victims: Vec<String> = job_history::Entity::find()
            .order_by_asc(job_history::Column::ArchivedAt)
            .limit(excess)
            .select_only()
            .column(job_history::Column::Id)
            .into_tuple()
            .all(self.db.as_ref())
            .await?;
        job_history::Entity::delete_many()
            .filter(job_history::Column::Id.is_in(victims))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn guard_failure(&self, job_id: &str, op: &str) -> Result<ReelPipeError> {
        match self.get(job_id).await? {
            Some(job) => Ok(ReelPipeError::Forbidden(format!(
                "{op} rejected for job {job_id} in status {} (worker {:?})",
                job.status, job.worker_id
            ))),
            None => {
                if self.get_archived(job_id).await?.is_some() {
                    Ok(ReelPipeError::Forbidden(format!(
                        "{op} rejected: job {job_id} already terminal"
                    )))
                } else {
                    Ok(ReelPipeError::JobNotFound(job_id.to_string()))
                }
            }
        }
    }

    async fn mirror_snapshot(&self, job: &jobs::Model) {
        let snapshot = JobSnapshot {
            job_id: job.id.clone(),
            status: job.status.clone(),
            error_msg: job.error_message.clone(),
            download_url: job.download_url.clone(),
            updated_at: job.updated_at,
        };
        self.kv.put(&format!("job:{}", job.id), &snapshot).await;
    }

    async fn refresh_snapshot(&self, job_id: &str) {
        if let Ok(Some(job)) = self.get(job_id).await {
            self.mirror_snapshot(&job).await;
        }
    }
}
