use crate::bus::MessageBus;
use crate::config::JobConfig;
use crate::database::jobs::{self, JobStatus};
use crate::errors::Result;
use crate::jobs::manager::JobManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub retried: u64,
    pub abandoned: u64,
    pub republished: u64,
}

/// Periodic sweep that reclaims jobs whose worker timed out or went silent.
/// Jobs with retries left go back to RETRYING and their payload is
/// republished; exhausted jobs are abandoned and refunded.
#[derive(Clone)]
pub struct RecoveryService {
    manager: Arc<JobManager>,
    bus: Arc<MessageBus>,
    config: JobConfig,
}

impl RecoveryService {
    pub fn new(manager: Arc<JobManager>, bus: Arc<MessageBus>, config: JobConfig) -> Self {
        Self {
            manager,
            bus,
            config,
        }
    }

    pub fn start(&self, token: CancellationToken) {
        let service = self.clone();
        let interval = Duration::from_secs(self.config.recovery_interval_seconds);
        tokio::spawn(async move {
            tracing::info!(
                "Job recovery loop started (interval {}s)",
                service.config.recovery_interval_seconds
            );
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {}
                }
                match service.run_sweep().await {
                    Ok(outcome) => {
                        if outcome.retried > 0 || outcome.abandoned > 0 || outcome.republished > 0 {
                            tracing::info!(
                                "Recovery sweep: {} retried, {} abandoned, {} republished",
                                outcome.retried,
                                outcome.abandoned,
                                outcome.republished
                            );
                        }
                    }
                    Err(e) => tracing::error!("Recovery sweep failed: {}", e),
                }
            }
            tracing::info!("Job recovery loop stopped");
        });
    }

    pub async fn run_sweep(&self) -> Result<SweepOutcome> {
        let now = chrono::Utc::now().timestamp_micros();
        let job_timeout = self.config.job_timeout * 1_000_000;
        let heartbeat_timeout = self.config.heartbeat_timeout * 1_000_000;
        let mut outcome = SweepOutcome::default();

        for job in self.manager.list_active().await? {
            let status = match job.status() {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!("Skipping job {} with bad status tag: {}", job.id, e);
                    continue;
                }
            };

            match status {
                JobStatus::Assigned | JobStatus::Processing => {
                    let mut reason = None;
                    if let Some(started) = job.started_at {
                        if now - started > job_timeout {
                            reason = Some(format!(
                                "job timed out after {}s",
                                (now - started) / 1_000_000
                            ));
                        }
                    }
                    if reason.is_none() {
                        // heartbeat_at covers processing; assigned_at covers
                        // the window before the worker reported start.
                        let last_sign_of_life = job.heartbeat_at.or(job.assigned_at);
                        if let Some(seen) = last_sign_of_life {
                            if now - seen > heartbeat_timeout {
                                reason = Some(format!(
                                    "worker silent for {}s",
                                    (now - seen) / 1_000_000
                                ));
                            }
                        }
                    }

                    if let Some(reason) = reason {
                        tracing::warn!("Recovering job {}: {}", job.id, reason);
                        if job.retry_count < job.max_retries {
                            if self.manager.to_retrying(&job.id, &reason).await.is_ok() {
                                outcome.retried += 1;
                                if self.republish(&job).await {
                                    outcome.republished += 1;
                                }
                            }
                        } else if self
                            .manager
                            .abandon(
                                &job.id,
                                &format!(
                                    "Job abandoned after {} retries: {reason}",
                                    job.retry_count
                                ),
                            )
                            .await
                            .is_ok()
                        {
                            outcome.abandoned += 1;
                        }
                    }
                }
                JobStatus::Retrying => {
                    // A previous sweep moved the job but failed to publish.
                    if job.requeued_at.is_none() && self.republish(&job).await {
                        outcome.republished += 1;
                    }
                }
                _ => {}
            }
        }

        Ok(outcome)
    }

    /// State write precedes republish; a failed publish leaves the job in
    /// RETRYING with requeued_at unset so the next sweep tries again.
    async fn republish(&self, job: &jobs::Model) -> bool {
        let payload: serde_json::Value = match serde_json::from_str(&job.payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Job {} payload is not valid JSON: {}", job.id, e);
                return false;
            }
        };
        match self.bus.publish(&job.queue, &payload).await {
            Ok(_) => {
                if let Err(e) = self.manager.mark_requeued(&job.id).await {
                    tracing::error!("Failed to mark job {} requeued: {}", job.id, e);
                }
                tracing::info!("Republished job {} to {}", job.id, job.queue);
                true
            }
            Err(e) => {
                tracing::warn!(
                    "Republish of job {} failed, will retry next sweep: {}",
                    job.id,
                    e
                );
                false
            }
        }
    }
}
