use crate::bus::{Delivery, DialogJob, MessageBus, RenderJob, PUBLISH_QUEUE, VIDEO_QUEUE};
use crate::database;
use crate::database::system_stats::VIDEO_GENERATION_COUNT;
use crate::errors::ReelPipeError;
use crate::jobs::JobManager;
use crate::kv::KvStore;
use crate::retry::{with_retry, RetryPolicy};
use crate::worker::health::WorkerHealthMonitor;
use crate::worker::renderer::VideoRenderer;
use sea_orm::DatabaseConnection;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Control-plane side of a render worker: pulls one message at a time from
/// the video queue, walks the job through ASSIGNED/PROCESSING/terminal via
/// the Job Manager, heartbeats while the renderer runs, and acks/nacks the
/// delivery.
pub struct RenderWorker {
    worker_id: String,
    db: Arc<DatabaseConnection>,
    kv: KvStore,
    bus: Arc<MessageBus>,
    job_manager: Arc<JobManager>,
    monitor: Arc<WorkerHealthMonitor>,
    renderer: Arc<dyn VideoRenderer>,
    video_out_dir: PathBuf,
    poll_interval: Duration,
    heartbeat_interval: Duration,
}

impl RenderWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        kv: KvStore,
        bus: Arc<MessageBus>,
        job_manager: Arc<JobManager>,
        monitor: Arc<WorkerHealthMonitor>,
        renderer: Arc<dyn VideoRenderer>,
        video_out_dir: PathBuf,
        poll_interval: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            worker_id: monitor.worker_id().to_string(),
            db,
            kv,
            bus,
            job_manager,
            monitor,
            renderer,
            video_out_dir,
            poll_interval,
            heartbeat_interval,
        }
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        tracing::info!("Worker {} started", self.worker_id);

        loop {
            if token.is_cancelled() {
                self.monitor.begin_shutdown().await;
            }

            if self.monitor.is_shutting_down().await {
                // Drain: in-flight work is already finished because the
                // loop is strictly one message at a time.
                break;
            }

            if !self.monitor.accept_new_jobs().await {
                tokio::select! {
                    _ = token.cancelled() => continue,
                    _ = sleep(self.poll_interval) => continue,
                }
            }

            match self.bus.consume_one(VIDEO_QUEUE, &self.worker_id).await {
                Ok(Some(delivery)) => self.process(delivery).await,
                Ok(None) => {
                    tokio::select! {
                        _ = token.cancelled() => continue,
                        _ = sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    tracing::error!("Worker {} consume error: {}", self.worker_id, e);
                    tokio::select! {
                        _ = token.cancelled() => continue,
                        _ = sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        self.monitor.deregister().await;
        tracing::info!("Worker {} stopped", self.worker_id);
    }

    pub async fn process(&self, delivery: Delivery) {
        let dialog: DialogJob = match serde_json::from_value(delivery.body.clone()) {
            Ok(dialog) => dialog,
            Err(e) => {
                tracing::error!("Malformed message on video queue, dead-lettering: {}", e);
                let _ = self.bus.nack(&delivery.message_id).await;
                return;
            }
        };
        let job_id = dialog.job_id.clone();

        // At-least-once delivery: a duplicate of a job another worker owns
        // (or one already terminal) must not run twice.
        match self.job_manager.assign(&job_id, &self.worker_id).await {
            Ok(()) => {}
            Err(ReelPipeError::Forbidden(reason)) => {
                tracing::info!("Skipping duplicate delivery of job {}: {}", job_id, reason);
                let _ = self.bus.ack(&delivery.message_id).await;
                return;
            }
            Err(ReelPipeError::JobNotFound(_)) => {
                tracing::warn!("Message for unknown job {}, acking", job_id);
                let _ = self.bus.ack(&delivery.message_id).await;
                return;
            }
            Err(e) => {
                // Transient store trouble: leave the delivery unacked so it
                // comes back after the visibility timeout.
                tracing::error!("Failed to assign job {}: {}", job_id, e);
                return;
            }
        }

        if let Err(e) = self.job_manager.start(&job_id, &self.worker_id).await {
            tracing::error!("Failed to start job {}: {}", job_id, e);
            let _ = self.bus.ack(&delivery.message_id).await;
            return;
        }
        self.monitor.job_started(&job_id).await;

        // Heartbeat in the background for the duration of the render.
        let hb_token = CancellationToken::new();
        {
            let manager = self.job_manager.clone();
            let job_id = job_id.clone();
            let worker_id = self.worker_id.clone();
            let interval = self.heartbeat_interval;
            let hb_token = hb_token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = hb_token.cancelled() => break,
                        _ = sleep(interval) => {}
                    }
                    if let Err(e) = manager.heartbeat(&job_id, &worker_id).await {
                        tracing::warn!("Heartbeat for job {} rejected: {}", job_id, e);
                        break;
                    }
                }
            });
        }

        let out_path = self.video_out_dir.join(format!("{job_id}.mp4"));
        let result = self.renderer.render(&dialog, &out_path).await;
        hb_token.cancel();

        match result {
            Ok(path) => {
                // The publish hop is best-effort: the artifact exists and
                // the job is complete either way.
                let render_msg = RenderJob {
                    job_id: job_id.clone(),
                    title: dialog.title.clone(),
                    storage_path: path.to_string_lossy().to_string(),
                };
                if let Err(e) = with_retry(RetryPolicy::publish(), || {
                    self.bus.publish(PUBLISH_QUEUE, &render_msg)
                })
                .await
                {
                    tracing::warn!("Failed to enqueue publish for job {}: {}", job_id, e);
                }

                let download_url = format!("/api/videos/{job_id}/file");
                if let Err(e) = self
                    .job_manager
                    .complete(&job_id, &self.worker_id, true, None, Some(download_url))
                    .await
                {
                    tracing::error!("Failed to complete job {}: {}", job_id, e);
                }
                self.monitor.job_completed(&job_id, true).await;

                match database::increment_stat(self.db.as_ref(), VIDEO_GENERATION_COUNT, 1).await {
                    Ok(count) => {
                        self.kv.put(VIDEO_GENERATION_COUNT, &count).await;
                    }
                    Err(e) => tracing::error!("Failed to increment video count: {}", e),
                }

                if let Err(e) = self.bus.ack(&delivery.message_id).await {
                    tracing::error!("Failed to ack message for job {}: {}", job_id, e);
                }
            }
            Err(e) => {
                tracing::error!("Rendering failed for job {}: {}", job_id, e);
                if let Err(complete_err) = self
                    .job_manager
                    .complete(&job_id, &self.worker_id, false, Some(e.to_string()), None)
                    .await
                {
                    tracing::error!("Failed to fail job {}: {}", job_id, complete_err);
                }
                self.monitor.job_completed(&job_id, false).await;
                // Non-retriable render failure: dead-letter for review.
                if let Err(nack_err) = self.bus.nack(&delivery.message_id).await {
                    tracing::error!("Failed to nack message for job {}: {}", job_id, nack_err);
                }
            }
        }
    }
}
