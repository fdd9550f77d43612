use crate::bus::{Delivery, MessageBus, RenderJob, PUBLISH_QUEUE};
use crate::errors::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const CONSUMER_ID: &str = "publish-stage";

/// External upload destination for finished artifacts.
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn publish(&self, job: &RenderJob) -> Result<()>;
}

/// Default sink: verifies the artifact is on disk and logs the hand-off.
pub struct LogPublisher;

#[async_trait]
impl ArtifactPublisher for LogPublisher {
    async fn publish(&self, job: &RenderJob) -> Result<()> {
        if !Path::new(&job.storage_path).exists() {
            return Err(crate::errors::ReelPipeError::InvalidInput(format!(
                "Artifact missing for job {}: {}",
                job.job_id, job.storage_path
            )));
        }
        tracing::info!(
            "Published artifact for job {}: {} ({})",
            job.job_id,
            job.title,
            job.storage_path
        );
        Ok(())
    }
}

/// Final pipeline hop: consumes rendered-artifact notifications and pushes
/// them to the uploader seam. Upload failures dead-letter the notification
/// for operator review; the rendered artifact itself is unaffected.
#[derive(Clone)]
pub struct PublishStage {
    bus: Arc<MessageBus>,
    publisher: Arc<dyn ArtifactPublisher>,
    poll_interval: Duration,
}

impl PublishStage {
    pub fn new(
        bus: Arc<MessageBus>,
        publisher: Arc<dyn ArtifactPublisher>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            bus,
            publisher,
            poll_interval,
        }
    }

    pub fn start(&self, token: CancellationToken) {
        let stage = self.clone();
        tokio::spawn(async move {
            tracing::info!("Publish stage started");
            loop {
                let delivery = tokio::select! {
                    _ = token.cancelled() => break,
                    result = stage.bus.consume_one(PUBLISH_QUEUE, CONSUMER_ID) => result,
                };
                match delivery {
                    Ok(Some(delivery)) => stage.process(delivery).await,
                    Ok(None) => {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = sleep(stage.poll_interval) => {}
                        }
                    }
                    Err(e) => {
                        tracing::error!("Publish stage consume error: {}", e);
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = sleep(stage.poll_interval) => {}
                        }
                    }
                }
            }
            tracing::info!("Publish stage stopped");
        });
    }

    pub async fn process(&self, delivery: Delivery) {
        let render_job: RenderJob = match serde_json::from_value(delivery.body.clone()) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!("Malformed message on publish queue, dead-lettering: {}", e);
                let _ = self.bus.nack(&delivery.message_id).await;
                return;
            }
        };

        match self.publisher.publish(&render_job).await {
            Ok(()) => {
                let _ = self.bus.ack(&delivery.message_id).await;
            }
            Err(e) => {
                tracing::error!("Upload failed for job {}: {}", render_job.job_id, e);
                let _ = self.bus.nack(&delivery.message_id).await;
            }
        }
    }
}
