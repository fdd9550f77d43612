use crate::bus::{Delivery, DialogJob, MessageBus, PromptJob, SCRIPTS_QUEUE, VIDEO_QUEUE};
use crate::jobs::JobManager;
use crate::retry::{with_retry, RetryPolicy};
use crate::themes;
use crate::worker::renderer::ScriptGenerator;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const CONSUMER_ID: &str = "script-stage";

/// Prompt -> dialog hand-off: consumes the scripts queue, runs the script
/// generator seam, and forwards the dialog to the video queue. Failures
/// here never reached a worker, so the job fails outright and the credit
/// comes back.
#[derive(Clone)]
pub struct ScriptStage {
    bus: Arc<MessageBus>,
    job_manager: Arc<JobManager>,
    generator: Arc<dyn ScriptGenerator>,
    poll_interval: Duration,
}

impl ScriptStage {
    pub fn new(
        bus: Arc<MessageBus>,
        job_manager: Arc<JobManager>,
        generator: Arc<dyn ScriptGenerator>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            bus,
            job_manager,
            generator,
            poll_interval,
        }
    }

    pub fn start(&self, token: CancellationToken) {
        let stage = self.clone();
        tokio::spawn(async move {
            tracing::info!("Script stage started");
            loop {
                let delivery = tokio::select! {
                    _ = token.cancelled() => break,
                    result = stage.bus.consume_one(SCRIPTS_QUEUE, CONSUMER_ID) => result,
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
                        tracing::error!("Script stage consume error: {}", e);
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = sleep(stage.poll_interval) => {}
                        }
                    }
                }
            }
            tracing::info!("Script stage stopped");
        });
    }

    pub async fn process(&self, delivery: Delivery) {
        let prompt_job: PromptJob = match serde_json::from_value(delivery.body.clone()) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!("Malformed message on scripts queue, dead-lettering: {}", e);
                let _ = self.bus.nack(&delivery.message_id).await;
                return;
            }
        };
        let job_id = prompt_job.job_id.clone();

        // Duplicate delivery of an already-forwarded prompt: drop it.
        match self.job_manager.get(&job_id).await {
            Ok(Some(job)) if job.queue == VIDEO_QUEUE => {
                tracing::info!("Job {} already handed off to video, acking duplicate", job_id);
                let _ = self.bus.ack(&delivery.message_id).await;
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!("Message for unknown job {}, acking", job_id);
                let _ = self.bus.ack(&delivery.message_id).await;
                return;
            }
            Err(e) => {
                tracing::error!("Failed to look up job {}: {}", job_id, e);
                return;
            }
        }

        let profile = match themes::profile_for(&prompt_job.character_theme) {
            Ok(profile) => profile,
            Err(e) => {
                tracing::error!("Job {} carries unknown theme: {}", job_id, e);
                let _ = self
                    .job_manager
                    .fail_unassigned(&job_id, &format!("unknown theme: {e}"))
                    .await;
                let _ = self.bus.nack(&delivery.message_id).await;
                return;
            }
        };

        let turns = match self.generator.generate(&prompt_job, profile).await {
            Ok(turns) => turns,
            Err(e) => {
                tracing::error!("Script generation failed for job {}: {}", job_id, e);
                let _ = self
                    .job_manager
                    .fail_unassigned(&job_id, &format!("script generation failed: {e}"))
                    .await;
                let _ = self.bus.nack(&delivery.message_id).await;
                return;
            }
        };

        let title = prompt_job
            .title
            .clone()
            .unwrap_or_else(|| truncate_title(&prompt_job.prompt));
        let dialog = DialogJob {
            job_id: job_id.clone(),
            title,
            character_theme: prompt_job.character_theme.clone(),
            turns,
        };

        match with_retry(RetryPolicy::publish(), || {
            self.bus.publish(VIDEO_QUEUE, &dialog)
        })
        .await
        {
            Ok(_) => {
                // Record the hand-off so recovery republishes the dialog,
                // not the original prompt.
                match serde_json::to_value(&dialog) {
                    Ok(payload) => {
                        if let Err(e) = self
                            .job_manager
                            .update_payload(&job_id, VIDEO_QUEUE, &payload)
                            .await
                        {
                            tracing::error!("Failed to record hand-off for job {}: {}", job_id, e);
                        }
                    }
                    Err(e) => tracing::error!("Failed to serialize dialog for {}: {}", job_id, e),
                }
                let _ = self.bus.ack(&delivery.message_id).await;
                tracing::info!("Job {} dialog forwarded to video queue", job_id);
            }
            Err(e) => {
                tracing::error!("Failed to forward job {} to video queue: {}", job_id, e);
                let _ = self
                    .job_manager
                    .fail_unassigned(&job_id, "enqueue_failed")
                    .await;
                let _ = self.bus.nack(&delivery.message_id).await;
            }
        }
    }
}

pub fn truncate_title(prompt: &str) -> String {
    let trimmed = prompt.trim();
    if trimmed.chars().count() <= 50 {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(50).collect();
        format!("{}...", cut.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_title_untouched() {
        assert_eq!(truncate_title("A short prompt"), "A short prompt");
    }

    #[test]
    fn test_long_title_truncated() {
        let prompt = "x".repeat(80);
        let title = truncate_title(&prompt);
        assert_eq!(title.chars().count(), 53);
        assert!(title.ends_with("..."));
    }
}
