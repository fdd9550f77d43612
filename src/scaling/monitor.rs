use crate::bus::{MessageBus, VIDEO_QUEUE};
use crate::config::ScalingConfig;
use crate::jobs::JobManager;
use crate::kv::KvStore;
use crate::worker::registry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub const CURRENT_METRICS_KEY: &str = "current_metrics";
pub const METRICS_HISTORY_KEY: &str = "scaling_metrics_history";
pub const LAST_SCALING_ACTION_KEY: &str = "last_scaling_action";
const METRICS_HISTORY_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    Maintain,
}

impl std::fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalingAction::ScaleUp => write!(f, "scale_up"),
            ScalingAction::ScaleDown => write!(f, "scale_down"),
            ScalingAction::Maintain => write!(f, "maintain"),
        }
    }
}

/// One ring-buffered metrics sample (newest first, capped at 100).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    pub queue_depth: u64,
    pub active_workers: usize,
    pub healthy_workers: usize,
    pub avg_processing_time: f64,
    pub throughput: f64,
    pub timestamp: i64,
    pub recommendation: ScalingAction,
    pub target_workers: usize,
}

#[derive(Debug, Clone)]
pub struct Recommendation {
    pub action: ScalingAction,
    pub target_workers: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RecommendationInputs {
    pub queue_depth: u64,
    pub active_workers: usize,
    pub healthy_workers: usize,
    pub processing_jobs: u64,
    pub workers_with_jobs: usize,
    pub in_cooldown: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_down_threshold: f64,
}

/// Target fleet size for a given workload: idle clusters shrink toward two
/// workers, otherwise roughly one worker per queued-or-running job, within
/// the configured bounds and never below the workers that still own jobs.
pub fn target_workers(inputs: &RecommendationInputs) -> usize {
    let workload = inputs.queue_depth + inputs.processing_jobs;
    let raw = if workload == 0 {
        inputs.active_workers.min(2)
    } else {
        let workload = workload as usize;
        workload.max(workload / 2 + 1)
    };
    raw.clamp(inputs.min_workers, inputs.max_workers)
        .max(inputs.workers_with_jobs)
}

/// The scaling recommendation. Prefers stability: any tie or failed gate
/// resolves to `maintain`.
pub fn recommend(inputs: &RecommendationInputs) -> Recommendation {
    if inputs.in_cooldown {
        return Recommendation {
            action: ScalingAction::Maintain,
            target_workers: inputs.active_workers,
            reason: "cooldown_period_active".to_string(),
        };
    }

    let target = target_workers(inputs);
    let active = inputs.active_workers;

    if target > active {
        // Scale up only on a mostly-healthy fleet.
        if inputs.healthy_workers as f64 >= 0.8 * active as f64 {
            return Recommendation {
                action: ScalingAction::ScaleUp,
                target_workers: target,
                reason: format!(
                    "queue_depth={}, active_workers={}",
                    inputs.queue_depth, active
                ),
            };
        }
        return Recommendation {
            action: ScalingAction::Maintain,
            target_workers: active,
            reason: "unhealthy_fleet".to_string(),
        };
    }

    if target < active {
        let idle_workers = active.saturating_sub(inputs.workers_with_jobs);
        if idle_workers > 0
            && (inputs.queue_depth as f64) < inputs.scale_down_threshold * active as f64
        {
            let target = target.max(inputs.workers_with_jobs + 1);
            if target < active {
                return Recommendation {
                    action: ScalingAction::ScaleDown,
                    target_workers: target,
                    reason: format!("queue_depth={}, over_provisioned", inputs.queue_depth),
                };
            }
        }
        return Recommendation {
            action: ScalingAction::Maintain,
            target_workers: active,
            reason: "scale_down_gated".to_string(),
        };
    }

    Recommendation {
        action: ScalingAction::Maintain,
        target_workers: active,
        reason: "stable_state".to_string(),
    }
}

/// Collects queue and fleet metrics on an interval, stores the sample, and
/// publishes non-maintain recommendations for the controller.
#[derive(Clone)]
pub struct QueueMonitor {
    kv: KvStore,
    bus: Arc<MessageBus>,
    job_manager: Arc<JobManager>,
    config: ScalingConfig,
    tx: broadcast::Sender<MetricsSample>,
}

impl QueueMonitor {
    pub fn new(
        kv: KvStore,
        bus: Arc<MessageBus>,
        job_manager: Arc<JobManager>,
        config: ScalingConfig,
    ) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            kv,
            bus,
            job_manager,
            config,
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricsSample> {
        self.tx.subscribe()
    }

    pub async fn in_cooldown(&self) -> bool {
        match self.kv.get_as::<i64>(LAST_SCALING_ACTION_KEY).await {
            Some(last) => chrono::Utc::now().timestamp() - last < self.config.cooldown_period,
            None => false,
        }
    }

    pub async fn collect_and_publish(&self) -> crate::errors::Result<MetricsSample> {
        let queue_depth = self.bus.depth(VIDEO_QUEUE).await.unwrap_or_else(|e| {
            tracing::error!("Failed to get queue depth: {}", e);
            0
        });
        let active = registry::active_workers(&self.kv).await;
        let active_workers = active.len();
        let healthy_workers = registry::healthy_worker_count(&self.kv).await;
        let stats = self.job_manager.statistics().await?;

        let throughput = if stats.avg_processing_time > 0.0 {
            (active_workers as f64 * 60.0) / stats.avg_processing_time
        } else {
            0.0
        };

        let inputs = RecommendationInputs {
            queue_depth,
            active_workers,
            healthy_workers,
            processing_jobs: stats.processing,
            workers_with_jobs: stats.workers_with_jobs as usize,
            in_cooldown: self.in_cooldown().await,
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            scale_down_threshold: self.config.scale_down_threshold,
        };
        let recommendation = recommend(&inputs);

        let sample = MetricsSample {
            queue_depth,
            active_workers,
            healthy_workers,
            avg_processing_time: stats.avg_processing_time,
            throughput,
            timestamp: chrono::Utc::now().timestamp_micros(),
            recommendation: recommendation.action,
            target_workers: recommendation.target_workers,
        };

        self.kv.put(CURRENT_METRICS_KEY, &sample).await;
        self.kv
            .list_push_capped(METRICS_HISTORY_KEY, &sample, METRICS_HISTORY_CAP)
            .await;

        if recommendation.action != ScalingAction::Maintain {
            // Non-binding: the controller recomputes before acting.
            let _ = self.tx.send(sample.clone());
        }

        tracing::info!(
            "Metrics: depth={}, workers={}, healthy={}, recommendation={} ({})",
            sample.queue_depth,
            sample.active_workers,
            sample.healthy_workers,
            sample.recommendation,
            recommendation.reason
        );
        Ok(sample)
    }

    pub fn start(&self, token: CancellationToken) {
        let monitor = self.clone();
        let interval = Duration::from_secs(self.config.metrics_collection_interval);
        tokio::spawn(async move {
            tracing::info!("Queue monitor started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {}
                }
                if let Err(e) = monitor.collect_and_publish().await {
                    tracing::error!("Metrics collection failed: {}", e);
                }
            }
            tracing::info!("Queue monitor stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> RecommendationInputs {
        RecommendationInputs {
            queue_depth: 0,
            active_workers: 2,
            healthy_workers: 2,
            processing_jobs: 0,
            workers_with_jobs: 0,
            in_cooldown: false,
            min_workers: 1,
            max_workers: 10,
            scale_down_threshold: 0.5,
        }
    }

    #[test]
    fn test_cooldown_forces_maintain() {
        let mut i = inputs();
        i.queue_depth = 50;
        i.in_cooldown = true;
        let r = recommend(&i);
        assert_eq!(r.action, ScalingAction::Maintain);
        assert_eq!(r.reason, "cooldown_period_active");
    }

    #[test]
    fn test_deep_queue_scales_up_to_max() {
        let mut i = inputs();
        i.queue_depth = 10;
        let r = recommend(&i);
        assert_eq!(r.action, ScalingAction::ScaleUp);
        assert_eq!(r.target_workers, 10);
    }

    #[test]
    fn test_scale_up_gated_on_fleet_health() {
        let mut i = inputs();
        i.queue_depth = 10;
        i.active_workers = 5;
        i.healthy_workers = 3; // below 80% of 5
        let r = recommend(&i);
        assert_eq!(r.action, ScalingAction::Maintain);
    }

    #[test]
    fn test_idle_cluster_scales_down_keeping_busy_workers() {
        // queue empty, one processing job on 4 workers: S6 shape
        let mut i = inputs();
        i.active_workers = 4;
        i.healthy_workers = 4;
        i.processing_jobs = 1;
        i.workers_with_jobs = 1;
        let r = recommend(&i);
        assert_eq!(r.action, ScalingAction::ScaleDown);
        assert_eq!(r.target_workers, 2); // max(target, workers_with_jobs + 1)
    }

    #[test]
    fn test_no_scale_down_without_idle_workers() {
        let mut i = inputs();
        i.active_workers = 3;
        i.healthy_workers = 3;
        i.processing_jobs = 1;
        i.workers_with_jobs = 3;
        let r = recommend(&i);
        assert_eq!(r.action, ScalingAction::Maintain);
    }

    #[test]
    fn test_no_scale_down_with_backlog() {
        let mut i = inputs();
        i.active_workers = 4;
        i.healthy_workers = 4;
        i.queue_depth = 3; // >= 0.5 * 4
        i.processing_jobs = 0;
        // workload 3 -> target 3 < 4 but gate fails
        let r = recommend(&i);
        assert_eq!(r.action, ScalingAction::Maintain);
    }

    #[test]
    fn test_target_respects_bounds_and_busy_floor() {
        let mut i = inputs();
        i.queue_depth = 100;
        assert_eq!(target_workers(&i), 10);

        i.queue_depth = 0;
        i.processing_jobs = 0;
        i.active_workers = 1;
        assert_eq!(target_workers(&i), 1);

        i.workers_with_jobs = 3;
        assert_eq!(target_workers(&i), 3);
    }

    #[test]
    fn test_stable_state_maintains() {
        let mut i = inputs();
        i.queue_depth = 2;
        i.active_workers = 2;
        i.healthy_workers = 2;
        let r = recommend(&i);
        assert_eq!(r.action, ScalingAction::Maintain);
        assert_eq!(r.reason, "stable_state");
    }
}
