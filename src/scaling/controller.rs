use crate::config::ScalingConfig;
use crate::jobs::JobManager;
use crate::kv::KvStore;
use crate::scaling::capacity::CapacityTracker;
use crate::scaling::fleet::FleetDriver;
use crate::scaling::monitor::{
    target_workers, MetricsSample, RecommendationInputs, ScalingAction, CURRENT_METRICS_KEY,
    LAST_SCALING_ACTION_KEY,
};
use crate::worker::registry::{self, WorkerRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub const SCALING_LOCK_KEY: &str = "scaling_lock";
pub const SCALING_HISTORY_KEY: &str = "scaling_history";
const SCALING_HISTORY_CAP: usize = 100;
const LAST_PROCESSING_JOBS_KEY: &str = "last_processing_jobs";
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub action: ScalingAction,
    pub target_workers: usize,
    pub current_workers: usize,
    pub queue_depth: u64,
    pub timestamp: i64,
    pub reason: String,
}

/// Enacts fleet-size changes: cooldown-governed, drain-aware on the way
/// down, and responsible for reaping stale workers.
#[derive(Clone)]
pub struct ScalingController {
    kv: KvStore,
    job_manager: Arc<JobManager>,
    capacity: Arc<CapacityTracker>,
    fleet: Arc<dyn FleetDriver>,
    config: ScalingConfig,
}

impl ScalingController {
    pub fn new(
        kv: KvStore,
        job_manager: Arc<JobManager>,
        capacity: Arc<CapacityTracker>,
        fleet: Arc<dyn FleetDriver>,
        config: ScalingConfig,
    ) -> Self {
        Self {
            kv,
            job_manager,
            capacity,
            fleet,
            config,
        }
    }

    pub fn start(&self, token: CancellationToken) {
        let controller = self.clone();
        let interval = Duration::from_secs(self.config.scaling_check_interval);
        tokio::spawn(async move {
            tracing::info!(
                "Scaling controller started: min_workers={}, max_workers={}",
                controller.config.min_workers,
                controller.config.max_workers
            );
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {}
                }
                if let Err(e) = controller.tick().await {
                    tracing::error!("Scaling tick failed: {}", e);
                }
            }
            tracing::info!("Scaling controller stopped");
        });
    }

    pub async fn tick(&self) -> crate::errors::Result<()> {
        self.reap_unhealthy_workers().await;
        self.capacity.cleanup_stale().await;

        let Some(metrics) = self.kv.get_as::<MetricsSample>(CURRENT_METRICS_KEY).await else {
            tracing::debug!("No metrics available, skipping scaling check");
            return Ok(());
        };

        let stats = self.job_manager.statistics().await?;
        let current_workers = self.fleet.current_workers().await.len();

        if self.in_cooldown().await {
            let override_reason = self
                .cooldown_override(&metrics, current_workers, stats.processing)
                .await;
            match override_reason {
                Some(reason) => {
                    tracing::info!("Overriding cooldown: {}", reason);
                }
                None => {
                    tracing::debug!("Cooldown period active, skipping scaling check");
                    self.kv.put(LAST_PROCESSING_JOBS_KEY, &stats.processing).await;
                    return Ok(());
                }
            }
        }

        let healthy_workers = registry::healthy_worker_count(&self.kv).await;
        // Recompute the target rather than trusting a possibly-stale
        // recommendation.
        let inputs = RecommendationInputs {
            queue_depth: metrics.queue_depth,
            active_workers: current_workers,
            healthy_workers,
            processing_jobs: stats.processing,
            workers_with_jobs: stats.workers_with_jobs as usize,
            in_cooldown: false,
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            scale_down_threshold: self.config.scale_down_threshold,
        };
        let target = target_workers(&inputs);
        self.kv.put(LAST_PROCESSING_JOBS_KEY, &stats.processing).await;

        if target == current_workers {
            tracing::debug!(
                "No scaling needed: queue={}, workers={}",
                metrics.queue_depth,
                current_workers
            );
            return Ok(());
        }

        // One fleet mutation at a time across controller instances.
        let lock_ttl = self.config.job_drain_timeout as i64 + 120;
        if !self
            .kv
            .set_if_absent(SCALING_LOCK_KEY, &"held", Some(lock_ttl))
            .await
        {
            tracing::warn!("Scaling lock held elsewhere, skipping fleet change");
            return Ok(());
        }

        let reason = format!(
            "queue_depth={}, current_workers={current_workers}",
            metrics.queue_depth
        );
        let action = if target > current_workers {
            self.scale_up(current_workers, target).await;
            ScalingAction::ScaleUp
        } else {
            self.scale_down(current_workers, target).await;
            ScalingAction::ScaleDown
        };

        self.kv.remove(SCALING_LOCK_KEY).await;
        self.record_event(action, target, current_workers, metrics.queue_depth, reason)
            .await;
        Ok(())
    }

    async fn in_cooldown(&self) -> bool {
        match self.kv.get_as::<i64>(LAST_SCALING_ACTION_KEY).await {
            Some(last) => chrono::Utc::now().timestamp() - last < self.config.cooldown_period,
            None => false,
        }
    }

    /// Urgency conditions that pierce the cooldown window.
    async fn cooldown_override(
        &self,
        metrics: &MetricsSample,
        current_workers: usize,
        processing_jobs: u64,
    ) -> Option<String> {
        if metrics.queue_depth > 3 * current_workers as u64 {
            return Some(format!(
                "high queue depth: {} pending jobs",
                metrics.queue_depth
            ));
        }

        let last_processing = self
            .kv
            .get_as::<u64>(LAST_PROCESSING_JOBS_KEY)
            .await
            .unwrap_or(processing_jobs);
        let recent_completions = last_processing.saturating_sub(processing_jobs);
        if recent_completions as f64 > 0.5 * current_workers as f64 {
            return Some("recent job completions freed capacity".to_string());
        }

        let cluster = self.capacity.cluster_capacity().await;
        if cluster.capacity_utilization > 0.9 {
            return Some(format!(
                "very high capacity utilization: {:.2}",
                cluster.capacity_utilization
            ));
        }
        None
    }

    async fn scale_up(&self, current: usize, target: usize) {
        tracing::info!("Scaling up from {} to {} workers", current, target);
        for _ in current..target {
            if let Err(e) = self.fleet.spawn_worker().await {
                tracing::error!("Failed to spawn worker: {}", e);
                break;
            }
        }
    }

    /// Drain-first shrink: candidates stop accepting work, get up to
    /// JOB_DRAIN_TIMEOUT to empty out, then are terminated.
    async fn scale_down(&self, current: usize, target: usize) {
        tracing::info!("Scaling down from {} to {} workers", current, target);
        let fleet_ids = self.fleet.current_workers().await;
        let records: Vec<WorkerRecord> = registry::all_workers(&self.kv)
            .await
            .into_iter()
            .filter(|w| fleet_ids.contains(&w.worker_id))
            .collect();
        let scores: HashMap<String, f64> = self
            .capacity
            .all_worker_capacities()
            .await
            .into_iter()
            .map(|c| (c.worker_id.clone(), c.efficiency_score))
            .collect();

        let candidates =
            select_scale_down_candidates(&records, &scores, current.saturating_sub(target));

        for worker_id in candidates {
            self.fleet.begin_drain(&worker_id).await;
            if self.wait_for_drain(&worker_id).await {
                tracing::info!("Worker {} drained, terminating", worker_id);
            } else {
                tracing::warn!(
                    "Drain timeout for worker {}, forcing termination; recovery will reclaim its jobs",
                    worker_id
                );
            }
            if let Err(e) = self.fleet.terminate_worker(&worker_id).await {
                tracing::error!("Failed to terminate worker {}: {}", worker_id, e);
            }
        }
    }

    async fn wait_for_drain(&self, worker_id: &str) -> bool {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.job_drain_timeout);
        loop {
            let busy = registry::get_worker(&self.kv, worker_id)
                .await
                .map(|record| !record.current_jobs.is_empty())
                .unwrap_or(false);
            if !busy {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tracing::info!("Worker {} still processing, waiting for drain", worker_id);
            sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Remove workers that stopped heartbeating, unless they still own a
    /// live job; those go through Job Manager recovery instead.
    pub async fn reap_unhealthy_workers(&self) {
        let now = chrono::Utc::now().timestamp_micros();
        let timeout_micros = self.config.unhealthy_worker_timeout * 1_000_000;

        for record in registry::all_workers(&self.kv).await {
            if now - record.last_seen <= timeout_micros {
                continue;
            }
            if !record.current_jobs.is_empty() {
                tracing::warn!(
                    "Worker {} unhealthy but owns jobs {:?}, waiting",
                    record.worker_id,
                    record.current_jobs
                );
                continue;
            }
            tracing::info!("Reaping unhealthy worker: {}", record.worker_id);
            registry::remove_worker(&self.kv, &record.worker_id).await;
            if let Err(e) = self.fleet.terminate_worker(&record.worker_id).await {
                tracing::error!("Failed to terminate reaped worker {}: {}", record.worker_id, e);
            }
        }
    }

    async fn record_event(
        &self,
        action: ScalingAction,
        target: usize,
        current: usize,
        queue_depth: u64,
        reason: String,
    ) {
        let event = ScalingEvent {
            action,
            target_workers: target,
            current_workers: current,
            queue_depth,
            timestamp: chrono::Utc::now().timestamp_micros(),
            reason,
        };
        self.kv
            .list_push_capped(SCALING_HISTORY_KEY, &event, SCALING_HISTORY_CAP)
            .await;
        self.kv
            .put(LAST_SCALING_ACTION_KEY, &chrono::Utc::now().timestamp())
            .await;
        tracing::info!(
            "Scaling event recorded: {} to {} workers ({})",
            event.action,
            event.target_workers,
            event.reason
        );
    }
}

/// Scale-down candidate order: idle workers first, then lowest efficiency.
/// Workers already draining are skipped.
pub fn select_scale_down_candidates(
    workers: &[WorkerRecord],
    scores: &HashMap<String, f64>,
    count: usize,
) -> Vec<String> {
    let mut sorted: Vec<&WorkerRecord> =
        workers.iter().filter(|w| !w.is_shutting_down).collect();
    sorted.sort_by(|a, b| {
        let a_busy = !a.current_jobs.is_empty();
        let b_busy = !b.current_jobs.is_empty();
        a_busy.cmp(&b_busy).then_with(|| {
            let a_score = scores.get(&a.worker_id).copied().unwrap_or(50.0);
            let b_score = scores.get(&b.worker_id).copied().unwrap_or(50.0);
            a_score
                .partial_cmp(&b_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    });
    sorted
        .into_iter()
        .take(count)
        .map(|w| w.worker_id.clone())
        .collect()
}
