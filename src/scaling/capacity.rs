use crate::config::CapacityConfig;
use crate::kv::KvStore;
use serde::{Deserialize, Serialize};

pub const CAPACITY_MAP: &str = "worker_capacity";
const PERFORMANCE_HISTORY_PREFIX: &str = "worker_performance_history";
/// Capacity rows untouched for this long are dropped.
const STALE_AFTER_SECONDS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceTier {
    Excellent,
    Good,
    Average,
    Poor,
}

impl std::fmt::Display for PerformanceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PerformanceTier::Excellent => write!(f, "excellent"),
            PerformanceTier::Good => write!(f, "good"),
            PerformanceTier::Average => write!(f, "average"),
            PerformanceTier::Poor => write!(f, "poor"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
    pub max_disk_percent: f64,
    pub max_concurrent_jobs: i32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        // Render workers are heavyweight; two concurrent jobs is the norm.
        Self {
            max_cpu_percent: 80.0,
            max_memory_percent: 85.0,
            max_disk_percent: 90.0,
            max_concurrent_jobs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCapacity {
    pub worker_id: String,
    pub concurrent_job_limit: i32,
    pub current_jobs: i32,
    pub jobs_per_hour: f64,
    pub avg_job_duration: f64,
    pub success_rate: f64,
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub disk_usage_percent: f64,
    pub performance_tier: PerformanceTier,
    pub efficiency_score: f64,
    pub last_updated: i64,
}

/// One observation reported by a worker after finishing (or while running)
/// a job.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacitySample {
    pub job_completed: bool,
    pub job_duration_seconds: f64,
    pub job_success: bool,
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub disk_usage_percent: f64,
    pub current_jobs: i32,
}

#[derive(Debug, Default, Serialize)]
pub struct ClusterCapacity {
    pub total_workers: usize,
    pub effective_capacity: f64,
    pub avg_efficiency: f64,
    pub resource_constrained_workers: usize,
    pub high_performers: usize,
    pub total_concurrent_limit: i32,
    pub capacity_utilization: f64,
}

/// Per-worker performance scoring and cluster-wide effective capacity.
#[derive(Clone)]
pub struct CapacityTracker {
    kv: KvStore,
    limits: ResourceLimits,
    config: CapacityConfig,
}

impl CapacityTracker {
    pub fn new(kv: KvStore, config: CapacityConfig) -> Self {
        Self {
            kv,
            limits: ResourceLimits::default(),
            config,
        }
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    pub async fn update_worker_capacity(&self, worker_id: &str, sample: CapacitySample) {
        let now = chrono::Utc::now().timestamp_micros();
        let mut capacity = self.get_worker_capacity(worker_id).await.unwrap_or_else(|| {
            WorkerCapacity {
                worker_id: worker_id.to_string(),
                concurrent_job_limit: self.limits.max_concurrent_jobs,
                current_jobs: sample.current_jobs,
                jobs_per_hour: 0.0,
                avg_job_duration: 0.0,
                success_rate: 100.0,
                cpu_usage_percent: sample.cpu_usage_percent,
                memory_usage_percent: sample.memory_usage_percent,
                disk_usage_percent: sample.disk_usage_percent,
                performance_tier: PerformanceTier::Average,
                efficiency_score: 50.0,
                last_updated: now,
            }
        });

        capacity.current_jobs = sample.current_jobs;
        capacity.cpu_usage_percent = sample.cpu_usage_percent;
        capacity.memory_usage_percent = sample.memory_usage_percent;
        capacity.disk_usage_percent = sample.disk_usage_percent;
        capacity.last_updated = now;

        if sample.job_completed {
            update_performance_metrics(
                &mut capacity,
                sample.job_duration_seconds,
                sample.job_success,
            );
        }

        capacity.efficiency_score = efficiency_score(&capacity);
        capacity.performance_tier = tier_for(capacity.efficiency_score);
        capacity.concurrent_job_limit = concurrent_limit(&capacity, &self.limits);

        self.kv.map_put(CAPACITY_MAP, worker_id, &capacity).await;
        self.store_performance_sample(&capacity).await;

        tracing::debug!(
            "Updated capacity for worker {}: score={:.1}",
            worker_id,
            capacity.efficiency_score
        );
    }

    pub async fn get_worker_capacity(&self, worker_id: &str) -> Option<WorkerCapacity> {
        self.kv.map_get(CAPACITY_MAP, worker_id).await
    }

    pub async fn all_worker_capacities(&self) -> Vec<WorkerCapacity> {
        self.kv.map_values(CAPACITY_MAP).await
    }

    pub async fn concurrent_limit_for(&self, worker_id: &str) -> i32 {
        self.get_worker_capacity(worker_id)
            .await
            .map(|c| c.concurrent_job_limit)
            .unwrap_or(self.limits.max_concurrent_jobs)
    }

    pub async fn cluster_capacity(&self) -> ClusterCapacity {
        let capacities = self.all_worker_capacities().await;
        if capacities.is_empty() {
            return ClusterCapacity::default();
        }

        let total_workers = capacities.len();
        let total_concurrent_limit: i32 = capacities.iter().map(|c| c.concurrent_job_limit).sum();
        let avg_efficiency =
            capacities.iter().map(|c| c.efficiency_score).sum::<f64>() / total_workers as f64;
        let effective_capacity = capacities
            .iter()
            .map(|c| c.concurrent_job_limit as f64 * (c.efficiency_score / 100.0))
            .sum();
        let resource_constrained_workers = capacities
            .iter()
            .filter(|c| {
                c.cpu_usage_percent > self.limits.max_cpu_percent
                    || c.memory_usage_percent > self.limits.max_memory_percent
                    || c.disk_usage_percent > self.limits.max_disk_percent
            })
            .count();
        let high_performers = capacities
            .iter()
            .filter(|c| {
                matches!(
                    c.performance_tier,
                    PerformanceTier::Excellent | PerformanceTier::Good
                )
            })
            .count();
        let total_current: i32 = capacities.iter().map(|c| c.current_jobs).sum();
        let capacity_utilization = if total_concurrent_limit > 0 {
            total_current as f64 / total_concurrent_limit as f64
        } else {
            0.0
        };

        ClusterCapacity {
            total_workers,
            effective_capacity,
            avg_efficiency,
            resource_constrained_workers,
            high_performers,
            total_concurrent_limit,
            capacity_utilization,
        }
    }

    /// Drop capacity rows for workers not seen in the last ten minutes.
    pub async fn cleanup_stale(&self) -> usize {
        let cutoff = chrono::Utc::now().timestamp_micros() - STALE_AFTER_SECONDS * 1_000_000;
        let mut removed = 0;
        for capacity in self.all_worker_capacities().await {
            if capacity.last_updated < cutoff {
                self.kv.map_remove(CAPACITY_MAP, &capacity.worker_id).await;
                removed += 1;
                tracing::info!(
                    "Removed stale capacity data for worker: {}",
                    capacity.worker_id
                );
            }
        }
        removed
    }

    /// Keep the last PERFORMANCE_SAMPLES observations per worker, expiring
    /// the whole series after the tracking window.
    async fn store_performance_sample(&self, capacity: &WorkerCapacity) {
        let sample = serde_json::json!({
            "worker_id": capacity.worker_id,
            "timestamp": capacity.last_updated,
            "efficiency_score": capacity.efficiency_score,
            "jobs_per_hour": capacity.jobs_per_hour,
            "success_rate": capacity.success_rate,
            "cpu_usage": capacity.cpu_usage_percent,
            "memory_usage": capacity.memory_usage_percent,
        });
        let key = format!("{}:{}", PERFORMANCE_HISTORY_PREFIX, capacity.worker_id);
        let mut samples: Vec<serde_json::Value> =
            self.kv.get_as(&key).await.unwrap_or_default();
        samples.insert(0, sample);
        samples.truncate(self.config.performance_samples);
        self.kv
            .put_with_ttl(&key, &samples, Some(self.config.tracking_window_seconds))
            .await;
    }

    pub async fn performance_history(&self, worker_id: &str) -> Vec<serde_json::Value> {
        let key = format!("{PERFORMANCE_HISTORY_PREFIX}:{worker_id}");
        self.kv.get_as(&key).await.unwrap_or_default()
    }
}

fn update_performance_metrics(capacity: &mut WorkerCapacity, duration_seconds: f64, success: bool) {
    if capacity.avg_job_duration == 0.0 {
        capacity.avg_job_duration = duration_seconds;
    } else {
        let alpha = 0.3;
        capacity.avg_job_duration =
            alpha * duration_seconds + (1.0 - alpha) * capacity.avg_job_duration;
    }

    if capacity.avg_job_duration > 0.0 {
        capacity.jobs_per_hour = 3600.0 / capacity.avg_job_duration;
    }

    let current = if success { 100.0 } else { 0.0 };
    if capacity.success_rate == 100.0 && !success {
        capacity.success_rate = 95.0;
    } else {
        let alpha = 0.2;
        capacity.success_rate = alpha * current + (1.0 - alpha) * capacity.success_rate;
    }
}

/// Scalar performance summary in [0, 100]: success rate weighted at 0.4,
/// throughput normalized against a 2 jobs/hour baseline, penalties above
/// 70% cpu/mem and 80% disk, and a stability bonus for consistently fast
/// and reliable workers.
pub fn efficiency_score(capacity: &WorkerCapacity) -> f64 {
    let mut score = capacity.success_rate * 0.4;

    if capacity.jobs_per_hour > 0.0 {
        score += (capacity.jobs_per_hour / 2.0).min(1.0) * 30.0;
    }

    let cpu_penalty = (capacity.cpu_usage_percent - 70.0).max(0.0) * 0.3;
    let memory_penalty = (capacity.memory_usage_percent - 70.0).max(0.0) * 0.3;
    let disk_penalty = (capacity.disk_usage_percent - 80.0).max(0.0) * 0.2;
    score -= cpu_penalty + memory_penalty + disk_penalty;

    if capacity.success_rate > 95.0 && capacity.jobs_per_hour > 1.0 {
        score += 10.0;
    }

    score.clamp(0.0, 100.0)
}

pub fn tier_for(score: f64) -> PerformanceTier {
    if score >= 80.0 {
        PerformanceTier::Excellent
    } else if score >= 60.0 {
        PerformanceTier::Good
    } else if score >= 40.0 {
        PerformanceTier::Average
    } else {
        PerformanceTier::Poor
    }
}

/// Resource-constrained workers drop to one job; excellent performers may
/// take one extra up to three; poor performers are pinned at one.
pub fn concurrent_limit(capacity: &WorkerCapacity, limits: &ResourceLimits) -> i32 {
    if capacity.cpu_usage_percent > limits.max_cpu_percent
        || capacity.memory_usage_percent > limits.max_memory_percent
    {
        return 1;
    }
    match capacity.performance_tier {
        PerformanceTier::Excellent => (limits.max_concurrent_jobs + 1).min(3),
        PerformanceTier::Poor => 1,
        _ => limits.max_concurrent_jobs,
    }
}
