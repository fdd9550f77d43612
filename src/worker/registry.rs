use crate::kv::KvStore;
use serde::{Deserialize, Serialize};

/// KV map holding one record per live worker.
pub const WORKER_REGISTRY_MAP: &str = "scaling_workers";
/// A record older than this is stale and eligible for reaping.
pub const STALE_THRESHOLD_SECONDS: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Healthy,
    Unhealthy,
}

/// Worker registry row. Only the owning worker writes its record; the
/// scaling controller may flip `is_shutting_down` and remove stale rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub started_at: i64,
    pub last_seen: i64,
    pub health: WorkerHealth,
    pub current_jobs: Vec<String>,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub is_shutting_down: bool,
    pub health_port: u16,
}

impl WorkerRecord {
    pub fn is_fresh(&self, now_micros: i64) -> bool {
        now_micros - self.last_seen <= STALE_THRESHOLD_SECONDS * 1_000_000
    }
}

pub async fn all_workers(kv: &KvStore) -> Vec<WorkerRecord> {
    kv.map_values(WORKER_REGISTRY_MAP).await
}

/// Workers with a fresh heartbeat (seen within the stale threshold).
pub async fn active_workers(kv: &KvStore) -> Vec<WorkerRecord> {
    let now = chrono::Utc::now().timestamp_micros();
    all_workers(kv)
        .await
        .into_iter()
        .filter(|w| w.is_fresh(now))
        .collect()
}

pub async fn healthy_worker_count(kv: &KvStore) -> usize {
    active_workers(kv)
        .await
        .iter()
        .filter(|w| w.health == WorkerHealth::Healthy && !w.is_shutting_down)
        .count()
}

pub async fn get_worker(kv: &KvStore, worker_id: &str) -> Option<WorkerRecord> {
    kv.map_get(WORKER_REGISTRY_MAP, worker_id).await
}

pub async fn put_worker(kv: &KvStore, record: &WorkerRecord) {
    kv.map_put(WORKER_REGISTRY_MAP, &record.worker_id, record)
        .await;
}

pub async fn remove_worker(kv: &KvStore, worker_id: &str) -> bool {
    kv.map_remove(WORKER_REGISTRY_MAP, worker_id).await
}
