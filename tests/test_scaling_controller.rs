use async_trait::async_trait;
use reelpipe::billing::CreditLedger;
use reelpipe::config::{CapacityConfig, ScalingConfig};
use reelpipe::database::establish_connection;
use reelpipe::errors::Result;
use reelpipe::jobs::JobManager;
use reelpipe::kv::KvStore;
use reelpipe::scaling::controller::{ScalingController, ScalingEvent, SCALING_HISTORY_KEY};
use reelpipe::scaling::fleet::FleetDriver;
use reelpipe::scaling::monitor::{
    MetricsSample, ScalingAction, CURRENT_METRICS_KEY, LAST_SCALING_ACTION_KEY,
};
use reelpipe::scaling::CapacityTracker;
use reelpipe::worker::registry::{self, WorkerHealth, WorkerRecord};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Fleet driver double: tracks spawn/drain/terminate calls without running
/// real workers.
#[derive(Default)]
struct MockFleet {
    workers: RwLock<Vec<String>>,
    drained: RwLock<Vec<String>>,
    terminated: RwLock<Vec<String>>,
    spawn_counter: AtomicUsize,
}

#[async_trait]
impl FleetDriver for MockFleet {
    async fn current_workers(&self) -> Vec<String> {
        self.workers.read().await.clone()
    }

    async fn spawn_worker(&self) -> Result<String> {
        let id = format!("mock-{}", self.spawn_counter.fetch_add(1, Ordering::SeqCst));
        self.workers.write().await.push(id.clone());
        Ok(id)
    }

    async fn begin_drain(&self, worker_id: &str) {
        self.drained.write().await.push(worker_id.to_string());
    }

    async fn terminate_worker(&self, worker_id: &str) -> Result<()> {
        self.workers.write().await.retain(|w| w != worker_id);
        self.terminated.write().await.push(worker_id.to_string());
        Ok(())
    }

    async fn shutdown_all(&self, _graceful_timeout: std::time::Duration) {
        self.workers.write().await.clear();
    }
}

struct Harness {
    kv: KvStore,
    fleet: Arc<MockFleet>,
    controller: ScalingController,
}

fn scaling_config() -> ScalingConfig {
    ScalingConfig {
        min_workers: 1,
        max_workers: 10,
        scale_up_threshold: 2.0,
        scale_down_threshold: 0.5,
        cooldown_period: 60,
        metrics_collection_interval: 15,
        scaling_check_interval: 30,
        job_drain_timeout: 1,
        unhealthy_worker_timeout: 300,
    }
}

async fn setup() -> Harness {
    let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
    let kv = KvStore::new();
    let ledger = Arc::new(CreditLedger::new(db.clone()));
    let job_manager = Arc::new(JobManager::new(db.clone(), kv.clone(), ledger));
    let capacity = Arc::new(CapacityTracker::new(
        kv.clone(),
        CapacityConfig {
            tracking_window_seconds: 3600,
            performance_samples: 10,
        },
    ));
    let fleet = Arc::new(MockFleet::default());
    let controller = ScalingController::new(
        kv.clone(),
        job_manager,
        capacity,
        fleet.clone(),
        scaling_config(),
    );
    Harness {
        kv,
        fleet,
        controller,
    }
}

fn metrics(queue_depth: u64, active: usize, healthy: usize) -> MetricsSample {
    MetricsSample {
        queue_depth,
        active_workers: active,
        healthy_workers: healthy,
        avg_processing_time: 0.0,
        throughput: 0.0,
        timestamp: chrono::Utc::now().timestamp_micros(),
        recommendation: ScalingAction::Maintain,
        target_workers: active,
    }
}

fn worker_record(id: &str, jobs: &[&str], last_seen_age_seconds: i64) -> WorkerRecord {
    WorkerRecord {
        worker_id: id.to_string(),
        started_at: 0,
        last_seen: chrono::Utc::now().timestamp_micros() - last_seen_age_seconds * 1_000_000,
        health: WorkerHealth::Healthy,
        current_jobs: jobs.iter().map(|s| s.to_string()).collect(),
        jobs_processed: 0,
        jobs_failed: 0,
        is_shutting_down: false,
        health_port: 8081,
    }
}

#[tokio::test]
async fn test_deep_queue_scales_fleet_to_target() {
    let h = setup().await;

    // Two live workers, queue depth 10: target is the max bound.
    for _ in 0..2 {
        h.fleet.spawn_worker().await.unwrap();
    }
    for id in h.fleet.current_workers().await {
        registry::put_worker(&h.kv, &worker_record(&id, &[], 0)).await;
    }
    h.kv.put(CURRENT_METRICS_KEY, &metrics(10, 2, 2)).await;

    h.controller.tick().await.unwrap();

    assert_eq!(h.fleet.current_workers().await.len(), 10);

    // The event and the cooldown stamp were recorded.
    let events: Vec<ScalingEvent> = h.kv.list_entries(SCALING_HISTORY_KEY).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, ScalingAction::ScaleUp);
    assert_eq!(events[0].target_workers, 10);
    assert!(h.kv.get_as::<i64>(LAST_SCALING_ACTION_KEY).await.is_some());
}

#[tokio::test]
async fn test_cooldown_blocks_scaling() {
    let h = setup().await;
    for _ in 0..2 {
        h.fleet.spawn_worker().await.unwrap();
    }
    for id in h.fleet.current_workers().await {
        registry::put_worker(&h.kv, &worker_record(&id, &[], 0)).await;
    }
    // Depth 4 on two workers would normally scale up but stays within the
    // cooldown override threshold (4 <= 3 * 2).
    h.kv.put(CURRENT_METRICS_KEY, &metrics(4, 2, 2)).await;
    h.kv
        .put(LAST_SCALING_ACTION_KEY, &chrono::Utc::now().timestamp())
        .await;

    h.controller.tick().await.unwrap();

    assert_eq!(h.fleet.current_workers().await.len(), 2);
    let events: Vec<ScalingEvent> = h.kv.list_entries(SCALING_HISTORY_KEY).await;
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_queue_pressure_overrides_cooldown() {
    let h = setup().await;
    for _ in 0..2 {
        h.fleet.spawn_worker().await.unwrap();
    }
    for id in h.fleet.current_workers().await {
        registry::put_worker(&h.kv, &worker_record(&id, &[], 0)).await;
    }
    // Depth 10 > 3 * 2 pierces the cooldown window.
    h.kv.put(CURRENT_METRICS_KEY, &metrics(10, 2, 2)).await;
    h.kv
        .put(LAST_SCALING_ACTION_KEY, &chrono::Utc::now().timestamp())
        .await;

    h.controller.tick().await.unwrap();

    assert_eq!(h.fleet.current_workers().await.len(), 10);
}

#[tokio::test]
async fn test_scale_down_drains_idle_workers_first() {
    let h = setup().await;
    for _ in 0..4 {
        h.fleet.spawn_worker().await.unwrap();
    }
    let ids = h.fleet.current_workers().await;
    // One worker is busy, three idle.
    registry::put_worker(&h.kv, &worker_record(&ids[0], &["j1"], 0)).await;
    for id in &ids[1..] {
        registry::put_worker(&h.kv, &worker_record(id, &[], 0)).await;
    }
    h.kv.put(CURRENT_METRICS_KEY, &metrics(0, 4, 4)).await;

    h.controller.tick().await.unwrap();

    // Idle cluster shrinks to two; the busy worker survives.
    let survivors = h.fleet.current_workers().await;
    assert_eq!(survivors.len(), 2);
    assert!(survivors.contains(&ids[0]));

    let drained = h.fleet.drained.read().await.clone();
    assert_eq!(drained.len(), 2);
    assert!(!drained.contains(&ids[0]));

    let events: Vec<ScalingEvent> = h.kv.list_entries(SCALING_HISTORY_KEY).await;
    assert_eq!(events[0].action, ScalingAction::ScaleDown);
}

#[tokio::test]
async fn test_no_tick_without_metrics() {
    let h = setup().await;
    h.fleet.spawn_worker().await.unwrap();

    h.controller.tick().await.unwrap();

    assert_eq!(h.fleet.current_workers().await.len(), 1);
    let events: Vec<ScalingEvent> = h.kv.list_entries(SCALING_HISTORY_KEY).await;
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_stale_idle_worker_is_reaped() {
    let h = setup().await;
    registry::put_worker(&h.kv, &worker_record("dead-idle", &[], 600)).await;

    h.controller.reap_unhealthy_workers().await;

    assert!(registry::get_worker(&h.kv, "dead-idle").await.is_none());
    assert!(h
        .fleet
        .terminated
        .read()
        .await
        .contains(&"dead-idle".to_string()));
}

#[tokio::test]
async fn test_stale_worker_with_live_job_is_spared() {
    let h = setup().await;
    registry::put_worker(&h.kv, &worker_record("dead-busy", &["j1"], 600)).await;

    h.controller.reap_unhealthy_workers().await;

    // Recovery owns this path; the registry row stays put.
    assert!(registry::get_worker(&h.kv, "dead-busy").await.is_some());
    assert!(h.fleet.terminated.read().await.is_empty());
}

#[tokio::test]
async fn test_fresh_worker_not_reaped() {
    let h = setup().await;
    registry::put_worker(&h.kv, &worker_record("alive", &[], 0)).await;

    h.controller.reap_unhealthy_workers().await;

    assert!(registry::get_worker(&h.kv, "alive").await.is_some());
}
