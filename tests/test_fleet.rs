use reelpipe::billing::CreditLedger;
use reelpipe::bus::MessageBus;
use reelpipe::config::{CapacityConfig, WorkerConfig};
use reelpipe::database::establish_connection;
use reelpipe::jobs::JobManager;
use reelpipe::kv::KvStore;
use reelpipe::scaling::fleet::{FleetDriver, LocalFleetDriver};
use reelpipe::scaling::CapacityTracker;
use reelpipe::worker::registry;
use reelpipe::worker::FileSinkRenderer;
use std::sync::Arc;
use std::time::Duration;

async fn setup(base_port: u16) -> (KvStore, LocalFleetDriver) {
    let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
    let kv = KvStore::new();
    let bus = Arc::new(MessageBus::new(db.clone()));
    let ledger = Arc::new(CreditLedger::new(db.clone()));
    let job_manager = Arc::new(JobManager::new(db.clone(), kv.clone(), ledger));
    let capacity = Arc::new(CapacityTracker::new(
        kv.clone(),
        CapacityConfig {
            tracking_window_seconds: 3600,
            performance_samples: 10,
        },
    ));

    let driver = LocalFleetDriver::new(
        db,
        kv.clone(),
        bus,
        job_manager,
        capacity,
        Arc::new(FileSinkRenderer),
        WorkerConfig {
            heartbeat_interval_seconds: 1,
            health_check_port: base_port,
            poll_interval_ms: 20,
            graceful_shutdown_timeout: 5,
        },
        std::env::temp_dir().join(format!("reelpipe-fleet-{base_port}")),
    );
    (kv, driver)
}

#[tokio::test]
async fn test_spawned_workers_get_distinct_identities() {
    let (kv, fleet) = setup(19300).await;

    let w1 = fleet.spawn_worker().await.unwrap();
    let w2 = fleet.spawn_worker().await.unwrap();
    assert_ne!(w1, w2);
    assert!(w1.starts_with("worker-"));

    let workers = fleet.current_workers().await;
    assert_eq!(workers.len(), 2);

    // Both registered themselves with distinct health ports.
    let r1 = registry::get_worker(&kv, &w1).await.unwrap();
    let r2 = registry::get_worker(&kv, &w2).await.unwrap();
    assert_ne!(r1.health_port, r2.health_port);

    fleet.shutdown_all(Duration::from_secs(5)).await;
    assert!(fleet.current_workers().await.is_empty());
}

#[tokio::test]
async fn test_drain_marks_worker_and_terminate_cleans_registry() {
    let (kv, fleet) = setup(19320).await;
    let worker_id = fleet.spawn_worker().await.unwrap();

    fleet.begin_drain(&worker_id).await;
    let record = registry::get_worker(&kv, &worker_id).await.unwrap();
    assert!(record.is_shutting_down);

    fleet.terminate_worker(&worker_id).await.unwrap();
    assert!(fleet.current_workers().await.is_empty());
    assert!(registry::get_worker(&kv, &worker_id).await.is_none());
}

#[tokio::test]
async fn test_terminate_unknown_worker_is_harmless() {
    let (_kv, fleet) = setup(19340).await;
    fleet.terminate_worker("worker-never-existed").await.unwrap();
    assert!(fleet.current_workers().await.is_empty());
}

#[tokio::test]
async fn test_drain_flag_on_registry_row_without_handle() {
    let (kv, fleet) = setup(19360).await;

    // A registry row for a worker this driver doesn't own (e.g. another
    // process): drain flips the flag in place.
    registry::put_worker(
        &kv,
        &reelpipe::worker::WorkerRecord {
            worker_id: "foreign".to_string(),
            started_at: 0,
            last_seen: chrono::Utc::now().timestamp_micros(),
            health: reelpipe::worker::WorkerHealth::Healthy,
            current_jobs: vec![],
            jobs_processed: 0,
            jobs_failed: 0,
            is_shutting_down: false,
            health_port: 1,
        },
    )
    .await;

    fleet.begin_drain("foreign").await;
    let record = registry::get_worker(&kv, "foreign").await.unwrap();
    assert!(record.is_shutting_down);
}
