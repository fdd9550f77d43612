use reelpipe::billing::CreditLedger;
use reelpipe::bus::SCRIPTS_QUEUE;
use reelpipe::database::jobs::JobStatus;
use reelpipe::database::{establish_connection, job_history};
use reelpipe::errors::ReelPipeError;
use reelpipe::jobs::{CreateJob, JobManager};
use reelpipe::kv::KvStore;
use sea_orm::{EntityTrait, PaginatorTrait};
use std::sync::Arc;

async fn setup() -> (Arc<sea_orm::DatabaseConnection>, Arc<CreditLedger>, JobManager) {
    let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
    let ledger = Arc::new(CreditLedger::new(db.clone()));
    let manager = JobManager::new(db.clone(), KvStore::new(), ledger.clone());
    (db, ledger, manager)
}

fn create_params(job_id: &str, user_id: &str) -> CreateJob {
    CreateJob {
        job_id: job_id.to_string(),
        user_id: user_id.to_string(),
        title: "Test video".to_string(),
        character_theme: "family_guy".to_string(),
        prompt: "Explain lifetimes".to_string(),
        queue: SCRIPTS_QUEUE.to_string(),
        payload: serde_json::json!({
            "job_id": job_id,
            "prompt": "Explain lifetimes",
            "character_theme": "family_guy",
        }),
        max_retries: 3,
        estimated_duration: None,
    }
}

#[tokio::test]
async fn test_happy_path_lifecycle() {
    let (_db, _ledger, manager) = setup().await;
    manager.create(create_params("j1", "u1")).await.unwrap();

    manager.assign("j1", "worker-a").await.unwrap();
    let job = manager.get("j1").await.unwrap().unwrap();
    assert_eq!(job.status().unwrap(), JobStatus::Assigned);
    assert_eq!(job.worker_id.as_deref(), Some("worker-a"));
    assert!(job.assigned_at.is_some());

    manager.start("j1", "worker-a").await.unwrap();
    let job = manager.get("j1").await.unwrap().unwrap();
    assert_eq!(job.status().unwrap(), JobStatus::Processing);
    assert!(job.started_at.is_some());
    assert!(job.heartbeat_at.is_some());

    manager.heartbeat("j1", "worker-a").await.unwrap();

    manager
        .complete("j1", "worker-a", true, None, Some("/api/videos/j1/file".to_string()))
        .await
        .unwrap();

    // Terminal jobs are archived out of the active set.
    assert!(manager.get("j1").await.unwrap().is_none());
    let archived = manager.get_archived("j1").await.unwrap().unwrap();
    assert_eq!(archived.status, "completed");
    assert!(archived.completed_at.is_some());
    assert!(!archived.credit_refunded);
}

#[tokio::test]
async fn test_worker_id_guard_rejects_strangers() {
    let (_db, _ledger, manager) = setup().await;
    manager.create(create_params("j1", "u1")).await.unwrap();
    manager.assign("j1", "worker-a").await.unwrap();

    // A second worker cannot claim, start, heartbeat or complete the job.
    let err = manager.assign("j1", "worker-b").await.unwrap_err();
    assert!(matches!(err, ReelPipeError::Forbidden(_)));

    let err = manager.start("j1", "worker-b").await.unwrap_err();
    assert!(matches!(err, ReelPipeError::Forbidden(_)));

    manager.start("j1", "worker-a").await.unwrap();
    let err = manager.heartbeat("j1", "worker-b").await.unwrap_err();
    assert!(matches!(err, ReelPipeError::Forbidden(_)));

    let err = manager
        .complete("j1", "worker-b", true, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ReelPipeError::Forbidden(_)));

    // The rejected calls mutated nothing.
    let job = manager.get("j1").await.unwrap().unwrap();
    assert_eq!(job.worker_id.as_deref(), Some("worker-a"));
    assert_eq!(job.status().unwrap(), JobStatus::Processing);
}

#[tokio::test]
async fn test_transitions_require_correct_status() {
    let (_db, _ledger, manager) = setup().await;
    manager.create(create_params("j1", "u1")).await.unwrap();

    // start before assign
    let err = manager.start("j1", "worker-a").await.unwrap_err();
    assert!(matches!(err, ReelPipeError::Forbidden(_)));

    // complete before processing
    manager.assign("j1", "worker-a").await.unwrap();
    let err = manager
        .complete("j1", "worker-a", true, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ReelPipeError::Forbidden(_)));

    let err = manager.assign("missing", "worker-a").await.unwrap_err();
    assert!(matches!(err, ReelPipeError::JobNotFound(_)));
}

#[tokio::test]
async fn test_failed_job_refunds_exactly_once() {
    let (_db, ledger, manager) = setup().await;
    ledger.grant("u1", 1, "Welcome credit", None).await.unwrap();
    ledger.spend("u1", "Video generation").await.unwrap();
    assert_eq!(ledger.get_balance("u1").await.unwrap(), 0);

    manager.create(create_params("j1", "u1")).await.unwrap();
    manager.assign("j1", "worker-a").await.unwrap();
    manager.start("j1", "worker-a").await.unwrap();
    manager
        .complete("j1", "worker-a", false, Some("render exploded".to_string()), None)
        .await
        .unwrap();

    assert_eq!(ledger.get_balance("u1").await.unwrap(), 1);
    let archived = manager.get_archived("j1").await.unwrap().unwrap();
    assert_eq!(archived.status, "failed");
    assert!(archived.credit_refunded);

    // A duplicate completion of the archived job is a no-op.
    manager
        .complete("j1", "worker-a", false, Some("render exploded".to_string()), None)
        .await
        .unwrap();
    assert_eq!(ledger.get_balance("u1").await.unwrap(), 1);
}

#[tokio::test]
async fn test_retrying_clears_worker_and_bumps_count() {
    let (_db, _ledger, manager) = setup().await;
    manager.create(create_params("j1", "u1")).await.unwrap();
    manager.assign("j1", "worker-a").await.unwrap();
    manager.start("j1", "worker-a").await.unwrap();

    manager.to_retrying("j1", "worker silent").await.unwrap();
    let job = manager.get("j1").await.unwrap().unwrap();
    assert_eq!(job.status().unwrap(), JobStatus::Retrying);
    assert!(job.worker_id.is_none());
    assert!(job.started_at.is_none());
    assert!(job.heartbeat_at.is_none());
    assert_eq!(job.retry_count, 1);

    // A fresh worker can pick the retried job up again.
    manager.assign("j1", "worker-b").await.unwrap();
    let job = manager.get("j1").await.unwrap().unwrap();
    assert_eq!(job.worker_id.as_deref(), Some("worker-b"));
}

#[tokio::test]
async fn test_retry_exhaustion_guard() {
    let (_db, ledger, manager) = setup().await;
    ledger.grant("u1", 1, "Welcome credit", None).await.unwrap();
    ledger.spend("u1", "Video generation").await.unwrap();

    let mut params = create_params("j1", "u1");
    params.max_retries = 0;
    manager.create(params).await.unwrap();
    manager.assign("j1", "worker-a").await.unwrap();
    manager.start("j1", "worker-a").await.unwrap();

    // No retries left: the retry transition is rejected, abandon works.
    let err = manager.to_retrying("j1", "timeout").await.unwrap_err();
    assert!(matches!(err, ReelPipeError::Forbidden(_)));

    manager.abandon("j1", "Job abandoned after 0 retries").await.unwrap();
    let archived = manager.get_archived("j1").await.unwrap().unwrap();
    assert_eq!(archived.status, "abandoned");
    assert!(archived.retry_count >= archived.max_retries);
    assert_eq!(ledger.get_balance("u1").await.unwrap(), 1);
}

#[tokio::test]
async fn test_statistics() {
    let (_db, _ledger, manager) = setup().await;
    manager.create(create_params("j1", "u1")).await.unwrap();
    manager.create(create_params("j2", "u1")).await.unwrap();
    manager.create(create_params("j3", "u2")).await.unwrap();

    manager.assign("j2", "worker-a").await.unwrap();
    manager.assign("j3", "worker-b").await.unwrap();
    manager.start("j3", "worker-b").await.unwrap();

    let stats = manager.statistics().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.assigned, 1);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.retrying, 0);
    assert_eq!(stats.workers_with_jobs, 2);
    assert!(stats.avg_processing_time >= 0.0);
}

#[tokio::test]
async fn test_fail_unassigned_refunds_and_archives() {
    let (_db, ledger, manager) = setup().await;
    ledger.grant("u1", 1, "Welcome credit", None).await.unwrap();
    ledger.spend("u1", "Video generation").await.unwrap();

    manager.create(create_params("j1", "u1")).await.unwrap();
    manager.fail_unassigned("j1", "enqueue_failed").await.unwrap();

    assert!(manager.get("j1").await.unwrap().is_none());
    let archived = manager.get_archived("j1").await.unwrap().unwrap();
    assert_eq!(archived.status, "failed");
    assert_eq!(archived.error_message.as_deref(), Some("enqueue_failed"));
    assert_eq!(ledger.get_balance("u1").await.unwrap(), 1);
}

#[tokio::test]
async fn test_delete_unstarted_leaves_no_trace() {
    let (db, _ledger, manager) = setup().await;
    manager.create(create_params("j1", "u1")).await.unwrap();
    manager.delete_unstarted("j1").await.unwrap();

    assert!(manager.get("j1").await.unwrap().is_none());
    assert!(manager.get_archived("j1").await.unwrap().is_none());
    let history_count = job_history::Entity::find().count(db.as_ref()).await.unwrap();
    assert_eq!(history_count, 0);
}

#[tokio::test]
async fn test_list_by_worker() {
    let (_db, _ledger, manager) = setup().await;
    manager.create(create_params("j1", "u1")).await.unwrap();
    manager.create(create_params("j2", "u1")).await.unwrap();
    manager.assign("j1", "worker-a").await.unwrap();
    manager.assign("j2", "worker-a").await.unwrap();

    let jobs = manager.list_by_worker("worker-a").await.unwrap();
    assert_eq!(jobs.len(), 2);
    let jobs = manager.list_by_worker("worker-b").await.unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn test_history_bounded_at_cap() {
    let (db, _ledger, manager) = setup().await;

    // Pre-fill the archive right at the cap.
    let base = chrono::Utc::now().timestamp_micros();
    for i in 0..1000 {
        let entry = job_history::ActiveModel {
            id: sea_orm::Set(format!("old-{i}")),
            user_id: sea_orm::Set("u1".to_string()),
            title: sea_orm::Set("t".to_string()),
            character_theme: sea_orm::Set("family_guy".to_string()),
            prompt: sea_orm::Set("p".to_string()),
            status: sea_orm::Set("completed".to_string()),
            worker_id: sea_orm::Set(None),
            assigned_at: sea_orm::Set(None),
            started_at: sea_orm::Set(None),
            completed_at: sea_orm::Set(Some(base + i)),
            retry_count: sea_orm::Set(0),
            max_retries: sea_orm::Set(3),
            error_message: sea_orm::Set(None),
            credit_refunded: sea_orm::Set(false),
            download_url: sea_orm::Set(None),
            created_at: sea_orm::Set(base + i),
            archived_at: sea_orm::Set(base + i),
        };
        sea_orm::ActiveModelTrait::insert(entry, db.as_ref()).await.unwrap();
    }

    // Archiving one more job trims the oldest entry out.
    manager.create(create_params("fresh", "u1")).await.unwrap();
    manager.assign("fresh", "worker-a").await.unwrap();
    manager.start("fresh", "worker-a").await.unwrap();
    manager.complete("fresh", "worker-a", true, None, None).await.unwrap();

    let total = job_history::Entity::find().count(db.as_ref()).await.unwrap();
    assert_eq!(total, 1000);
    assert!(manager.get_archived("fresh").await.unwrap().is_some());
    assert!(manager.get_archived("old-0").await.unwrap().is_none());
}
