use reelpipe::billing::CreditLedger;
use reelpipe::bus::{MessageBus, PromptJob, RenderJob, PUBLISH_QUEUE, SCRIPTS_QUEUE, VIDEO_QUEUE};
use reelpipe::config::CapacityConfig;
use reelpipe::database::system_stats::VIDEO_GENERATION_COUNT;
use reelpipe::database::{self, establish_connection};
use reelpipe::jobs::{CreateJob, JobManager};
use reelpipe::kv::KvStore;
use reelpipe::scaling::CapacityTracker;
use reelpipe::worker::{
    FileSinkRenderer, RenderWorker, ScriptStage, TwoSpeakerScriptGenerator, WorkerHealthMonitor,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    db: Arc<sea_orm::DatabaseConnection>,
    bus: Arc<MessageBus>,
    ledger: Arc<CreditLedger>,
    manager: Arc<JobManager>,
    stage: ScriptStage,
    worker: Arc<RenderWorker>,
    out_dir: std::path::PathBuf,
}

async fn setup(name: &str) -> Harness {
    let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
    let kv = KvStore::new();
    let bus = Arc::new(MessageBus::new(db.clone()));
    let ledger = Arc::new(CreditLedger::new(db.clone()));
    let manager = Arc::new(JobManager::new(db.clone(), kv.clone(), ledger.clone()));
    let capacity = Arc::new(CapacityTracker::new(
        kv.clone(),
        CapacityConfig {
            tracking_window_seconds: 3600,
            performance_samples: 10,
        },
    ));

    let stage = ScriptStage::new(
        bus.clone(),
        manager.clone(),
        Arc::new(TwoSpeakerScriptGenerator),
        Duration::from_millis(50),
    );

    let monitor = Arc::new(WorkerHealthMonitor::new(
        "worker-test-1-1".to_string(),
        kv.clone(),
        capacity,
        18090,
        Duration::from_secs(10),
    ));
    monitor.register().await;

    let out_dir = std::env::temp_dir().join(format!("reelpipe-pipeline-{name}"));
    let worker = Arc::new(RenderWorker::new(
        db.clone(),
        kv.clone(),
        bus.clone(),
        manager.clone(),
        monitor,
        Arc::new(FileSinkRenderer),
        out_dir.clone(),
        Duration::from_millis(50),
        Duration::from_secs(10),
    ));

    Harness {
        db,
        bus,
        ledger,
        manager,
        stage,
        worker,
        out_dir,
    }
}

async fn submit(h: &Harness, job_id: &str) {
    let prompt_job = PromptJob {
        job_id: job_id.to_string(),
        prompt: "Explain the borrow checker. Keep it short.".to_string(),
        character_theme: "family_guy".to_string(),
        title: Some("Borrow checker".to_string()),
    };
    h.manager
        .create(CreateJob {
            job_id: job_id.to_string(),
            user_id: "u1".to_string(),
            title: "Borrow checker".to_string(),
            character_theme: "family_guy".to_string(),
            prompt: prompt_job.prompt.clone(),
            queue: SCRIPTS_QUEUE.to_string(),
            payload: serde_json::to_value(&prompt_job).unwrap(),
            max_retries: 3,
            estimated_duration: None,
        })
        .await
        .unwrap();
    h.ledger.spend("u1", "Video generation").await.unwrap();
    h.bus.publish(SCRIPTS_QUEUE, &prompt_job).await.unwrap();
}

#[tokio::test]
async fn test_prompt_flows_to_completed_video() {
    let h = setup("happy").await;
    h.ledger.grant("u1", 2, "Purchased 2 credits", None).await.unwrap();
    submit(&h, "j1").await;

    // Script stage: prompt -> dialog hand-off
    let delivery = h.bus.consume_one(SCRIPTS_QUEUE, "script-stage").await.unwrap().unwrap();
    h.stage.process(delivery).await;
    assert_eq!(h.bus.depth(SCRIPTS_QUEUE).await.unwrap(), 0);
    assert_eq!(h.bus.depth(VIDEO_QUEUE).await.unwrap(), 1);

    let job = h.manager.get("j1").await.unwrap().unwrap();
    assert_eq!(job.queue, VIDEO_QUEUE);

    // Render worker: dialog -> artifact + terminal state
    let delivery = h.bus.consume_one(VIDEO_QUEUE, "worker-test-1-1").await.unwrap().unwrap();
    h.worker.process(delivery).await;

    let archived = h.manager.get_archived("j1").await.unwrap().unwrap();
    assert_eq!(archived.status, "completed");
    assert_eq!(archived.worker_id.as_deref(), Some("worker-test-1-1"));
    assert_eq!(archived.download_url.as_deref(), Some("/api/videos/j1/file"));

    // Artifact exists, the publish hop got its message, the counter moved,
    // and the single spend stands (no refund).
    assert!(h.out_dir.join("j1.mp4").exists());
    let publish = h.bus.consume_one(PUBLISH_QUEUE, "publisher").await.unwrap().unwrap();
    let render_job: RenderJob = serde_json::from_value(publish.body).unwrap();
    assert_eq!(render_job.job_id, "j1");

    let count = database::get_stat(h.db.as_ref(), VIDEO_GENERATION_COUNT).await.unwrap();
    assert_eq!(count, 1);
    assert_eq!(h.ledger.get_balance("u1").await.unwrap(), 1);
}

#[tokio::test]
async fn test_duplicate_video_message_completes_once() {
    let h = setup("duplicate").await;
    h.ledger.grant("u1", 1, "Purchased 1 credit", None).await.unwrap();
    submit(&h, "j1").await;

    let delivery = h.bus.consume_one(SCRIPTS_QUEUE, "script-stage").await.unwrap().unwrap();
    h.stage.process(delivery).await;

    // Simulate at-least-once: the same dialog lands on the queue twice.
    let job = h.manager.get("j1").await.unwrap().unwrap();
    let payload: serde_json::Value = serde_json::from_str(&job.payload).unwrap();
    h.bus.publish(VIDEO_QUEUE, &payload).await.unwrap();

    let first = h.bus.consume_one(VIDEO_QUEUE, "worker-test-1-1").await.unwrap().unwrap();
    h.worker.process(first).await;
    let second = h.bus.consume_one(VIDEO_QUEUE, "worker-test-1-1").await.unwrap().unwrap();
    h.worker.process(second).await;

    // One COMPLETED transition, one counter increment, no refund.
    let archived = h.manager.get_archived("j1").await.unwrap().unwrap();
    assert_eq!(archived.status, "completed");
    let count = database::get_stat(h.db.as_ref(), VIDEO_GENERATION_COUNT).await.unwrap();
    assert_eq!(count, 1);
    assert_eq!(h.ledger.get_balance("u1").await.unwrap(), 0);

    // Both deliveries were settled.
    assert_eq!(h.bus.depth(VIDEO_QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn test_duplicate_prompt_message_is_dropped() {
    let h = setup("dup-prompt").await;
    h.ledger.grant("u1", 1, "Purchased 1 credit", None).await.unwrap();
    submit(&h, "j1").await;

    // The prompt is delivered twice.
    let prompt: serde_json::Value = {
        let job = h.manager.get("j1").await.unwrap().unwrap();
        serde_json::from_str(&job.payload).unwrap()
    };
    h.bus.publish(SCRIPTS_QUEUE, &prompt).await.unwrap();

    let first = h.bus.consume_one(SCRIPTS_QUEUE, "script-stage").await.unwrap().unwrap();
    h.stage.process(first).await;
    let second = h.bus.consume_one(SCRIPTS_QUEUE, "script-stage").await.unwrap().unwrap();
    h.stage.process(second).await;

    // The duplicate did not produce a second dialog message.
    assert_eq!(h.bus.depth(VIDEO_QUEUE).await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_job_message_is_settled() {
    let h = setup("unknown").await;
    h.bus
        .publish(
            VIDEO_QUEUE,
            &serde_json::json!({
                "job_id": "ghost",
                "title": "t",
                "character_theme": "family_guy",
                "turns": [{"speaker": "peter", "text": "hi"}],
            }),
        )
        .await
        .unwrap();

    let delivery = h.bus.consume_one(VIDEO_QUEUE, "worker-test-1-1").await.unwrap().unwrap();
    h.worker.process(delivery).await;

    // Acked away, nothing left behind.
    assert_eq!(h.bus.depth(VIDEO_QUEUE).await.unwrap(), 0);
    assert!(h.manager.get("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn test_publish_stage_settles_notifications() {
    use reelpipe::worker::{LogPublisher, PublishStage};

    let h = setup("publish").await;
    h.ledger.grant("u1", 1, "Purchased 1 credit", None).await.unwrap();
    submit(&h, "j1").await;

    let delivery = h.bus.consume_one(SCRIPTS_QUEUE, "script-stage").await.unwrap().unwrap();
    h.stage.process(delivery).await;
    let delivery = h.bus.consume_one(VIDEO_QUEUE, "worker-test-1-1").await.unwrap().unwrap();
    h.worker.process(delivery).await;

    let publish_stage = PublishStage::new(
        h.bus.clone(),
        std::sync::Arc::new(LogPublisher),
        Duration::from_millis(50),
    );

    // The artifact exists, so the notification is acked away.
    let delivery = h.bus.consume_one(PUBLISH_QUEUE, "publish-stage").await.unwrap().unwrap();
    publish_stage.process(delivery).await;
    assert_eq!(h.bus.depth(PUBLISH_QUEUE).await.unwrap(), 0);
    assert_eq!(h.bus.dead_letter_count().await.unwrap(), 0);

    // A notification for a missing artifact dead-letters.
    h.bus
        .publish(
            PUBLISH_QUEUE,
            &RenderJob {
                job_id: "ghost".to_string(),
                title: "t".to_string(),
                storage_path: "/nonexistent/ghost.mp4".to_string(),
            },
        )
        .await
        .unwrap();
    let delivery = h.bus.consume_one(PUBLISH_QUEUE, "publish-stage").await.unwrap().unwrap();
    publish_stage.process(delivery).await;
    assert_eq!(h.bus.dead_letter_count().await.unwrap(), 1);
}
