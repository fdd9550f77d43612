use axum::middleware;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use reelpipe::billing::CreditLedger;
use reelpipe::bus::MessageBus;
use reelpipe::config::Config;
use reelpipe::database::{self, establish_connection, system_stats::VIDEO_GENERATION_COUNT};
use reelpipe::jobs::{JobManager, RecoveryService};
use reelpipe::kv::KvStore;
use reelpipe::scaling::fleet::{FleetDriver, LocalFleetDriver};
use reelpipe::scaling::{CapacityTracker, QueueMonitor, ScalingController};
use reelpipe::worker::{
    FileSinkRenderer, LogPublisher, PublishStage, ScriptStage, TwoSpeakerScriptGenerator,
};
use reelpipe::{api, auth, AppState};

/// Delivered-but-unacked bus messages come back after this long.
const BUS_VISIBILITY_SECONDS: i64 = 900;
const BUS_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const KV_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    tracing::info!("Starting ReelPipe on port {}", config.port);

    // Startup dependency failures (store unreachable, migration error)
    // terminate with a non-zero exit.
    let db = establish_connection(&config.database_url).await?;
    let db = Arc::new(db);

    let kv = KvStore::new();
    let bus = Arc::new(MessageBus::new(db.clone()));
    let ledger = Arc::new(CreditLedger::new(db.clone()));
    let job_manager = Arc::new(JobManager::new(db.clone(), kv.clone(), ledger.clone()));
    let capacity = Arc::new(CapacityTracker::new(kv.clone(), config.capacity.clone()));

    // Mirror the durable video counter into the KV layer.
    match database::get_stat(db.as_ref(), VIDEO_GENERATION_COUNT).await {
        Ok(count) => {
            kv.put(VIDEO_GENERATION_COUNT, &count).await;
            tracing::info!("Video count initialized: {}", count);
        }
        Err(e) => tracing::error!("Failed to read video count: {}", e),
    }

    let renderer = Arc::new(FileSinkRenderer);
    let fleet = Arc::new(LocalFleetDriver::new(
        db.clone(),
        kv.clone(),
        bus.clone(),
        job_manager.clone(),
        capacity.clone(),
        renderer,
        config.worker.clone(),
        config.video_out_dir.clone().into(),
    ));

    let shutdown_token = CancellationToken::new();

    // Initial fleet
    tracing::info!("Spawning initial fleet of {} workers", config.scaling.min_workers);
    for _ in 0..config.scaling.min_workers {
        if let Err(e) = fleet.spawn_worker().await {
            tracing::error!("Failed to spawn initial worker: {}", e);
        }
    }

    // Background control plane
    let recovery = RecoveryService::new(job_manager.clone(), bus.clone(), config.jobs.clone());
    recovery.start(shutdown_token.child_token());

    let queue_monitor = QueueMonitor::new(
        kv.clone(),
        bus.clone(),
        job_manager.clone(),
        config.scaling.clone(),
    );
    queue_monitor.start(shutdown_token.child_token());

    let fleet_driver: Arc<dyn FleetDriver> = fleet.clone();
    let controller = ScalingController::new(
        kv.clone(),
        job_manager.clone(),
        capacity.clone(),
        fleet_driver,
        config.scaling.clone(),
    );
    controller.start(shutdown_token.child_token());

    let script_stage = ScriptStage::new(
        bus.clone(),
        job_manager.clone(),
        Arc::new(TwoSpeakerScriptGenerator),
        Duration::from_millis(config.worker.poll_interval_ms),
    );
    script_stage.start(shutdown_token.child_token());

    let publish_stage = PublishStage::new(
        bus.clone(),
        Arc::new(LogPublisher),
        Duration::from_millis(config.worker.poll_interval_ms),
    );
    publish_stage.start(shutdown_token.child_token());

    bus.start_redelivery_sweep(
        shutdown_token.child_token(),
        BUS_SWEEP_INTERVAL,
        BUS_VISIBILITY_SECONDS,
    );
    ledger.start_marker_cleanup(shutdown_token.child_token());

    // KV TTL cleanup
    {
        let kv = kv.clone();
        let token = shutdown_token.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(KV_CLEANUP_INTERVAL) => {}
                }
                match kv.cleanup_expired().await {
                    0 => {}
                    count => tracing::debug!("Cleaned up {} expired KV entries", count),
                }
            }
        });
    }

    let port = config.port;
    let graceful_timeout = Duration::from_secs(config.worker.graceful_shutdown_timeout);
    let state = AppState {
        db,
        kv,
        bus,
        config: Arc::new(config),
        ledger,
        job_manager,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ]);

    let app = api::create_router()
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware))
        .layer(cors)
        .with_state(state);

    let listener = TcpListener::bind(&format!("0.0.0.0:{port}")).await?;
    tracing::info!("ReelPipe server listening on http://0.0.0.0:{port}");

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        tracing::info!("Received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    // Stop the control loops, then drain and terminate the fleet.
    shutdown_token.cancel();
    tracing::info!("Draining worker fleet...");
    fleet.shutdown_all(graceful_timeout).await;

    tracing::info!("Application shutdown complete");
    Ok(())
}
