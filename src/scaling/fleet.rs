use crate::bus::MessageBus;
use crate::config::WorkerConfig;
use crate::errors::Result;
use crate::jobs::JobManager;
use crate::kv::KvStore;
use crate::scaling::capacity::CapacityTracker;
use crate::worker::registry;
use crate::worker::{RenderWorker, VideoRenderer, WorkerHealthMonitor};
use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Abstracts the deployment backend the controller scales against. The
/// in-process driver below runs workers as supervised tasks; a container
/// orchestrator driver would implement the same surface.
#[async_trait]
pub trait FleetDriver: Send + Sync {
    async fn current_workers(&self) -> Vec<String>;
    async fn spawn_worker(&self) -> Result<String>;
    /// Flag the worker as draining; it refuses new jobs and finishes
    /// in-flight ones.
    async fn begin_drain(&self, worker_id: &str);
    /// Graceful terminate with a bounded wait, then force-kill.
    async fn terminate_worker(&self, worker_id: &str) -> Result<()>;
    async fn shutdown_all(&self, graceful_timeout: Duration);
}

struct WorkerHandle {
    monitor: Arc<WorkerHealthMonitor>,
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// Runs render workers as tokio tasks, each with a distinct worker id and
/// health port.
pub struct LocalFleetDriver {
    db: Arc<DatabaseConnection>,
    kv: KvStore,
    bus: Arc<MessageBus>,
    job_manager: Arc<JobManager>,
    capacity: Arc<CapacityTracker>,
    renderer: Arc<dyn VideoRenderer>,
    worker_config: WorkerConfig,
    video_out_dir: PathBuf,
    handles: Arc<RwLock<HashMap<String, WorkerHandle>>>,
    next_port_offset: AtomicU16,
}

impl LocalFleetDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        kv: KvStore,
        bus: Arc<MessageBus>,
        job_manager: Arc<JobManager>,
        capacity: Arc<CapacityTracker>,
        renderer: Arc<dyn VideoRenderer>,
        worker_config: WorkerConfig,
        video_out_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            kv,
            bus,
            job_manager,
            capacity,
            renderer,
            worker_config,
            video_out_dir,
            handles: Arc::new(RwLock::new(HashMap::new())),
            next_port_offset: AtomicU16::new(0),
        }
    }
}

#[async_trait]
impl FleetDriver for LocalFleetDriver {
    async fn current_workers(&self) -> Vec<String> {
        self.handles.read().await.keys().cloned().collect()
    }

    async fn spawn_worker(&self) -> Result<String> {
        let worker_id = WorkerHealthMonitor::generate_worker_id();
        let port_offset = self.next_port_offset.fetch_add(1, Ordering::SeqCst);
        let health_port = self.worker_config.health_check_port + port_offset;
        let token = CancellationToken::new();

        let monitor = Arc::new(WorkerHealthMonitor::new(
            worker_id.clone(),
            self.kv.clone(),
            self.capacity.clone(),
            health_port,
            Duration::from_secs(self.worker_config.heartbeat_interval_seconds),
        ));
        monitor.register().await;
        monitor.start_heartbeat(token.clone());
        monitor.start_health_server(token.clone());

        let runner = Arc::new(RenderWorker::new(
            self.db.clone(),
            self.kv.clone(),
            self.bus.clone(),
            self.job_manager.clone(),
            monitor.clone(),
            self.renderer.clone(),
            self.video_out_dir.clone(),
            Duration::from_millis(self.worker_config.poll_interval_ms),
            Duration::from_secs(self.worker_config.heartbeat_interval_seconds),
        ));
        let join = tokio::spawn(runner.run(token.clone()));

        self.handles.write().await.insert(
            worker_id.clone(),
            WorkerHandle {
                monitor,
                token,
                join,
            },
        );
        tracing::info!(
            "Spawned worker {} (health port {})",
            worker_id,
            health_port
        );
        Ok(worker_id)
    }

    async fn begin_drain(&self, worker_id: &str) {
        let handles = self.handles.read().await;
        if let Some(handle) = handles.get(worker_id) {
            handle.monitor.begin_shutdown().await;
            return;
        }
        drop(handles);
        // No local handle: flip the registry flag; the worker observes it
        // on its next heartbeat.
        if let Some(mut record) = registry::get_worker(&self.kv, worker_id).await {
            record.is_shutting_down = true;
            registry::put_worker(&self.kv, &record).await;
            tracing::info!("Marked worker {} for shutdown", worker_id);
        }
    }

    async fn terminate_worker(&self, worker_id: &str) -> Result<()> {
        let handle = self.handles.write().await.remove(worker_id);
        match handle {
            Some(handle) => {
                handle.token.cancel();
                match timeout(Duration::from_secs(60), handle.join).await {
                    Ok(Ok(())) => {
                        tracing::info!("Worker {} shut down cleanly", worker_id);
                    }
                    Ok(Err(e)) => {
                        tracing::error!("Worker {} panicked during shutdown: {}", worker_id, e);
                    }
                    Err(_) => {
                        tracing::error!(
                            "Worker {} shutdown timed out, forcing termination",
                            worker_id
                        );
                    }
                }
                // A forced worker never deregistered itself.
                registry::remove_worker(&self.kv, worker_id).await;
                Ok(())
            }
            None => {
                registry::remove_worker(&self.kv, worker_id).await;
                Ok(())
            }
        }
    }

    async fn shutdown_all(&self, graceful_timeout: Duration) {
        let worker_ids = self.current_workers().await;
        for worker_id in &worker_ids {
            self.begin_drain(worker_id).await;
        }

        // Wait for in-flight jobs to finish, bounded.
        let deadline = tokio::time::Instant::now() + graceful_timeout;
        loop {
            let mut busy = 0usize;
            {
                let handles = self.handles.read().await;
                for handle in handles.values() {
                    if handle.monitor.current_job_count().await > 0 {
                        busy += 1;
                    }
                }
            }
            if busy == 0 || tokio::time::Instant::now() >= deadline {
                if busy > 0 {
                    tracing::warn!("Fleet drain timeout with {} busy workers", busy);
                }
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }

        for worker_id in worker_ids {
            if let Err(e) = self.terminate_worker(&worker_id).await {
                tracing::error!("Failed to terminate worker {}: {}", worker_id, e);
            }
        }
        tracing::info!("Fleet shutdown complete");
    }
}
