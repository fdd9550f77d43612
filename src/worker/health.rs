use crate::scaling::capacity::{CapacitySample, CapacityTracker};
use crate::worker::registry::{self, WorkerHealth, WorkerRecord};
use crate::kv::KvStore;
use axum::{extract::State, response::Json, routing::get, Router};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// cpu/mem/disk usage reported with capacity samples.
#[derive(Debug, Clone, Copy)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

impl ResourceUsage {
    // TODO: wire real procfs probes in place of these neutral defaults
    pub fn sample() -> Self {
        Self {
            cpu_percent: 50.0,
            memory_percent: 60.0,
            disk_percent: 30.0,
        }
    }
}

#[derive(Debug, Default)]
struct HealthState {
    healthy: bool,
    shutting_down: bool,
    current_jobs: HashMap<String, i64>, // job_id -> started (micros)
    jobs_processed: u64,
    jobs_failed: u64,
}

/// In-process health monitor embedded in every render worker: registry
/// record upkeep, per-job bookkeeping, capacity reporting and the readonly
/// /health /metrics /status endpoints.
pub struct WorkerHealthMonitor {
    worker_id: String,
    kv: KvStore,
    capacity: Arc<CapacityTracker>,
    health_port: u16,
    heartbeat_interval: Duration,
    started_at: i64,
    state: RwLock<HealthState>,
}

impl WorkerHealthMonitor {
    pub fn new(
        worker_id: String,
        kv: KvStore,
        capacity: Arc<CapacityTracker>,
        health_port: u16,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            worker_id,
            kv,
            capacity,
            health_port,
            heartbeat_interval,
            started_at: chrono::Utc::now().timestamp_micros(),
            state: RwLock::new(HealthState {
                healthy: true,
                ..Default::default()
            }),
        }
    }

    /// Stable worker identity: host, pid and start timestamp.
    pub fn generate_worker_id() -> String {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        let pid = std::process::id();
        let start_ts = chrono::Utc::now().timestamp_micros();
        format!("worker-{host}-{pid}-{start_ts}")
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn health_port(&self) -> u16 {
        self.health_port
    }

    pub async fn register(&self) {
        self.write_record().await;
        tracing::info!("Worker registered: {}", self.worker_id);
    }

    pub async fn deregister(&self) {
        registry::remove_worker(&self.kv, &self.worker_id).await;
        tracing::info!("Worker deregistered: {}", self.worker_id);
    }

    /// Refresh last_seen and observe a controller-initiated drain request
    /// left on our registry row.
    pub async fn heartbeat(&self) {
        if let Some(record) = registry::get_worker(&self.kv, &self.worker_id).await {
            if record.is_shutting_down {
                let mut state = self.state.write().await;
                if !state.shutting_down {
                    tracing::info!(
                        "Worker {} observed drain request, refusing new jobs",
                        self.worker_id
                    );
                    state.shutting_down = true;
                    state.healthy = false;
                }
            }
        }
        self.write_record().await;
    }

    async fn write_record(&self) {
        let state = self.state.read().await;
        let record = WorkerRecord {
            worker_id: self.worker_id.clone(),
            started_at: self.started_at,
            last_seen: chrono::Utc::now().timestamp_micros(),
            health: if state.healthy {
                WorkerHealth::Healthy
            } else {
                WorkerHealth::Unhealthy
            },
            current_jobs: state.current_jobs.keys().cloned().collect(),
            jobs_processed: state.jobs_processed,
            jobs_failed: state.jobs_failed,
            is_shutting_down: state.shutting_down,
            health_port: self.health_port,
        };
        drop(state);
        registry::put_worker(&self.kv, &record).await;
    }

    pub fn start_heartbeat(self: &Arc<Self>, token: CancellationToken) {
        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(monitor.heartbeat_interval) => {}
                }
                monitor.heartbeat().await;
            }
        });
    }

    pub async fn job_started(&self, job_id: &str) {
        let now = chrono::Utc::now().timestamp_micros();
        {
            let mut state = self.state.write().await;
            state.current_jobs.insert(job_id.to_string(), now);
        }
        tracing::info!("Worker {} started processing job: {}", self.worker_id, job_id);
        self.write_record().await;
    }

    /// Record the outcome, feed the capacity tracker and clear the slot.
    /// Returns the job duration in seconds.
    pub async fn job_completed(&self, job_id: &str, success: bool) -> f64 {
        let now = chrono::Utc::now().timestamp_micros();
        let (duration, current_jobs) = {
            let mut state = self.state.write().await;
            let duration = state
                .current_jobs
                .remove(job_id)
                .map(|started| (now - started) as f64 / 1_000_000.0)
                .unwrap_or(0.0);
            if success {
                state.jobs_processed += 1;
            } else {
                state.jobs_failed += 1;
            }
            (duration, state.current_jobs.len() as i32)
        };

        if success {
            tracing::info!(
                "Worker {} completed job {} in {:.1}s",
                self.worker_id,
                job_id,
                duration
            );
        } else {
            tracing::error!(
                "Worker {} failed job {} after {:.1}s",
                self.worker_id,
                job_id,
                duration
            );
        }

        let usage = ResourceUsage::sample();
        self.capacity
            .update_worker_capacity(
                &self.worker_id,
                CapacitySample {
                    job_completed: duration > 0.0,
                    job_duration_seconds: duration,
                    job_success: success,
                    cpu_usage_percent: usage.cpu_percent,
                    memory_usage_percent: usage.memory_percent,
                    disk_usage_percent: usage.disk_percent,
                    current_jobs,
                },
            )
            .await;

        self.write_record().await;
        duration
    }

    /// False when unhealthy, draining, or at the concurrent-job limit.
    pub async fn accept_new_jobs(&self) -> bool {
        let (healthy, shutting_down, current) = {
            let state = self.state.read().await;
            (
                state.healthy,
                state.shutting_down,
                state.current_jobs.len() as i32,
            )
        };
        if !healthy || shutting_down {
            return false;
        }
        let limit = self.capacity.concurrent_limit_for(&self.worker_id).await;
        if current >= limit {
            tracing::debug!(
                "Worker {} at capacity limit: {}/{}",
                self.worker_id,
                current,
                limit
            );
            return false;
        }
        true
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.state.read().await.shutting_down
    }

    pub async fn current_job_count(&self) -> usize {
        self.state.read().await.current_jobs.len()
    }

    /// Stop accepting work and advertise the drain; in-flight jobs finish
    /// normally.
    pub async fn begin_shutdown(&self) {
        {
            let mut state = self.state.write().await;
            state.shutting_down = true;
            state.healthy = false;
        }
        tracing::info!("Worker {} draining", self.worker_id);
        self.write_record().await;
    }

    async fn health_status(&self) -> serde_json::Value {
        let state = self.state.read().await;
        let now = chrono::Utc::now().timestamp_micros();
        serde_json::json!({
            "worker_id": self.worker_id,
            "status": if state.healthy { "healthy" } else { "unhealthy" },
            "current_jobs": state.current_jobs.keys().collect::<Vec<_>>(),
            "is_shutting_down": state.shutting_down,
            "uptime_seconds": (now - self.started_at) / 1_000_000,
        })
    }

    async fn metrics(&self) -> serde_json::Value {
        let state = self.state.read().await;
        let now = chrono::Utc::now().timestamp_micros();
        let uptime_seconds = (now - self.started_at) as f64 / 1_000_000.0;
        let total = state.jobs_processed + state.jobs_failed;
        let success_rate = if total > 0 {
            state.jobs_processed as f64 / total as f64
        } else {
            0.0
        };
        serde_json::json!({
            "worker_id": self.worker_id,
            "jobs_processed": state.jobs_processed,
            "jobs_failed": state.jobs_failed,
            "success_rate": success_rate,
            "uptime_seconds": uptime_seconds,
            "jobs_per_hour": if uptime_seconds > 0.0 {
                (state.jobs_processed as f64 / uptime_seconds) * 3600.0
            } else {
                0.0
            },
        })
    }

    pub fn routes(monitor: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/status", get(status_handler))
            .with_state(monitor)
    }

    /// Serve the readonly endpoints on the worker's health port.
    pub fn start_health_server(self: &Arc<Self>, token: CancellationToken) {
        let monitor = self.clone();
        let port = self.health_port;
        tokio::spawn(async move {
            let app = Self::routes(monitor);
            let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!("Health server failed to bind port {}: {}", port, e);
                    return;
                }
            };
            tracing::info!("Health server started on port {}", port);
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("Health server error: {}", e);
            }
        });
    }
}

async fn health_handler(State(monitor): State<Arc<WorkerHealthMonitor>>) -> Json<serde_json::Value> {
    Json(monitor.health_status().await)
}

async fn metrics_handler(State(monitor): State<Arc<WorkerHealthMonitor>>) -> Json<serde_json::Value> {
    Json(monitor.metrics().await)
}

async fn status_handler(State(monitor): State<Arc<WorkerHealthMonitor>>) -> Json<serde_json::Value> {
    let health = monitor.health_status().await;
    let metrics = monitor.metrics().await;
    Json(serde_json::json!({
        "worker_id": monitor.worker_id,
        "health": health,
        "metrics": metrics,
        "config": {
            "heartbeat_interval": monitor.heartbeat_interval.as_secs(),
            "health_check_port": monitor.health_port,
        },
    }))
}
