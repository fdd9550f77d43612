use crate::errors::ReelPipeError;
use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub jwt_secret: String,
    pub welcome_credits: i64,
    pub video_out_dir: String,
    pub billing: BillingConfig,
    pub jobs: JobConfig,
    pub worker: WorkerConfig,
    pub scaling: ScalingConfig,
    pub capacity: CapacityConfig,
}

#[derive(Clone, Debug)]
pub struct BillingConfig {
    pub webhook_secret: Option<String>,
    pub provider_url: Option<String>,
    pub frontend_url: String,
}

#[derive(Clone, Debug)]
pub struct JobConfig {
    /// Wall-clock limit for a single job before recovery kicks in (seconds).
    pub job_timeout: i64,
    /// Max silence between job heartbeats before recovery kicks in (seconds).
    pub heartbeat_timeout: i64,
    pub max_retries: i32,
    pub recovery_interval_seconds: u64,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub heartbeat_interval_seconds: u64,
    pub health_check_port: u16,
    pub poll_interval_ms: u64,
    pub graceful_shutdown_timeout: u64,
}

#[derive(Clone, Debug)]
pub struct ScalingConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub cooldown_period: i64,
    pub metrics_collection_interval: u64,
    pub scaling_check_interval: u64,
    pub job_drain_timeout: u64,
    pub unhealthy_worker_timeout: i64,
}

#[derive(Clone, Debug)]
pub struct CapacityConfig {
    pub tracking_window_seconds: i64,
    pub performance_samples: usize,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: &str) -> Result<T, ReelPipeError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ReelPipeError::Config(format!("Invalid {name} value")))
}

impl Config {
    pub fn from_env() -> Result<Self, ReelPipeError> {
        let database_url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:data/reelpipe.db?mode=rwc".to_string());
        let port = env_parse("PORT", "8080")?;
        let jwt_secret = env::var("JWT_SECRET").map_err(|_| {
            ReelPipeError::Config("JWT_SECRET environment variable is required".to_string())
        })?;
        let welcome_credits = env_parse("WELCOME_CREDITS", "1")?;
        let video_out_dir = env::var("VIDEO_OUT_DIR").unwrap_or_else(|_| "data/videos".to_string());

        let billing = BillingConfig {
            webhook_secret: env::var("BILLING_WEBHOOK_SECRET").ok(),
            provider_url: env::var("BILLING_PROVIDER_URL").ok(),
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:5000".to_string()),
        };

        let jobs = JobConfig {
            job_timeout: env_parse("JOB_TIMEOUT", "3600")?,
            heartbeat_timeout: env_parse("JOB_HEARTBEAT_TIMEOUT", "300")?,
            max_retries: env_parse("JOB_MAX_RETRIES", "3")?,
            recovery_interval_seconds: env_parse("JOB_RECOVERY_INTERVAL", "30")?,
        };
        if jobs.recovery_interval_seconds == 0 || jobs.recovery_interval_seconds > 60 {
            return Err(ReelPipeError::Config(
                "JOB_RECOVERY_INTERVAL must be between 1 and 60 seconds".to_string(),
            ));
        }

        let worker = WorkerConfig {
            heartbeat_interval_seconds: env_parse("HEARTBEAT_INTERVAL", "10")?,
            health_check_port: env_parse("HEALTH_CHECK_PORT", "8081")?,
            poll_interval_ms: env_parse("WORKER_POLL_INTERVAL_MS", "1000")?,
            graceful_shutdown_timeout: env_parse("GRACEFUL_SHUTDOWN_TIMEOUT", "300")?,
        };

        let scaling = ScalingConfig {
            min_workers: env_parse("MIN_WORKERS", "1")?,
            max_workers: env_parse("MAX_WORKERS", "10")?,
            scale_up_threshold: env_parse("SCALE_UP_THRESHOLD", "2")?,
            scale_down_threshold: env_parse("SCALE_DOWN_THRESHOLD", "0.5")?,
            cooldown_period: env_parse("COOLDOWN_PERIOD", "60")?,
            metrics_collection_interval: env_parse("METRICS_COLLECTION_INTERVAL", "15")?,
            scaling_check_interval: env_parse("SCALING_CHECK_INTERVAL", "30")?,
            job_drain_timeout: env_parse("JOB_DRAIN_TIMEOUT", "1800")?,
            unhealthy_worker_timeout: env_parse("UNHEALTHY_WORKER_TIMEOUT", "300")?,
        };
        if scaling.min_workers == 0 {
            return Err(ReelPipeError::Config(
                "MIN_WORKERS must be at least 1".to_string(),
            ));
        }
        if scaling.max_workers < scaling.min_workers {
            return Err(ReelPipeError::Config(
                "MAX_WORKERS must be greater than or equal to MIN_WORKERS".to_string(),
            ));
        }

        let capacity = CapacityConfig {
            tracking_window_seconds: env_parse("CAPACITY_TRACKING_WINDOW", "3600")?,
            performance_samples: env_parse("PERFORMANCE_SAMPLES", "10")?,
        };

        // Ensure data directories exist for sqlite and rendered artifacts
        if let Some(db_path_str) = database_url.strip_prefix("sqlite:") {
            if let Some(db_path) = db_path_str.split('?').next() {
                if let Some(parent) = std::path::Path::new(db_path).parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        ReelPipeError::Config(format!("Failed to create data directory: {e}"))
                    })?;
                }
            }
        }
        std::fs::create_dir_all(&video_out_dir).map_err(|e| {
            ReelPipeError::Config(format!("Failed to create video output directory: {e}"))
        })?;

        Ok(Config {
            database_url,
            port,
            jwt_secret,
            welcome_credits,
            video_out_dir,
            billing,
            jobs,
            worker,
            scaling,
            capacity,
        })
    }
}
