use std::sync::Arc;

pub mod api;
pub mod auth;
pub mod billing;
pub mod bus;
pub mod config;
pub mod database;
pub mod errors;
pub mod jobs;
pub mod kv;
pub mod retry;
pub mod scaling;
pub mod themes;
pub mod worker;

pub use database::establish_connection;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<sea_orm::DatabaseConnection>,
    pub kv: kv::KvStore,
    pub bus: Arc<bus::MessageBus>,
    pub config: Arc<config::Config>,
    pub ledger: Arc<billing::CreditLedger>,
    pub job_manager: Arc<jobs::JobManager>,
}
