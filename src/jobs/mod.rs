pub mod manager;
pub mod recovery;

pub use manager::{CreateJob, JobManager, JobSnapshot, JobStatistics};
pub use recovery::RecoveryService;
