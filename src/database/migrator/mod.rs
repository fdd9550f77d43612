use sea_orm_migration::prelude::*;

mod m20250801_000001_create_users_table;
mod m20250801_000002_create_credit_balances_table;
mod m20250801_000003_create_credit_transactions_table;
mod m20250801_000004_create_processed_events_table;
mod m20250801_000005_create_jobs_table;
mod m20250801_000006_create_job_history_table;
mod m20250801_000007_create_queue_messages_table;
mod m20250801_000008_create_system_stats_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250801_000001_create_users_table::Migration),
            Box::new(m20250801_000002_create_credit_balances_table::Migration),
            Box::new(m20250801_000003_create_credit_transactions_table::Migration),
            Box::new(m20250801_000004_create_processed_events_table::Migration),
            Box::new(m20250801_000005_create_jobs_table::Migration),
            Box::new(m20250801_000006_create_job_history_table::Migration),
            Box::new(m20250801_000007_create_queue_messages_table::Migration),
            Box::new(m20250801_000008_create_system_stats_table::Migration),
        ]
    }
}
