pub mod credit_balances;
pub mod credit_transactions;
pub mod job_history;
pub mod jobs;
pub mod migrator;
pub mod processed_events;
pub mod queue_messages;
pub mod system_stats;
pub mod users;

use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, DbErr, EntityTrait, Set};
use sea_orm_migration::MigratorTrait;

/// Connect and bring the schema up to date. Tables are created via the
/// migrator, so callers (including tests against `sqlite::memory:`) get a
/// ready database back.
pub async fn establish_connection(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect(database_url).await?;
    migrator::Migrator::up(&db, None).await?;
    Ok(db)
}

/// Increment a durable counter, creating the row on first use. Returns the
/// new value.
pub async fn increment_stat(db: &DatabaseConnection, key: &str, delta: i64) -> Result<i64, DbErr> {
    let now = chrono::Utc::now().timestamp_micros();
    match system_stats::Entity::find_by_id(key).one(db).await? {
        Some(row) => {
            let next = row.value + delta;
            let mut active: system_stats::ActiveModel = row.into();
            active.value = Set(next);
            active.updated_at = Set(now);
            active.update(db).await?;
            Ok(next)
        }
        None => {
            let active = system_stats::ActiveModel {
                key: Set(key.to_string()),
                value: Set(delta),
                updated_at: Set(now),
            };
            active.insert(db).await?;
            Ok(delta)
        }
    }
}

pub async fn get_stat(db: &DatabaseConnection, key: &str) -> Result<i64, DbErr> {
    Ok(system_stats::Entity::find_by_id(key)
        .one(db)
        .await?
        .map(|row| row.value)
        .unwrap_or(0))
}
