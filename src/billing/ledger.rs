use crate::database::{credit_balances, credit_transactions, processed_events};
use crate::errors::{ReelPipeError, Result};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, Set, Statement, TransactionTrait,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Idempotency markers are kept at least this long (24 h).
pub const MARKER_TTL_SECONDS: i64 = 86_400;

/// Credit accounting. Every mutation runs in a single transaction that
/// updates the balance row and appends the ledger entry together, so the
/// balance always equals the signed sum of the user's ledger.
#[derive(Clone)]
pub struct CreditLedger {
    db: Arc<DatabaseConnection>,
}

impl CreditLedger {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get_balance(&self, user_id: &str) -> Result<i64> {
        Ok(credit_balances::Entity::find_by_id(user_id)
            .one(self.db.as_ref())
            .await?
            .map(|row| row.credits)
            .unwrap_or(0))
    }

    /// Grant `amount` credits. With an idempotency key, replays are a no-op
    /// that return the current balance; the marker insert and the grant
    /// share one transaction, so a crash between them leaves both unwritten.
    pub async fn grant(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
        idem_key: Option<&str>,
    ) -> Result<i64> {
        let txn = self.db.begin().await?;
        let now = chrono::Utc::now().timestamp_micros();

        if let Some(key) = idem_key {
            if processed_events::Entity::find_by_id(key)
                .one(&txn)
                .await?
                .is_some()
            {
                txn.rollback().await?;
                tracing::info!("Event {} already processed, skipping grant", key);
                return self.get_balance(user_id).await;
            }
            let marker = processed_events::ActiveModel {
                id: Set(key.to_string()),
                created_at: Set(now),
            };
            if let Err(e) = marker.insert(&txn).await {
                txn.rollback().await?;
                // A racing grant inserted the marker first.
                if matches!(e.sql_err(), Some(sea_orm::SqlErr::UniqueConstraintViolation(_))) {
                    return Err(ReelPipeError::DuplicateEvent(key.to_string()));
                }
                return Err(e.into());
            }
        }

        let balance = Self::apply_delta(&txn, user_id, amount, description, now).await?;
        txn.commit().await?;

        tracing::info!("Granted {} credits to user {}", amount, user_id);
        Ok(balance)
    }

    /// Spend one credit. The decrement is guarded (`credits >= 1`) inside
    /// the transaction, so concurrent spends cannot drive a balance
    /// negative.
    pub async fn spend(&self, user_id: &str, description: &str) -> Result<i64> {
        let txn = self.db.begin().await?;
        let now = chrono::Utc::now().timestamp_micros();
        let backend = txn.get_database_backend();

        let sql = match backend {
            sea_orm::DbBackend::Postgres => {
                "UPDATE credit_balances SET credits = credits - 1, updated_at = $1 \
                 WHERE user_id = $2 AND credits >= 1"
            }
            _ => {
                "UPDATE credit_balances SET credits = credits - 1, updated_at = ? \
                 WHERE user_id = ? AND credits >= 1"
            }
        };
        let result = txn
            .execute(Statement::from_sql_and_values(
                backend,
                sql,
                vec![now.into(), user_id.to_string().into()],
            ))
            .await?;

        if result.rows_affected() == 0 {
            txn.rollback().await?;
            return Err(ReelPipeError::InsufficientCredits);
        }

        let entry = credit_transactions::ActiveModel {
            id: Set(Uuid::now_v7().to_string()),
            user_id: Set(user_id.to_string()),
            amount: Set(-1),
            description: Set(description.to_string()),
            created_at: Set(now),
        };
        entry.insert(&txn).await?;

        let balance = credit_balances::Entity::find_by_id(user_id)
            .one(&txn)
            .await?
            .map(|row| row.credits)
            .unwrap_or(0);
        txn.commit().await?;

        tracing::info!("Spent 1 credit for user {}, remaining: {}", user_id, balance);
        Ok(balance)
    }

    /// Refund is a grant of +1 tagged with the refund reason.
    pub async fn refund(&self, user_id: &str, description: &str) -> Result<i64> {
        self.grant(user_id, 1, description, None).await
    }

    /// Balance update + ledger append inside an open transaction. Also used
    /// by user provisioning for the welcome grant.
    pub async fn apply_delta(
        txn: &DatabaseTransaction,
        user_id: &str,
        amount: i64,
        description: &str,
        now: i64,
    ) -> Result<i64> {
        let balance = match credit_balances::Entity::find_by_id(user_id).one(txn).await? {
            Some(row) => {
                let next = row.credits + amount;
                let mut active: credit_balances::ActiveModel = row.into();
                active.credits = Set(next);
                active.updated_at = Set(now);
                active.update(txn).await?;
                next
            }
            None => {
                let active = credit_balances::ActiveModel {
                    user_id: Set(user_id.to_string()),
                    credits: Set(amount),
                    updated_at: Set(now),
                };
                active.insert(txn).await?;
                amount
            }
        };

        let entry = credit_transactions::ActiveModel {
            id: Set(Uuid::now_v7().to_string()),
            user_id: Set(user_id.to_string()),
            amount: Set(amount),
            description: Set(description.to_string()),
            created_at: Set(now),
        };
        entry.insert(txn).await?;

        Ok(balance)
    }

    /// Drop idempotency markers past their TTL.
    pub async fn cleanup_expired_markers(&self) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp_micros() - MARKER_TTL_SECONDS * 1_000_000;
        let result = processed_events::Entity::delete_many()
            .filter(processed_events::Column::CreatedAt.lt(cutoff))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected)
    }

    /// Hourly marker cleanup task.
    pub fn start_marker_cleanup(&self, token: CancellationToken) {
        let ledger = self.clone();
        tokio::spawn(async move {
            tracing::info!("Idempotency marker cleanup task started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(Duration::from_secs(3600)) => {}
                }
                match ledger.cleanup_expired_markers().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("Removed {} expired idempotency markers", n),
                    Err(e) => tracing::error!("Marker cleanup failed: {}", e),
                }
            }
        });
    }
}
