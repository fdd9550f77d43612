pub mod messages;

pub use messages::{DialogJob, DialogTurn, PromptJob, RenderJob};

use crate::database::queue_messages::{self, MessageState};
use crate::errors::Result;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set, Statement,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const SCRIPTS_QUEUE: &str = "scripts";
pub const VIDEO_QUEUE: &str = "video";
pub const PUBLISH_QUEUE: &str = "publish";

/// A message handed to a consumer. The consumer must `ack` after reaching a
/// terminal state or `nack` to dead-letter; anything else is redelivered
/// after the visibility timeout.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub message_id: String,
    pub queue: String,
    pub body: serde_json::Value,
}

/// Durable FIFO queues with manual ack over the relational store. Claiming
/// is a single atomic UPDATE, which gives each consumer prefetch = 1 and
/// makes concurrent consumers race safely.
#[derive(Clone)]
pub struct MessageBus {
    db: Arc<DatabaseConnection>,
}

impl MessageBus {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Persist a message. The row is visible to consumers immediately.
    pub async fn publish<T: Serialize>(&self, queue: &str, body: &T) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let message = queue_messages::ActiveModel {
            id: Set(id.clone()),
            queue: Set(queue.to_string()),
            body: Set(serde_json::to_string(body)?),
            state: Set(MessageState::Ready.to_string()),
            delivered_at: Set(None),
            delivered_to: Set(None),
            enqueued_at: Set(chrono::Utc::now().timestamp_micros()),
        };
        message.insert(self.db.as_ref()).await?;
        tracing::debug!("Published message {} to queue {}", id, queue);
        Ok(id)
    }

    /// Atomically claim the oldest ready message on `queue` for `consumer`.
    /// Returns None when the queue is empty.
    pub async fn consume_one(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>> {
        let now = chrono::Utc::now().timestamp_micros();
        let backend = self.db.get_database_backend();

        let sql = match backend {
            sea_orm::DbBackend::Postgres => {
                r#"
                UPDATE queue_messages
                SET state = 'delivered', delivered_at = $1, delivered_to = $2
                WHERE id = (
                    SELECT id FROM queue_messages
                    WHERE queue = $3 AND state = 'ready'
                    ORDER BY enqueued_at ASC, id ASC
                    LIMIT 1
                )
                "#
            }
            _ => {
                r#"
                UPDATE queue_messages
                SET state = 'delivered', delivered_at = ?, delivered_to = ?
                WHERE id = (
                    SELECT id FROM queue_messages
                    WHERE queue = ? AND state = 'ready'
                    ORDER BY enqueued_at ASC, id ASC
                    LIMIT 1
                )
                "#
            }
        };

        let statement = Statement::from_sql_and_values(
            backend,
            sql,
            vec![now.into(), consumer.to_string().into(), queue.to_string().into()],
        );

        let result = self.db.execute(statement).await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        // The (delivered_to, delivered_at) pair we just wrote identifies the
        // claimed row.
        let claimed = queue_messages::Entity::find()
            .filter(queue_messages::Column::DeliveredTo.eq(consumer))
            .filter(queue_messages::Column::DeliveredAt.eq(now))
            .one(self.db.as_ref())
            .await?;

        match claimed {
            Some(message) => {
                let body = serde_json::from_str(&message.body)?;
                Ok(Some(Delivery {
                    message_id: message.id,
                    queue: message.queue,
                    body,
                }))
            }
            None => {
                tracing::error!(
                    "Claim succeeded on {} but the claimed row could not be read back",
                    queue
                );
                Ok(None)
            }
        }
    }

    /// Acknowledge a delivered message: terminal state reached, drop it.
    pub async fn ack(&self, message_id: &str) -> Result<()> {
        queue_messages::Entity::delete_by_id(message_id)
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Reject without requeue: the message goes to the dead-letter state for
    /// operator review.
    pub async fn nack(&self, message_id: &str) -> Result<()> {
        if let Some(message) = queue_messages::Entity::find_by_id(message_id)
            .one(self.db.as_ref())
            .await?
        {
            let mut active: queue_messages::ActiveModel = message.into();
            active.state = Set(MessageState::Dead.to_string());
            active.update(self.db.as_ref()).await?;
        }
        Ok(())
    }

    /// Number of ready (undelivered) messages on a queue.
    pub async fn depth(&self, queue: &str) -> Result<u64> {
        Ok(queue_messages::Entity::find()
            .filter(queue_messages::Column::Queue.eq(queue))
            .filter(queue_messages::Column::State.eq(MessageState::Ready.to_string()))
            .count(self.db.as_ref())
            .await?)
    }

    pub async fn dead_letter_count(&self) -> Result<u64> {
        Ok(queue_messages::Entity::find()
            .filter(queue_messages::Column::State.eq(MessageState::Dead.to_string()))
            .count(self.db.as_ref())
            .await?)
    }

    /// Return delivered-but-unacked messages older than the visibility
    /// timeout to ready. This is the at-least-once half of the contract.
    pub async fn requeue_expired(&self, visibility_seconds: i64) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp_micros() - visibility_seconds * 1_000_000;
        let expired = queue_messages::Entity::find()
            .filter(queue_messages::Column::State.eq(MessageState::Delivered.to_string()))
            .filter(queue_messages::Column::DeliveredAt.lt(cutoff))
            .all(self.db.as_ref())
            .await?;

        let mut requeued = 0u64;
        for message in expired {
            let id = message.id.clone();
            let mut active: queue_messages::ActiveModel = message.into();
            active.state = Set(MessageState::Ready.to_string());
            active.delivered_at = Set(None);
            active.delivered_to = Set(None);
            active.update(self.db.as_ref()).await?;
            requeued += 1;
            tracing::warn!("Requeued unacked message {}", id);
        }
        Ok(requeued)
    }

    /// Background sweep that returns expired deliveries to their queues.
    pub fn start_redelivery_sweep(
        &self,
        token: CancellationToken,
        interval: Duration,
        visibility_seconds: i64,
    ) {
        let bus = self.clone();
        tokio::spawn(async move {
            tracing::info!("Bus redelivery sweep started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {}
                }
                match bus.requeue_expired(visibility_seconds).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("Redelivery sweep requeued {} messages", n),
                    Err(e) => tracing::error!("Redelivery sweep failed: {}", e),
                }
            }
            tracing::info!("Bus redelivery sweep stopped");
        });
    }
}
