use crate::errors::ReelPipeError;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Durable bus storage. Messages are FIFO per queue by (enqueued_at, id);
/// a delivered-but-unacked message returns to ready after the visibility
/// timeout, which is what makes delivery at-least-once.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "queue_messages")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub queue: String,
    pub body: String, // JSON
    pub state: String, // 'ready', 'delivered', 'dead'
    pub delivered_at: Option<i64>,
    pub delivered_to: Option<String>,
    pub enqueued_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Ready,
    Delivered,
    Dead,
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageState::Ready => write!(f, "ready"),
            MessageState::Delivered => write!(f, "delivered"),
            MessageState::Dead => write!(f, "dead"),
        }
    }
}

impl TryFrom<&str> for MessageState {
    type Error = ReelPipeError;

    fn try_from(s: &str) -> Result<Self, ReelPipeError> {
        match s {
            "ready" => Ok(MessageState::Ready),
            "delivered" => Ok(MessageState::Delivered),
            "dead" => Ok(MessageState::Dead),
            other => Err(ReelPipeError::InvalidInput(format!(
                "Unknown message state tag: {other}"
            ))),
        }
    }
}
