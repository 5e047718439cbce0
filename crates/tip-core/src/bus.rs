//! Publisher side of the event bus boundary.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// A message handed to the bus.
///
/// The body is opaque bytes; the identity fields travel alongside as message
/// attributes so consumers and dead-letter tooling can dedupe without parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Identity of the published event.
    pub event_id: Uuid,
    /// Consumer idempotency token.
    pub dedupe_key: String,
    /// Serialized envelope.
    pub body: Vec<u8>,
}

/// Why a publish did not reach confirmed acceptance.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// Network or broker unavailable; retry later.
    #[error("transient publish failure: {0}")]
    Transient(String),

    /// The broker rejected the message itself.
    #[error("permanent publish failure: {0}")]
    Permanent(String),

    /// No answer within the publish deadline.
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

impl PublishError {
    /// Transient failures and timeouts are expected to clear on their own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// An at-least-once message bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Sends one message. `Ok` means the broker durably accepted it; only
    /// then may the outbox row be marked published. Returns the broker's
    /// message id.
    async fn send(&self, message: OutgoingMessage) -> Result<String, PublishError>;
}
