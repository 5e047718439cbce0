//! Idempotent consumption contract.
//!
//! Consumers key idempotency on `dedupe_key`: processing the same event a
//! second time must be a no-op. They acknowledge only after their side
//! effects are durable, so a crash before the acknowledgement causes a
//! redelivery that must be tolerated until the bus dead-letters the message.

use async_trait::async_trait;
use thiserror::Error;

use crate::error::DomainError;
use crate::outbox::BusMessage;
use crate::payload::TypedPayload;

/// An event as seen by a consumer.
#[derive(Debug, Clone)]
pub struct DeliveredEvent {
    /// The decoded envelope.
    pub message: BusMessage,
    /// The envelope's `payload_json`, decoded.
    pub payload: TypedPayload,
    /// How many times the bus has delivered this message, this one included.
    pub receive_count: u32,
}

/// A handler failure. The message is left unacknowledged and redelivered.
#[derive(Debug, Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

/// Consumer-side business logic.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Applies the event's side effects.
    async fn handle(&self, event: &DeliveredEvent) -> Result<(), HandlerError>;
}

/// Durable record of dedupe keys whose side effects have been committed.
#[async_trait]
pub trait ProcessedKeys: Send + Sync {
    /// Whether `dedupe_key` has already been processed.
    async fn contains(&self, dedupe_key: &str) -> Result<bool, DomainError>;

    /// Records `dedupe_key` as processed. Recording twice is harmless.
    async fn insert(&self, dedupe_key: &str) -> Result<(), DomainError>;
}
