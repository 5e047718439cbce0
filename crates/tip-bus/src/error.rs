//! Broker error types.

use thiserror::Error;

/// Errors raised by queue operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// No queue with this name exists.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// A queue with this name already exists.
    #[error("queue already exists: {0}")]
    QueueAlreadyExists(String),

    /// The dead-letter queue does not accept redrive from this source.
    #[error("queue {dead_letter_queue} does not allow redrive from {source_queue}")]
    RedriveNotAllowed {
        /// Queue whose messages would be redriven.
        source_queue: String,
        /// The refusing dead-letter queue.
        dead_letter_queue: String,
    },

    /// The receipt does not match an in-flight delivery. Its visibility
    /// timeout may have expired.
    #[error("unknown or expired receipt: {0}")]
    UnknownReceipt(String),

    /// Redis command failure.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Unexpected broker response shape.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Convenience alias for broker results.
pub type BusResult<T> = Result<T, BusError>;
