//! Domain error types.

use thiserror::Error;
use uuid::Uuid;

/// Top-level domain error type.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An event with the same dedupe key has already been recorded.
    ///
    /// Callers treat this as an idempotent success, never as a failure to
    /// retry.
    #[error("duplicate event for dedupe key {dedupe_key}")]
    DuplicateEvent {
        /// The dedupe key that collided.
        dedupe_key: String,
        /// The event already recorded under that key, when known.
        existing_event_id: Option<Uuid>,
    },

    /// The atomic event + outbox write could not commit. Nothing was
    /// persisted; the whole ingestion call may be retried.
    #[error("transaction failure: {0}")]
    TransactionFailure(String),

    /// An event was not found.
    #[error("event not found: {0}")]
    EventNotFound(Uuid),

    /// An outbox entry was not found.
    #[error("outbox entry not found: {0}")]
    OutboxEntryNotFound(i64),

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl DomainError {
    /// Returns `true` for the benign duplicate-ingestion outcome.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateEvent { .. })
    }
}
