//! Event store and outbox repository abstractions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DomainError;
use crate::event::Event;
use crate::outbox::{BacklogStats, ClaimRequest, DeliveryFailure, OutboxEntry};

/// Which timestamp a replay window is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayAxis {
    /// When the real-world fact occurred.
    EventTime,
    /// When the system recorded the event.
    IngestedTime,
}

/// Inclusive time range for replaying recorded events.
#[derive(Debug, Clone, Copy)]
pub struct ReplayWindow {
    /// Timestamp the range applies to.
    pub axis: ReplayAxis,
    /// Inclusive lower bound.
    pub start: DateTime<Utc>,
    /// Inclusive upper bound.
    pub end: DateTime<Utc>,
}

/// The system of record for canonical events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically inserts `event` and exactly one pending outbox row carrying
    /// `outbox_payload`. Either both rows exist afterwards or neither does.
    ///
    /// Returns `DomainError::DuplicateEvent` if the dedupe key is already
    /// recorded and `DomainError::TransactionFailure` if the write could not
    /// commit.
    async fn record_event(
        &self,
        event: &Event,
        outbox_payload: &serde_json::Value,
    ) -> Result<Uuid, DomainError>;

    /// Loads an event by identity.
    async fn find_event(&self, event_id: Uuid) -> Result<Option<Event>, DomainError>;

    /// Loads an event by dedupe key.
    async fn find_by_dedupe_key(&self, dedupe_key: &str) -> Result<Option<Event>, DomainError>;

    /// Loads events inside `window`, ordered by the window's timestamp.
    async fn events_between(&self, window: ReplayWindow) -> Result<Vec<Event>, DomainError>;
}

/// The dispatcher's view of the outbox table.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Claims up to `request.limit` unpublished, non-quarantined rows that
    /// are due, ordered by `outbox_id` ascending.
    async fn claim_pending(&self, request: &ClaimRequest)
    -> Result<Vec<OutboxEntry>, DomainError>;

    /// Sets `published_at` if it is still unset. Returns `true` when this call
    /// performed the transition, `false` if the row was already published.
    async fn mark_published(
        &self,
        outbox_id: i64,
        published_at: DateTime<Utc>,
    ) -> Result<bool, DomainError>;

    /// Records a failed publish against a still-unpublished row.
    async fn record_failure(
        &self,
        outbox_id: i64,
        failure: &DeliveryFailure,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError>;

    /// Counts undelivered rows and the age of the oldest one.
    async fn backlog_stats(&self, now: DateTime<Utc>) -> Result<BacklogStats, DomainError>;

    /// Lists quarantined rows, oldest first.
    async fn list_quarantined(&self, limit: usize) -> Result<Vec<OutboxEntry>, DomainError>;

    /// Returns a quarantined row to the pending pool with its failure state
    /// reset. Returns `false` if the row exists but is not quarantined.
    async fn release_quarantined(&self, outbox_id: i64) -> Result<bool, DomainError>;
}
