//! In-memory `EventStore` and `OutboxRepository` with failure injection.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tip_core::error::DomainError;
use tip_core::event::Event;
use tip_core::outbox::{BacklogStats, ClaimRequest, DeliveryFailure, OutboxEntry};
use tip_core::store::{EventStore, OutboxRepository, ReplayAxis, ReplayWindow};
use uuid::Uuid;

#[derive(Debug)]
struct OutboxRow {
    entry: OutboxEntry,
    claimed_until: Option<DateTime<Utc>>,
}

impl OutboxRow {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.entry.published_at.is_none()
            && self.entry.quarantined_at.is_none()
            && self.entry.next_attempt_at.is_none_or(|t| t <= now)
            && self.claimed_until.is_none_or(|t| t <= now)
    }
}

#[derive(Debug, Default)]
struct State {
    events: Vec<Event>,
    outbox: Vec<OutboxRow>,
    next_outbox_id: i64,
}

/// A store that keeps events and outbox rows in memory with the same
/// visibility rules as the `PostgreSQL` store.
///
/// Failures can be injected per operation to exercise the dispatcher's and
/// the ingestion service's error paths.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    state: Mutex<State>,
    fail_next_outbox_insert: AtomicBool,
    fail_claims: AtomicBool,
    fail_marks: AtomicBool,
    mark_calls: AtomicUsize,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `record_event` fail after the event insert, as if the
    /// outbox insert had been rejected. Nothing is persisted.
    pub fn fail_next_outbox_insert(&self) {
        self.fail_next_outbox_insert.store(true, Ordering::SeqCst);
    }

    /// Makes `claim_pending` fail while set.
    pub fn set_fail_claims(&self, fail: bool) {
        self.fail_claims.store(fail, Ordering::SeqCst);
    }

    /// Makes `mark_published` fail while set.
    pub fn set_fail_marks(&self, fail: bool) {
        self.fail_marks.store(fail, Ordering::SeqCst);
    }

    /// Number of `mark_published` calls, failed ones included.
    pub fn mark_calls(&self) -> usize {
        self.mark_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of all recorded events, in insertion order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    /// Snapshot of all outbox rows, in `outbox_id` order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.state
            .lock()
            .unwrap()
            .outbox
            .iter()
            .map(|row| row.entry.clone())
            .collect()
    }

    /// The outbox row for `event_id`, if any.
    pub fn outbox_entry_for(&self, event_id: Uuid) -> Option<OutboxEntry> {
        self.outbox_entries()
            .into_iter()
            .find(|entry| entry.event_id == event_id)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn record_event(
        &self,
        event: &Event,
        outbox_payload: &serde_json::Value,
    ) -> Result<Uuid, DomainError> {
        let mut state = self.state.lock().unwrap();

        if let Some(existing) = state
            .events
            .iter()
            .find(|e| e.dedupe_key == event.dedupe_key)
        {
            return Err(DomainError::DuplicateEvent {
                dedupe_key: event.dedupe_key.clone(),
                existing_event_id: Some(existing.event_id),
            });
        }
        if state.events.iter().any(|e| e.event_id == event.event_id) {
            return Err(DomainError::Validation(
                "event_id is already assigned".into(),
            ));
        }
        if self.fail_next_outbox_insert.swap(false, Ordering::SeqCst) {
            return Err(DomainError::TransactionFailure(
                "outbox insert rejected".into(),
            ));
        }

        state.next_outbox_id += 1;
        let outbox_id = state.next_outbox_id;
        state.events.push(event.clone());
        state.outbox.push(OutboxRow {
            entry: OutboxEntry {
                outbox_id,
                event_id: event.event_id,
                dedupe_key: event.dedupe_key.clone(),
                payload: outbox_payload.clone(),
                created_at: event.ts_ingested,
                published_at: None,
                attempts: 0,
                last_error: None,
                next_attempt_at: None,
                quarantined_at: None,
            },
            claimed_until: None,
        });
        Ok(event.event_id)
    }

    async fn find_event(&self, event_id: Uuid) -> Result<Option<Event>, DomainError> {
        let state = self.state.lock().unwrap();
        Ok(state.events.iter().find(|e| e.event_id == event_id).cloned())
    }

    async fn find_by_dedupe_key(&self, dedupe_key: &str) -> Result<Option<Event>, DomainError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .events
            .iter()
            .find(|e| e.dedupe_key == dedupe_key)
            .cloned())
    }

    async fn events_between(&self, window: ReplayWindow) -> Result<Vec<Event>, DomainError> {
        let key = |e: &Event| match window.axis {
            ReplayAxis::EventTime => e.ts_event,
            ReplayAxis::IngestedTime => e.ts_ingested,
        };
        let state = self.state.lock().unwrap();
        let mut events: Vec<Event> = state
            .events
            .iter()
            .filter(|e| (window.start..=window.end).contains(&key(e)))
            .cloned()
            .collect();
        events.sort_by_key(|e| (key(e), e.event_id));
        Ok(events)
    }
}

#[async_trait]
impl OutboxRepository for InMemoryEventStore {
    async fn claim_pending(
        &self,
        request: &ClaimRequest,
    ) -> Result<Vec<OutboxEntry>, DomainError> {
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(DomainError::Infrastructure("connection refused".into()));
        }
        let mut state = self.state.lock().unwrap();
        let claimed = state
            .outbox
            .iter_mut()
            .filter(|row| row.is_due(request.now))
            .take(request.limit)
            .map(|row| {
                if request.lease_until.is_some() {
                    row.claimed_until = request.lease_until;
                }
                row.entry.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn mark_published(
        &self,
        outbox_id: i64,
        published_at: DateTime<Utc>,
    ) -> Result<bool, DomainError> {
        self.mark_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_marks.load(Ordering::SeqCst) {
            return Err(DomainError::Infrastructure("connection reset".into()));
        }
        let mut state = self.state.lock().unwrap();
        let row = state
            .outbox
            .iter_mut()
            .find(|row| row.entry.outbox_id == outbox_id)
            .ok_or(DomainError::OutboxEntryNotFound(outbox_id))?;
        if row.entry.published_at.is_some() {
            return Ok(false);
        }
        row.entry.published_at = Some(published_at);
        row.claimed_until = None;
        Ok(true)
    }

    async fn record_failure(
        &self,
        outbox_id: i64,
        failure: &DeliveryFailure,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .outbox
            .iter_mut()
            .find(|row| row.entry.outbox_id == outbox_id)
            .ok_or(DomainError::OutboxEntryNotFound(outbox_id))?;
        if row.entry.published_at.is_some() {
            return Ok(());
        }
        row.entry.attempts += 1;
        row.entry.last_error = Some(failure.error.clone());
        row.entry.next_attempt_at = failure.next_attempt_at;
        if failure.quarantine {
            row.entry.quarantined_at = Some(now);
        }
        row.claimed_until = None;
        Ok(())
    }

    async fn backlog_stats(&self, now: DateTime<Utc>) -> Result<BacklogStats, DomainError> {
        let state = self.state.lock().unwrap();
        let unpublished = state
            .outbox
            .iter()
            .filter(|row| row.entry.published_at.is_none());
        let (mut pending, mut quarantined, mut oldest) = (0, 0, None::<DateTime<Utc>>);
        for row in unpublished {
            if row.entry.quarantined_at.is_some() {
                quarantined += 1;
            } else {
                pending += 1;
                let created = row.entry.created_at;
                oldest = Some(oldest.map_or(created, |o| o.min(created)));
            }
        }
        Ok(BacklogStats::new(pending, quarantined, oldest, now))
    }

    async fn list_quarantined(&self, limit: usize) -> Result<Vec<OutboxEntry>, DomainError> {
        let state = self.state.lock().unwrap();
        let mut parked: Vec<OutboxEntry> = state
            .outbox
            .iter()
            .filter(|row| row.entry.published_at.is_none() && row.entry.quarantined_at.is_some())
            .map(|row| row.entry.clone())
            .collect();
        parked.sort_by_key(|entry| (entry.quarantined_at, entry.outbox_id));
        parked.truncate(limit);
        Ok(parked)
    }

    async fn release_quarantined(&self, outbox_id: i64) -> Result<bool, DomainError> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .outbox
            .iter_mut()
            .find(|row| row.entry.outbox_id == outbox_id)
            .ok_or(DomainError::OutboxEntryNotFound(outbox_id))?;
        if row.entry.published_at.is_some() || row.entry.quarantined_at.is_none() {
            return Ok(false);
        }
        row.entry.quarantined_at = None;
        row.entry.next_attempt_at = None;
        row.entry.attempts = 0;
        row.entry.last_error = None;
        Ok(true)
    }
}
