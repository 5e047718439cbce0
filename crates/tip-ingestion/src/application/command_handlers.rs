//! Command handlers for the ingestion context.
//!
//! This module contains the application-level handler that validates a
//! candidate, assigns its identity and ingestion time, and persists the event
//! together with its outbox row.

use tip_core::clock::Clock;
use tip_core::dedupe;
use tip_core::error::DomainError;
use tip_core::event::{CandidateEvent, Event};
use tip_core::outbox::BusMessage;
use tip_core::store::EventStore;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::commands::RecordEvent;
use crate::domain::outcome::IngestOutcome;

/// Fills in a content-derived dedupe key when the producer supplied none.
///
/// The key is the hash of the candidate's canonical JSON with the dedupe key
/// itself left empty, so the same normalized record always maps to the same
/// key.
fn with_dedupe_key(mut candidate: CandidateEvent) -> Result<CandidateEvent, DomainError> {
    if candidate.dedupe_key.trim().is_empty() {
        candidate.dedupe_key.clear();
        let normalized = serde_json::to_value(&candidate).map_err(|e| {
            DomainError::Validation(format!("candidate is not serializable: {e}"))
        })?;
        candidate.dedupe_key = dedupe::content_key(&normalized);
    }
    Ok(candidate)
}

/// Builds the event a candidate becomes once recorded.
///
/// # Errors
///
/// Returns `DomainError::Validation` if the candidate violates a field
/// constraint.
pub fn prepare_event(
    candidate: CandidateEvent,
    clock: &dyn Clock,
) -> Result<Event, DomainError> {
    let candidate = with_dedupe_key(candidate)?;
    candidate.validate()?;
    Ok(candidate.into_event(Uuid::now_v7(), clock.now()))
}

/// Handles the `RecordEvent` command: validates the candidate, then writes
/// the event and its pending outbox row atomically.
///
/// A dedupe key that is already recorded yields `IngestOutcome::Duplicate`;
/// the caller treats that as success.
///
/// # Errors
///
/// Returns `DomainError::Validation` for an invalid candidate and
/// `DomainError::TransactionFailure` if the write could not commit. The
/// latter is safe to retry with the same candidate.
#[instrument(skip_all, fields(correlation_id = %command.correlation_id, dedupe_key = %command.candidate.dedupe_key))]
pub async fn handle_record_event(
    command: &RecordEvent,
    clock: &dyn Clock,
    store: &dyn EventStore,
) -> Result<IngestOutcome, DomainError> {
    let event = prepare_event(command.candidate.clone(), clock)?;
    let payload = BusMessage::from(&event).to_payload();

    match store.record_event(&event, &payload).await {
        Ok(event_id) => {
            info!(%event_id, dedupe_key = %event.dedupe_key, event_type = %event.event_type, "event recorded");
            Ok(IngestOutcome::Recorded { event_id })
        }
        Err(DomainError::DuplicateEvent {
            dedupe_key,
            existing_event_id,
        }) => {
            debug!(%dedupe_key, ?existing_event_id, "duplicate event ignored");
            Ok(IngestOutcome::Duplicate {
                dedupe_key,
                existing_event_id,
            })
        }
        Err(e) => Err(e),
    }
}
