//! Query handlers for the ingestion context.

use tip_core::error::DomainError;
use tip_core::event::Event;
use tip_core::store::EventStore;
use uuid::Uuid;

/// Retrieves a recorded event by its identity.
///
/// # Errors
///
/// Returns `DomainError::EventNotFound` if no event has the ID.
/// Returns `DomainError::Infrastructure` if the store cannot be read.
pub async fn get_event_by_id(event_id: Uuid, store: &dyn EventStore) -> Result<Event, DomainError> {
    store
        .find_event(event_id)
        .await?
        .ok_or(DomainError::EventNotFound(event_id))
}

/// Retrieves a recorded event by its dedupe key, if one exists.
///
/// # Errors
///
/// Returns `DomainError::Infrastructure` if the store cannot be read.
pub async fn find_event_by_dedupe_key(
    dedupe_key: &str,
    store: &dyn EventStore,
) -> Result<Option<Event>, DomainError> {
    store.find_by_dedupe_key(dedupe_key).await
}
