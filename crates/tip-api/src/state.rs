//! Shared application state.

use std::sync::Arc;

use sqlx::PgPool;
use tip_core::clock::{Clock, MonotonicClock, SystemClock};
use tip_core::store::{EventStore, OutboxRepository};
use tip_event_store::pg_event_store::PgEventStore;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Stamps `ts_ingested` on recorded events.
    pub clock: Arc<dyn Clock>,
    /// System of record for events.
    pub event_store: Arc<dyn EventStore>,
    /// Outbox inspection and quarantine operations.
    pub outbox: Arc<dyn OutboxRepository>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        event_store: Arc<dyn EventStore>,
        outbox: Arc<dyn OutboxRepository>,
    ) -> Self {
        Self {
            clock,
            event_store,
            outbox,
        }
    }

    /// State backed by Postgres and a monotonic system clock.
    #[must_use]
    pub fn postgres(pool: PgPool) -> Self {
        let store = Arc::new(PgEventStore::new(pool));
        Self::new(
            Arc::new(MonotonicClock::new(SystemClock)),
            store.clone(),
            store,
        )
    }
}
