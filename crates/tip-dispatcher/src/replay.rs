//! Republishing recorded events for a time window.
//!
//! Replay reads the event table, not the outbox, and publishes straight to
//! the bus. Outbox rows are left untouched; consumers dedupe the repeats.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tip_core::bus::{EventBus, OutgoingMessage, PublishError};
use tip_core::outbox::BusMessage;
use tip_core::store::{EventStore, ReplayAxis, ReplayWindow};
use tracing::{info, instrument, warn};

use crate::error::DispatchError;

/// What a replay did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Events inside the window.
    pub matched: usize,
    /// Events the bus accepted.
    pub published: usize,
    /// Events whose publish failed.
    pub failed: usize,
}

/// The window covering the last `minutes` minutes up to `now`.
///
/// # Errors
///
/// Returns `DispatchError::Config` for a negative or out-of-range length.
pub fn last_minutes(
    minutes: i64,
    axis: ReplayAxis,
    now: DateTime<Utc>,
) -> Result<ReplayWindow, DispatchError> {
    if minutes < 0 {
        return Err(DispatchError::Config("replay minutes must not be negative".into()));
    }
    let length = chrono::Duration::try_minutes(minutes)
        .ok_or_else(|| DispatchError::Config(format!("replay window of {minutes} minutes is out of range")))?;
    Ok(ReplayWindow {
        axis,
        start: now - length,
        end: now,
    })
}

/// Republishes every event in `window`, oldest first by the window's axis.
///
/// # Errors
///
/// Returns `DispatchError::Store` if the events cannot be read. Individual
/// publish failures are counted, not returned.
#[instrument(skip(store, bus), fields(start = %window.start, end = %window.end, axis = ?window.axis))]
pub async fn replay(
    store: &dyn EventStore,
    bus: &dyn EventBus,
    window: ReplayWindow,
    publish_timeout: Duration,
) -> Result<ReplayReport, DispatchError> {
    let events = store.events_between(window).await?;
    let mut report = ReplayReport {
        matched: events.len(),
        ..ReplayReport::default()
    };

    for event in &events {
        let message = OutgoingMessage {
            event_id: event.event_id,
            dedupe_key: event.dedupe_key.clone(),
            body: BusMessage::from(event).to_payload().to_string().into_bytes(),
        };
        let result = tokio::time::timeout(publish_timeout, bus.send(message))
            .await
            .unwrap_or(Err(PublishError::Timeout(publish_timeout)));
        match result {
            Ok(_) => report.published += 1,
            Err(e) => {
                report.failed += 1;
                warn!(event_id = %event.event_id, dedupe_key = %event.dedupe_key, error = %e, "replay publish failed");
            }
        }
    }

    info!(?report, "replay finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tip_core::store::EventStore as _;
    use tip_test_support::{InMemoryEventStore, RecordingBus, make_event};

    use super::*;

    #[tokio::test]
    async fn test_replay_republishes_window_in_order() {
        // Arrange
        let store = InMemoryEventStore::new();
        let bus = RecordingBus::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        for (key, minutes_ago) in [("old", 90), ("b", 10), ("a", 20)] {
            let event = make_event(key, now - chrono::Duration::minutes(minutes_ago));
            store
                .record_event(&event, &BusMessage::from(&event).to_payload())
                .await
                .unwrap();
        }
        let window = last_minutes(60, ReplayAxis::IngestedTime, now).unwrap();

        // Act
        let report = replay(&store, &bus, window, Duration::from_secs(1))
            .await
            .unwrap();

        // Assert
        assert_eq!(report.matched, 2);
        assert_eq!(report.published, 2);
        assert_eq!(bus.accepted_dedupe_keys(), vec!["a", "b"]);
        assert!(store.outbox_entries().iter().all(|e| e.is_pending()));
    }

    #[tokio::test]
    async fn test_replay_counts_failures() {
        // Arrange
        let store = InMemoryEventStore::new();
        let bus = RecordingBus::failing(PublishError::Transient("down".into()));
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let event = make_event("a", now);
        store
            .record_event(&event, &BusMessage::from(&event).to_payload())
            .await
            .unwrap();
        let window = last_minutes(5, ReplayAxis::IngestedTime, now).unwrap();

        // Act
        let report = replay(&store, &bus, window, Duration::from_secs(1))
            .await
            .unwrap();

        // Assert
        assert_eq!(report, ReplayReport { matched: 1, published: 0, failed: 1 });
    }

    #[test]
    fn test_negative_window_is_rejected() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        assert!(matches!(
            last_minutes(-1, ReplayAxis::EventTime, now),
            Err(DispatchError::Config(_))
        ));
    }
}
