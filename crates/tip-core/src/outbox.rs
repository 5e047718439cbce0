//! Outbox entries and the message envelope they carry.
//!
//! An outbox entry is created in the same transaction as its event and is
//! mutated only by the dispatcher. `published_at` moves from `None` to
//! `Some` exactly once and never reverts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{Event, EventType, Source};

/// Pointers to the archived copies of an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRefs {
    /// Raw archive location.
    pub raw: Option<String>,
    /// Normalized archive location.
    pub normalized: Option<String>,
    /// Content checksum.
    pub hash: Option<String>,
}

/// The self-describing message published to the bus.
///
/// Carries `event_id`, `dedupe_key` and `payload_json` verbatim so a message
/// parked on the dead-letter queue can be inspected and replayed on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Identity of the published event.
    pub event_id: Uuid,
    /// Consumer idempotency token.
    pub dedupe_key: String,
    /// Payload schema version.
    pub schema_version: String,
    /// What the event describes.
    pub event_type: EventType,
    /// Where the event came from.
    pub source: Source,
    /// Ticker symbol.
    pub symbol: Option<String>,
    /// Source-specific entity.
    pub entity_id: Option<String>,
    /// When the real-world fact occurred.
    pub ts_event: DateTime<Utc>,
    /// When the system recorded the event.
    pub ts_ingested: DateTime<Utc>,
    /// Opaque severity.
    pub severity: i32,
    /// Opaque confidence.
    pub confidence: Option<f64>,
    /// Canonical event body, verbatim.
    pub payload_json: serde_json::Value,
    /// Archive pointers.
    #[serde(default)]
    pub payload_refs: PayloadRefs,
}

impl From<&Event> for BusMessage {
    fn from(event: &Event) -> Self {
        Self {
            event_id: event.event_id,
            dedupe_key: event.dedupe_key.clone(),
            schema_version: event.schema_version.clone(),
            event_type: event.event_type,
            source: event.source,
            symbol: event.symbol.clone(),
            entity_id: event.entity_id.clone(),
            ts_event: event.ts_event,
            ts_ingested: event.ts_ingested,
            severity: event.severity,
            confidence: event.confidence,
            payload_json: event.payload_json.clone(),
            payload_refs: PayloadRefs {
                raw: event.raw_s3_uri.clone(),
                normalized: event.normalized_s3_uri.clone(),
                hash: event.hash.clone(),
            },
        }
    }
}

impl BusMessage {
    /// Serializes the envelope into the outbox payload column.
    ///
    /// # Panics
    ///
    /// Never in practice: every field serializes to JSON.
    #[must_use]
    pub fn to_payload(&self) -> serde_json::Value {
        // Serialization of derived Serialize types to Value is infallible.
        serde_json::to_value(self).expect("BusMessage serialization is infallible")
    }
}

/// A pending or published delivery record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxEntry {
    /// Monotonic surrogate key; the claim ordering hint.
    pub outbox_id: i64,
    /// The owning event.
    pub event_id: Uuid,
    /// Dedupe key of the owning event, forwarded as a message attribute.
    pub dedupe_key: String,
    /// Denormalized copy of the data to publish. Opaque to the dispatcher.
    pub payload: serde_json::Value,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// Set once, on confirmed bus acceptance.
    pub published_at: Option<DateTime<Utc>>,
    /// Failed publish attempts so far.
    pub attempts: i32,
    /// Last publish error, for operators.
    pub last_error: Option<String>,
    /// Earliest time the row may be claimed again after a failure.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Set when the row has been parked as a poison row.
    pub quarantined_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Whether the entry still awaits publication.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.published_at.is_none()
    }

    /// The bytes handed to the bus.
    #[must_use]
    pub fn body(&self) -> Vec<u8> {
        self.payload.to_string().into_bytes()
    }
}

/// Parameters of one claim step.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Upper bound on rows returned.
    pub limit: usize,
    /// The claimer's notion of "now", for backoff and lease checks.
    pub now: DateTime<Utc>,
    /// When set, rows are stamped as in-progress until this instant so other
    /// dispatcher instances skip them.
    pub lease_until: Option<DateTime<Utc>>,
    /// Identifies the claiming dispatcher instance.
    pub claimant: String,
}

/// Outcome recorded against a row whose publish failed.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    /// Human-readable error.
    pub error: String,
    /// Earliest next claim time; `None` means "next cycle".
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Park the row until an operator releases it.
    pub quarantine: bool,
}

/// Snapshot of undelivered work, for alerting on backlog age.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogStats {
    /// Unpublished rows eligible for dispatch.
    pub pending: i64,
    /// Unpublished rows parked as poison.
    pub quarantined: i64,
    /// Creation time of the oldest pending row.
    pub oldest_pending_at: Option<DateTime<Utc>>,
    /// Age of the oldest pending row in seconds, relative to the query time.
    pub oldest_pending_age_secs: Option<i64>,
}

impl BacklogStats {
    /// Builds stats from raw counts, deriving the age from `now`.
    #[must_use]
    pub fn new(
        pending: i64,
        quarantined: i64,
        oldest_pending_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            pending,
            quarantined,
            oldest_pending_at,
            oldest_pending_age_secs: oldest_pending_at.map(|t| (now - t).num_seconds().max(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn event() -> Event {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        Event {
            event_id: Uuid::new_v4(),
            schema_version: "v1".into(),
            event_type: EventType::SocialMentions,
            source: Source::Wsb,
            symbol: Some("AAPL".into()),
            entity_id: None,
            ts_event: ts,
            ts_ingested: ts,
            dedupe_key: "wsb:2024-01-01:AAPL:post123".into(),
            severity: 50,
            confidence: None,
            payload_json: serde_json::json!({"text": "to the moon"}),
            raw_s3_uri: Some("s3://tip-dev/raw/wsb/post123.json.gz".into()),
            normalized_s3_uri: None,
            hash: None,
        }
    }

    #[test]
    fn test_bus_message_is_self_describing() {
        let event = event();
        let payload = BusMessage::from(&event).to_payload();

        assert_eq!(payload["event_id"], event.event_id.to_string());
        assert_eq!(payload["dedupe_key"], "wsb:2024-01-01:AAPL:post123");
        assert_eq!(payload["event_type"], "SOCIAL.MENTIONS");
        assert_eq!(payload["payload_json"], event.payload_json);
        assert_eq!(
            payload["payload_refs"]["raw"],
            "s3://tip-dev/raw/wsb/post123.json.gz"
        );
    }

    #[test]
    fn test_backlog_age_is_derived_from_now() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let stats = BacklogStats::new(3, 1, Some(now - Duration::seconds(90)), now);

        assert_eq!(stats.oldest_pending_age_secs, Some(90));
        assert_eq!(BacklogStats::new(0, 0, None, now).oldest_pending_age_secs, None);
    }
}
