//! Ready-made candidates and events.

use chrono::{DateTime, Duration, TimeZone, Utc};
use tip_core::event::{CandidateEvent, Event, EventType, SCHEMA_VERSION_V1, Source};
use uuid::Uuid;

/// A valid `SOCIAL.MENTIONS` candidate with the given dedupe key.
///
/// # Panics
///
/// Never; the fixed timestamp is valid.
#[must_use]
pub fn make_candidate(dedupe_key: &str) -> CandidateEvent {
    CandidateEvent {
        schema_version: SCHEMA_VERSION_V1.to_owned(),
        event_type: EventType::SocialMentions,
        source: Source::Wsb,
        symbol: Some("AAPL".into()),
        entity_id: Some("u/deepvalue".into()),
        ts_event: Utc.with_ymd_and_hms(2024, 1, 1, 9, 30, 0).unwrap(),
        dedupe_key: dedupe_key.to_owned(),
        severity: 40,
        confidence: Some(0.6),
        payload_json: serde_json::json!({
            "postId": dedupe_key,
            "text": "AAPL calls printing",
            "upvotes": 128,
            "tickers": ["AAPL"]
        }),
        raw_s3_uri: None,
        normalized_s3_uri: None,
        hash: None,
    }
}

/// A recorded event built from [`make_candidate`], ingested at `ts_ingested`.
#[must_use]
pub fn make_event(dedupe_key: &str, ts_ingested: DateTime<Utc>) -> Event {
    let mut candidate = make_candidate(dedupe_key);
    candidate.ts_event = ts_ingested - Duration::minutes(1);
    candidate.into_event(Uuid::now_v7(), ts_ingested)
}
