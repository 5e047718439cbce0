//! Integration tests for `PgEventStore`.

use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::PgPool;
use tip_core::error::DomainError;
use tip_core::event::{Event, EventType, Source};
use tip_core::outbox::{BusMessage, ClaimRequest, DeliveryFailure};
use tip_core::store::{EventStore, OutboxRepository, ReplayAxis, ReplayWindow};
use tip_event_store::pg_event_store::PgEventStore;
use uuid::Uuid;

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()
}

/// Helper to build an `Event` with sensible defaults.
fn make_event(dedupe_key: &str, ts_ingested: DateTime<Utc>) -> Event {
    Event {
        event_id: Uuid::now_v7(),
        schema_version: "v1".into(),
        event_type: EventType::SocialMentions,
        source: Source::Wsb,
        symbol: Some("AAPL".into()),
        entity_id: Some("u/deepvalue".into()),
        ts_event: ts_ingested - Duration::minutes(5),
        ts_ingested,
        dedupe_key: dedupe_key.into(),
        severity: 50,
        confidence: Some(0.75),
        payload_json: serde_json::json!({"postId": dedupe_key, "upvotes": 12}),
        raw_s3_uri: None,
        normalized_s3_uri: None,
        hash: None,
    }
}

async fn record(store: &PgEventStore, event: &Event) -> Uuid {
    store
        .record_event(event, &BusMessage::from(event).to_payload())
        .await
        .unwrap()
}

fn claim(limit: usize, now: DateTime<Utc>) -> ClaimRequest {
    ClaimRequest {
        limit,
        now,
        lease_until: None,
        claimant: "test".into(),
    }
}

async fn count(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

// --- record_event ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_record_event_writes_event_and_pending_outbox_row(pool: PgPool) {
    let store = PgEventStore::new(pool.clone());
    let event = make_event("wsb:2024-01-01:AAPL:post123", at(12, 0));

    let event_id = record(&store, &event).await;

    assert_eq!(event_id, event.event_id);
    let loaded = store.find_event(event_id).await.unwrap().unwrap();
    assert_eq!(loaded, event);

    let claimed = store.claim_pending(&claim(10, at(12, 1))).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].event_id, event_id);
    assert_eq!(claimed[0].dedupe_key, "wsb:2024-01-01:AAPL:post123");
    assert_eq!(claimed[0].created_at, event.ts_ingested);
    assert_eq!(claimed[0].attempts, 0);
    assert!(claimed[0].is_pending());
    assert_eq!(claimed[0].payload["payload_json"], event.payload_json);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_duplicate_dedupe_key_is_rejected_without_side_effects(pool: PgPool) {
    let store = PgEventStore::new(pool.clone());
    let first = make_event("edgar:0000320193-24-000001", at(12, 0));
    let first_id = record(&store, &first).await;

    let second = make_event("edgar:0000320193-24-000001", at(12, 5));
    let result = store
        .record_event(&second, &BusMessage::from(&second).to_payload())
        .await;

    match result {
        Err(DomainError::DuplicateEvent {
            dedupe_key,
            existing_event_id,
        }) => {
            assert_eq!(dedupe_key, "edgar:0000320193-24-000001");
            assert_eq!(existing_event_id, Some(first_id));
        }
        other => panic!("expected DuplicateEvent, got {other:?}"),
    }
    assert_eq!(count(&pool, "events").await, 1);
    assert_eq!(count(&pool, "outbox").await, 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_failed_outbox_insert_rolls_back_event(pool: PgPool) {
    sqlx::query(
        r"
        CREATE FUNCTION reject_outbox() RETURNS trigger AS $$
        BEGIN
            RAISE EXCEPTION 'outbox unavailable';
        END;
        $$ LANGUAGE plpgsql
        ",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_outbox BEFORE INSERT ON outbox \
         FOR EACH ROW EXECUTE FUNCTION reject_outbox()",
    )
    .execute(&pool)
    .await
    .unwrap();
    let store = PgEventStore::new(pool.clone());
    let event = make_event("wsb:2024-01-01:AAPL:post123", at(12, 0));

    let result = store
        .record_event(&event, &BusMessage::from(&event).to_payload())
        .await;

    assert!(matches!(result, Err(DomainError::TransactionFailure(_))));
    assert_eq!(count(&pool, "events").await, 0);
    assert_eq!(count(&pool, "outbox").await, 0);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_events_cannot_be_updated(pool: PgPool) {
    let store = PgEventStore::new(pool.clone());
    let event = make_event("wsb:2024-01-01:AAPL:post123", at(12, 0));
    record(&store, &event).await;

    let result = sqlx::query("UPDATE events SET severity = 99 WHERE event_id = $1")
        .bind(event.event_id)
        .execute(&pool)
        .await;

    assert!(result.is_err());
}

// --- claim_pending ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_claim_returns_rows_in_outbox_id_order_up_to_limit(pool: PgPool) {
    let store = PgEventStore::new(pool);
    let mut expected = Vec::new();
    for i in 0..5 {
        let event = make_event(&format!("market:AAPL:bar{i}"), at(12, i));
        expected.push(record(&store, &event).await);
    }

    let claimed = store.claim_pending(&claim(3, at(13, 0))).await.unwrap();

    let ids: Vec<Uuid> = claimed.iter().map(|e| e.event_id).collect();
    assert_eq!(ids, expected[..3]);
    assert!(claimed.windows(2).all(|w| w[0].outbox_id < w[1].outbox_id));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_leased_rows_are_skipped_until_the_lease_expires(pool: PgPool) {
    let store = PgEventStore::new(pool);
    record(&store, &make_event("market:AAPL:bar0", at(12, 0))).await;
    record(&store, &make_event("market:AAPL:bar1", at(12, 1))).await;

    let leased = ClaimRequest {
        limit: 1,
        now: at(13, 0),
        lease_until: Some(at(13, 1)),
        claimant: "dispatcher-a".into(),
    };
    let first = store.claim_pending(&leased).await.unwrap();
    assert_eq!(first.len(), 1);

    let during_lease = store.claim_pending(&claim(10, at(13, 0))).await.unwrap();
    assert_eq!(during_lease.len(), 1);
    assert_ne!(during_lease[0].outbox_id, first[0].outbox_id);

    let after_lease = store.claim_pending(&claim(10, at(13, 2))).await.unwrap();
    assert_eq!(after_lease.len(), 2);
}

// --- mark_published ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_mark_published_is_one_way(pool: PgPool) {
    let store = PgEventStore::new(pool);
    record(&store, &make_event("market:AAPL:bar0", at(12, 0))).await;
    let row = store.claim_pending(&claim(1, at(12, 1))).await.unwrap().remove(0);

    assert!(store.mark_published(row.outbox_id, at(12, 2)).await.unwrap());
    assert!(!store.mark_published(row.outbox_id, at(12, 3)).await.unwrap());

    let remaining = store.claim_pending(&claim(10, at(12, 4))).await.unwrap();
    assert!(remaining.is_empty());
    let stats = store.backlog_stats(at(12, 4)).await.unwrap();
    assert_eq!(stats.pending, 0);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_mark_published_unknown_row_is_not_found(pool: PgPool) {
    let store = PgEventStore::new(pool);

    let result = store.mark_published(4242, at(12, 0)).await;

    assert!(matches!(result, Err(DomainError::OutboxEntryNotFound(4242))));
}

// --- record_failure / quarantine ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_failure_defers_row_until_next_attempt(pool: PgPool) {
    let store = PgEventStore::new(pool);
    record(&store, &make_event("market:AAPL:bar0", at(12, 0))).await;
    let row = store.claim_pending(&claim(1, at(12, 1))).await.unwrap().remove(0);

    let failure = DeliveryFailure {
        error: "broker unavailable".into(),
        next_attempt_at: Some(at(12, 10)),
        quarantine: false,
    };
    store.record_failure(row.outbox_id, &failure, at(12, 1)).await.unwrap();

    assert!(store.claim_pending(&claim(10, at(12, 5))).await.unwrap().is_empty());
    let retried = store.claim_pending(&claim(10, at(12, 10))).await.unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].attempts, 1);
    assert_eq!(retried[0].last_error.as_deref(), Some("broker unavailable"));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_quarantined_row_is_listed_and_can_be_released(pool: PgPool) {
    let store = PgEventStore::new(pool);
    record(&store, &make_event("market:AAPL:bar0", at(12, 0))).await;
    let row = store.claim_pending(&claim(1, at(12, 1))).await.unwrap().remove(0);

    let failure = DeliveryFailure {
        error: "message too large".into(),
        next_attempt_at: None,
        quarantine: true,
    };
    store.record_failure(row.outbox_id, &failure, at(12, 1)).await.unwrap();

    assert!(store.claim_pending(&claim(10, at(12, 2))).await.unwrap().is_empty());
    let parked = store.list_quarantined(10).await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].quarantined_at, Some(at(12, 1)));

    let stats = store.backlog_stats(at(12, 2)).await.unwrap();
    assert_eq!((stats.pending, stats.quarantined), (0, 1));

    assert!(store.release_quarantined(row.outbox_id).await.unwrap());
    assert!(!store.release_quarantined(row.outbox_id).await.unwrap());
    let released = store.claim_pending(&claim(10, at(12, 2))).await.unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].attempts, 0);
}

// --- backlog_stats ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_backlog_stats_report_oldest_pending_age(pool: PgPool) {
    let store = PgEventStore::new(pool);
    record(&store, &make_event("market:AAPL:bar0", at(12, 0))).await;
    record(&store, &make_event("market:AAPL:bar1", at(12, 30))).await;

    let stats = store.backlog_stats(at(13, 0)).await.unwrap();

    assert_eq!(stats.pending, 2);
    assert_eq!(stats.oldest_pending_at, Some(at(12, 0)));
    assert_eq!(stats.oldest_pending_age_secs, Some(3600));
}

// --- events_between ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_events_between_filters_on_the_requested_axis(pool: PgPool) {
    let store = PgEventStore::new(pool);
    let early = make_event("market:AAPL:bar0", at(10, 0));
    let late = make_event("market:AAPL:bar1", at(14, 0));
    record(&store, &early).await;
    record(&store, &late).await;

    let ingested = store
        .events_between(ReplayWindow {
            axis: ReplayAxis::IngestedTime,
            start: at(9, 0),
            end: at(11, 0),
        })
        .await
        .unwrap();
    assert_eq!(ingested.len(), 1);
    assert_eq!(ingested[0].event_id, early.event_id);

    // ts_event is five minutes before ingestion.
    let by_event_time = store
        .events_between(ReplayWindow {
            axis: ReplayAxis::EventTime,
            start: at(13, 55),
            end: at(13, 55),
        })
        .await
        .unwrap();
    assert_eq!(by_event_time.len(), 1);
    assert_eq!(by_event_time[0].event_id, late.event_id);
}
