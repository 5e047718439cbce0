//! `PostgreSQL` implementation of the `EventStore` and `OutboxRepository`
//! traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use tip_core::error::DomainError;
use tip_core::event::Event;
use tip_core::outbox::{BacklogStats, ClaimRequest, DeliveryFailure, OutboxEntry};
use tip_core::store::{EventStore, OutboxRepository, ReplayAxis, ReplayWindow};

const EVENT_COLUMNS: &str = "event_id, schema_version, event_type, source, symbol, entity_id, \
     ts_event, ts_ingested, dedupe_key, severity, confidence, payload_json, \
     raw_s3_uri, normalized_s3_uri, hash";

const OUTBOX_COLUMNS: &str = "o.outbox_id, o.event_id, e.dedupe_key, o.payload, o.created_at, \
     o.published_at, o.attempts, o.last_error, o.next_attempt_at, o.quarantined_at";

const PENDING_PREDICATE: &str = "o.published_at IS NULL \
     AND o.quarantined_at IS NULL \
     AND (o.next_attempt_at IS NULL OR o.next_attempt_at <= $1) \
     AND (o.claimed_until IS NULL OR o.claimed_until <= $1)";

/// PostgreSQL-backed event store and outbox.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Creates a new `PgEventStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn outbox_row_exists(&self, outbox_id: i64) -> Result<bool, DomainError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM outbox WHERE outbox_id = $1)")
            .bind(outbox_id)
            .fetch_one(&self.pool)
            .await
            .map_err(infrastructure)
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: Uuid,
    schema_version: String,
    event_type: String,
    source: String,
    symbol: Option<String>,
    entity_id: Option<String>,
    ts_event: DateTime<Utc>,
    ts_ingested: DateTime<Utc>,
    dedupe_key: String,
    severity: i32,
    confidence: Option<f64>,
    payload_json: serde_json::Value,
    raw_s3_uri: Option<String>,
    normalized_s3_uri: Option<String>,
    hash: Option<String>,
}

impl TryFrom<EventRow> for Event {
    type Error = DomainError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let event_id = row.event_id;
        let corrupt =
            |e: DomainError| DomainError::Infrastructure(format!("corrupt event row {event_id}: {e}"));
        Ok(Self {
            event_id,
            schema_version: row.schema_version,
            event_type: row.event_type.parse().map_err(corrupt)?,
            source: row.source.parse().map_err(corrupt)?,
            symbol: row.symbol,
            entity_id: row.entity_id,
            ts_event: row.ts_event,
            ts_ingested: row.ts_ingested,
            dedupe_key: row.dedupe_key,
            severity: row.severity,
            confidence: row.confidence,
            payload_json: row.payload_json,
            raw_s3_uri: row.raw_s3_uri,
            normalized_s3_uri: row.normalized_s3_uri,
            hash: row.hash,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    outbox_id: i64,
    event_id: Uuid,
    dedupe_key: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    attempts: i32,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    quarantined_at: Option<DateTime<Utc>>,
}

impl From<OutboxRow> for OutboxEntry {
    fn from(row: OutboxRow) -> Self {
        Self {
            outbox_id: row.outbox_id,
            event_id: row.event_id,
            dedupe_key: row.dedupe_key,
            payload: row.payload,
            created_at: row.created_at,
            published_at: row.published_at,
            attempts: row.attempts,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            quarantined_at: row.quarantined_at,
        }
    }
}

fn infrastructure(err: sqlx::Error) -> DomainError {
    DomainError::Infrastructure(err.to_string())
}

fn transaction_failure(err: sqlx::Error) -> DomainError {
    if let sqlx::Error::Database(db) = &err {
        if db.constraint() == Some("events_pkey") {
            return DomainError::Validation("event_id is already assigned".into());
        }
    }
    DomainError::TransactionFailure(err.to_string())
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl EventStore for PgEventStore {
    #[instrument(skip(self, event, outbox_payload), fields(event_id = %event.event_id, dedupe_key = %event.dedupe_key))]
    async fn record_event(
        &self,
        event: &Event,
        outbox_payload: &serde_json::Value,
    ) -> Result<Uuid, DomainError> {
        let mut tx = self.pool.begin().await.map_err(transaction_failure)?;

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r"
            INSERT INTO events (
                event_id, schema_version, event_type, source, symbol, entity_id,
                ts_event, ts_ingested, dedupe_key, severity, confidence, payload_json,
                raw_s3_uri, normalized_s3_uri, hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (dedupe_key) DO NOTHING
            RETURNING event_id
            ",
        )
        .bind(event.event_id)
        .bind(&event.schema_version)
        .bind(event.event_type.as_str())
        .bind(event.source.as_str())
        .bind(&event.symbol)
        .bind(&event.entity_id)
        .bind(event.ts_event)
        .bind(event.ts_ingested)
        .bind(&event.dedupe_key)
        .bind(event.severity)
        .bind(event.confidence)
        .bind(&event.payload_json)
        .bind(&event.raw_s3_uri)
        .bind(&event.normalized_s3_uri)
        .bind(&event.hash)
        .fetch_optional(&mut *tx)
        .await
        .map_err(transaction_failure)?;

        let Some(event_id) = inserted else {
            tx.rollback().await.map_err(transaction_failure)?;
            let existing_event_id = self
                .find_by_dedupe_key(&event.dedupe_key)
                .await?
                .map(|existing| existing.event_id);
            debug!(?existing_event_id, "dedupe key already recorded");
            return Err(DomainError::DuplicateEvent {
                dedupe_key: event.dedupe_key.clone(),
                existing_event_id,
            });
        };

        sqlx::query("INSERT INTO outbox (event_id, payload, created_at) VALUES ($1, $2, $3)")
            .bind(event_id)
            .bind(outbox_payload)
            .bind(event.ts_ingested)
            .execute(&mut *tx)
            .await
            .map_err(transaction_failure)?;

        tx.commit().await.map_err(transaction_failure)?;

        Ok(event_id)
    }

    async fn find_event(&self, event_id: Uuid) -> Result<Option<Event>, DomainError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = $1");
        sqlx::query_as::<_, EventRow>(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(infrastructure)?
            .map(Event::try_from)
            .transpose()
    }

    async fn find_by_dedupe_key(&self, dedupe_key: &str) -> Result<Option<Event>, DomainError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE dedupe_key = $1");
        sqlx::query_as::<_, EventRow>(&sql)
            .bind(dedupe_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(infrastructure)?
            .map(Event::try_from)
            .transpose()
    }

    async fn events_between(&self, window: ReplayWindow) -> Result<Vec<Event>, DomainError> {
        let column = match window.axis {
            ReplayAxis::EventTime => "ts_event",
            ReplayAxis::IngestedTime => "ts_ingested",
        };
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE {column} BETWEEN $1 AND $2 \
             ORDER BY {column}, event_id"
        );
        sqlx::query_as::<_, EventRow>(&sql)
            .bind(window.start)
            .bind(window.end)
            .fetch_all(&self.pool)
            .await
            .map_err(infrastructure)?
            .into_iter()
            .map(Event::try_from)
            .collect()
    }
}

#[async_trait]
impl OutboxRepository for PgEventStore {
    #[instrument(skip(self, request), fields(limit = request.limit, claimant = %request.claimant))]
    async fn claim_pending(
        &self,
        request: &ClaimRequest,
    ) -> Result<Vec<OutboxEntry>, DomainError> {
        let rows = if let Some(lease_until) = request.lease_until {
            // Atomic claim-and-stamp; concurrent dispatchers skip locked rows.
            let sql = format!(
                "WITH claimable AS ( \
                     SELECT o.outbox_id FROM outbox o \
                     WHERE {PENDING_PREDICATE} \
                     ORDER BY o.outbox_id \
                     LIMIT $2 \
                     FOR UPDATE SKIP LOCKED \
                 ) \
                 UPDATE outbox o \
                 SET claimed_by = $3, claimed_until = $4 \
                 FROM claimable c, events e \
                 WHERE o.outbox_id = c.outbox_id AND e.event_id = o.event_id \
                 RETURNING {OUTBOX_COLUMNS}"
            );
            let mut rows = sqlx::query_as::<_, OutboxRow>(&sql)
                .bind(request.now)
                .bind(limit_param(request.limit))
                .bind(&request.claimant)
                .bind(lease_until)
                .fetch_all(&self.pool)
                .await
                .map_err(infrastructure)?;
            rows.sort_by_key(|row| row.outbox_id);
            rows
        } else {
            let sql = format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox o \
                 JOIN events e ON e.event_id = o.event_id \
                 WHERE {PENDING_PREDICATE} \
                 ORDER BY o.outbox_id \
                 LIMIT $2"
            );
            sqlx::query_as::<_, OutboxRow>(&sql)
                .bind(request.now)
                .bind(limit_param(request.limit))
                .fetch_all(&self.pool)
                .await
                .map_err(infrastructure)?
        };

        Ok(rows.into_iter().map(OutboxEntry::from).collect())
    }

    async fn mark_published(
        &self,
        outbox_id: i64,
        published_at: DateTime<Utc>,
    ) -> Result<bool, DomainError> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET published_at = $2, claimed_by = NULL, claimed_until = NULL
            WHERE outbox_id = $1 AND published_at IS NULL
            ",
        )
        .bind(outbox_id)
        .bind(published_at)
        .execute(&self.pool)
        .await
        .map_err(infrastructure)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.outbox_row_exists(outbox_id).await? {
            debug!(outbox_id, "outbox row was already published");
            Ok(false)
        } else {
            Err(DomainError::OutboxEntryNotFound(outbox_id))
        }
    }

    async fn record_failure(
        &self,
        outbox_id: i64,
        failure: &DeliveryFailure,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET attempts = attempts + 1,
                last_error = $2,
                next_attempt_at = $3,
                quarantined_at = CASE WHEN $4 THEN $5 ELSE quarantined_at END,
                claimed_by = NULL,
                claimed_until = NULL
            WHERE outbox_id = $1 AND published_at IS NULL
            ",
        )
        .bind(outbox_id)
        .bind(&failure.error)
        .bind(failure.next_attempt_at)
        .bind(failure.quarantine)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(infrastructure)?;

        if result.rows_affected() == 0 {
            if !self.outbox_row_exists(outbox_id).await? {
                return Err(DomainError::OutboxEntryNotFound(outbox_id));
            }
            // Another dispatcher published it in the meantime.
            warn!(outbox_id, "failure recorded against an already published row; ignored");
        }
        Ok(())
    }

    async fn backlog_stats(&self, now: DateTime<Utc>) -> Result<BacklogStats, DomainError> {
        let (pending, quarantined, oldest_pending_at) =
            sqlx::query_as::<_, (i64, i64, Option<DateTime<Utc>>)>(
                r"
                SELECT
                    COUNT(*) FILTER (WHERE quarantined_at IS NULL),
                    COUNT(*) FILTER (WHERE quarantined_at IS NOT NULL),
                    MIN(created_at) FILTER (WHERE quarantined_at IS NULL)
                FROM outbox
                WHERE published_at IS NULL
                ",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(infrastructure)?;

        Ok(BacklogStats::new(pending, quarantined, oldest_pending_at, now))
    }

    async fn list_quarantined(&self, limit: usize) -> Result<Vec<OutboxEntry>, DomainError> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox o \
             JOIN events e ON e.event_id = o.event_id \
             WHERE o.published_at IS NULL AND o.quarantined_at IS NOT NULL \
             ORDER BY o.quarantined_at, o.outbox_id \
             LIMIT $1"
        );
        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(infrastructure)?;
        Ok(rows.into_iter().map(OutboxEntry::from).collect())
    }

    async fn release_quarantined(&self, outbox_id: i64) -> Result<bool, DomainError> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET quarantined_at = NULL, next_attempt_at = NULL, attempts = 0, last_error = NULL
            WHERE outbox_id = $1 AND quarantined_at IS NOT NULL AND published_at IS NULL
            ",
        )
        .bind(outbox_id)
        .execute(&self.pool)
        .await
        .map_err(infrastructure)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.outbox_row_exists(outbox_id).await? {
            Ok(false)
        } else {
            Err(DomainError::OutboxEntryNotFound(outbox_id))
        }
    }
}
