//! Redis Streams transport.
//!
//! Publishing is `XADD`. Consumption uses a consumer group: `XREADGROUP` for
//! new entries, `XPENDING` + `XCLAIM` to take over entries whose visibility
//! timeout (idle time) has expired, and `XACK` to acknowledge. `XACK` only
//! removes an entry from the group's pending list; the entry itself stays
//! in the stream until it is trimmed (`XTRIM` / `MAXLEN`), which this
//! module does not do.
//!
//! The delivery counter Redis keeps per pending entry is the receive count;
//! once it reaches the redrive limit the entry is copied to the dead-letter
//! stream, tagged with `source_stream` and `receive_count`, and
//! acknowledged on the source.
//!
//! Receipts are bare entry ids, not per-delivery handles. A consumer whose
//! delivery expired and was reclaimed elsewhere can still ack or nack the
//! entry while the new holder is processing it; consumers must tolerate
//! the resulting duplicate or lost work.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisResult};
use tip_core::bus::{EventBus, OutgoingMessage, PublishError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BusError, BusResult};
use crate::queue::{Queue, ReceivedMessage, RedriveAllowPolicy, RedrivePolicy};

const FIELD_EVENT_ID: &str = "event_id";
const FIELD_DEDUPE_KEY: &str = "dedupe_key";
const FIELD_BODY: &str = "body";
const FIELD_SOURCE_STREAM: &str = "source_stream";
const FIELD_RECEIVE_COUNT: &str = "receive_count";

/// Connection and consumer-group settings for one stream.
#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Stream the pipeline publishes to.
    pub stream: String,
    /// Consumer group reading the stream.
    pub group: String,
    /// This consumer's name within the group.
    pub consumer: String,
    /// How long a delivery stays claimed before another receive may take it.
    pub visibility_timeout: Duration,
    /// How long `XREADGROUP` blocks waiting for new entries.
    pub block: Duration,
    /// Where exhausted entries go.
    pub redrive: RedrivePolicy,
}

impl RedisStreamConfig {
    /// Settings for `stream` with a `<stream>-dlq` dead-letter stream and the
    /// default receive limit.
    #[must_use]
    pub fn new(redis_url: impl Into<String>, stream: impl Into<String>) -> Self {
        let stream = stream.into();
        Self {
            redis_url: redis_url.into(),
            redrive: RedrivePolicy::new(format!("{stream}-dlq")),
            group: "tip-consumers".to_owned(),
            consumer: format!("consumer-{}", Uuid::new_v4().simple()),
            stream,
            visibility_timeout: Duration::from_secs(30),
            block: Duration::from_secs(1),
        }
    }
}

/// A stream entry: id plus field map.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, Vec<u8>>,
}

/// One row of the extended `XPENDING` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEntry {
    id: String,
    idle_ms: i64,
    delivery_count: u32,
}

/// Expired deliveries split by the redrive policy.
#[derive(Debug, Default, PartialEq, Eq)]
struct ReclaimPlan {
    dead_letter: Vec<PendingEntry>,
    claim: Vec<PendingEntry>,
}

/// Redis Streams publisher and consumer.
pub struct RedisStreamBus {
    conn: MultiplexedConnection,
    config: RedisStreamConfig,
}

impl std::fmt::Debug for RedisStreamBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamBus")
            .field("stream", &self.config.stream)
            .field("group", &self.config.group)
            .finish_non_exhaustive()
    }
}

impl RedisStreamBus {
    /// Connects and ensures the consumer group exists.
    ///
    /// `dead_letter_allow` is the allow-list of the dead-letter stream; it
    /// must admit this stream.
    ///
    /// # Errors
    ///
    /// Returns `BusError::RedriveNotAllowed` if the allow-list excludes the
    /// stream, or `BusError::Redis` if Redis is unreachable.
    pub async fn connect(
        config: RedisStreamConfig,
        dead_letter_allow: &RedriveAllowPolicy,
    ) -> BusResult<Self> {
        if !dead_letter_allow.allows(&config.stream) {
            return Err(BusError::RedriveNotAllowed {
                source_queue: config.stream.clone(),
                dead_letter_queue: config.redrive.dead_letter_queue.clone(),
            });
        }
        let client = Client::open(config.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        let bus = Self { conn, config };
        bus.ensure_consumer_group().await?;
        Ok(bus)
    }

    async fn ensure_consumer_group(&self) -> BusResult<()> {
        // Start at 0 so entries published before the group existed are read.
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn.clone())
            .await;

        match result {
            Ok(()) => {
                info!(stream = %self.config.stream, group = %self.config.group, "created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %self.config.stream, group = %self.config.group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn visibility_ms(&self) -> u64 {
        u64::try_from(self.config.visibility_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Takes over entries whose deliveries have been idle past the
    /// visibility timeout, dead-lettering exhausted ones.
    async fn reclaim_expired(&self, max: usize) -> BusResult<Vec<ReceivedMessage>> {
        let idle_ms = self.visibility_ms();
        let reply: redis::Value = redis::cmd("XPENDING")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(max)
            .query_async(&mut self.conn.clone())
            .await?;

        let plan = plan_reclaim(parse_pending(&reply)?, &self.config.redrive);
        for pending in &plan.dead_letter {
            self.dead_letter(&pending.id, pending.delivery_count).await?;
        }
        if plan.claim.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.config.stream)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(idle_ms);
        for pending in &plan.claim {
            debug!(message_id = %pending.id, idle_ms = pending.idle_ms, "reclaiming expired delivery");
            cmd.arg(&pending.id);
        }
        let reply: redis::Value = cmd.query_async(&mut self.conn.clone()).await?;
        claimed_messages(parse_entries(&reply)?, &plan.claim)
    }

    async fn read_new(&self, max: usize) -> BusResult<Vec<ReceivedMessage>> {
        let block_ms = u64::try_from(self.config.block.as_millis()).unwrap_or(u64::MAX);
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(max)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.config.stream)
            .arg(">")
            .query_async(&mut self.conn.clone())
            .await?;

        parse_xreadgroup(&reply)?
            .into_iter()
            .map(|entry| to_received(entry, 1))
            .collect()
    }

    async fn delivery_count(&self, id: &str) -> BusResult<Option<u32>> {
        let reply: redis::Value = redis::cmd("XPENDING")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg(id)
            .arg(id)
            .arg(1)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(parse_pending(&reply)?.first().map(|p| p.delivery_count))
    }

    async fn dead_letter(&self, id: &str, receive_count: u32) -> BusResult<()> {
        let reply: redis::Value = redis::cmd("XRANGE")
            .arg(&self.config.stream)
            .arg(id)
            .arg(id)
            .query_async(&mut self.conn.clone())
            .await?;

        let dlq = &self.config.redrive.dead_letter_queue;
        if let Some(entry) = parse_entries(&reply)?.into_iter().next() {
            let mut cmd = redis::cmd("XADD");
            cmd.arg(dlq).arg("*");
            for (field, value) in dead_letter_fields(&entry, &self.config.stream, receive_count) {
                cmd.arg(field).arg(value.as_slice());
            }
            let _: String = cmd.query_async(&mut self.conn.clone()).await?;
        }

        let _: i64 = self
            .conn
            .clone()
            .xack(&self.config.stream, &self.config.group, &[id])
            .await?;
        warn!(
            stream = %self.config.stream,
            dead_letter_stream = %dlq,
            message_id = %id,
            receive_count,
            "message moved to dead-letter stream"
        );
        Ok(())
    }
}

#[async_trait]
impl EventBus for RedisStreamBus {
    async fn send(&self, message: OutgoingMessage) -> Result<String, PublishError> {
        let result: RedisResult<String> = redis::cmd("XADD")
            .arg(&self.config.stream)
            .arg("*")
            .arg(FIELD_EVENT_ID)
            .arg(message.event_id.to_string())
            .arg(FIELD_DEDUPE_KEY)
            .arg(&message.dedupe_key)
            .arg(FIELD_BODY)
            .arg(message.body.as_slice())
            .query_async(&mut self.conn.clone())
            .await;
        result.map_err(classify_publish_error)
    }
}

#[async_trait]
impl Queue for RedisStreamBus {
    async fn receive(&self, max: usize) -> BusResult<Vec<ReceivedMessage>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut messages = self.reclaim_expired(max).await?;
        if messages.len() < max {
            messages.extend(self.read_new(max - messages.len()).await?);
        }
        Ok(messages)
    }

    /// Acknowledges the entry named by `receipt` for the whole group.
    async fn ack(&self, receipt: &str) -> BusResult<()> {
        let acked: i64 = self
            .conn
            .clone()
            .xack(&self.config.stream, &self.config.group, &[receipt])
            .await?;
        if acked == 1 {
            debug!(message_id = %receipt, stream = %self.config.stream, "acknowledged message");
            Ok(())
        } else {
            Err(BusError::UnknownReceipt(receipt.to_owned()))
        }
    }

    async fn nack(&self, receipt: &str) -> BusResult<()> {
        let count = self
            .delivery_count(receipt)
            .await?
            .ok_or_else(|| BusError::UnknownReceipt(receipt.to_owned()))?;
        if self.config.redrive.is_exhausted(count) {
            self.dead_letter(receipt, count).await
        } else {
            // Left pending; reclaimed once idle past the visibility timeout.
            debug!(message_id = %receipt, receive_count = count, "delivery abandoned");
            Ok(())
        }
    }
}

fn classify_publish_error(err: redis::RedisError) -> PublishError {
    match err.kind() {
        redis::ErrorKind::ResponseError | redis::ErrorKind::TypeError => {
            PublishError::Permanent(err.to_string())
        }
        _ => PublishError::Transient(err.to_string()),
    }
}

fn as_text(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn as_bytes(value: &redis::Value) -> Option<Vec<u8>> {
    match value {
        redis::Value::BulkString(bytes) => Some(bytes.clone()),
        redis::Value::SimpleString(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

fn as_array<'a>(value: &'a redis::Value, what: &str) -> BusResult<&'a [redis::Value]> {
    match value {
        redis::Value::Array(items) => Ok(items),
        other => Err(BusError::Protocol(format!(
            "expected array for {what}, got {other:?}"
        ))),
    }
}

/// Parses `[[id, [field, value, ...]], ...]`, as returned by `XRANGE` and
/// `XCLAIM`. Entries deleted from the stream come back as nil and are
/// skipped.
fn parse_entries(value: &redis::Value) -> BusResult<Vec<StreamEntry>> {
    if matches!(value, redis::Value::Nil) {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for item in as_array(value, "entries")? {
        if matches!(item, redis::Value::Nil) {
            continue;
        }
        let parts = as_array(item, "entry")?;
        let [id, fields] = parts else {
            return Err(BusError::Protocol(format!(
                "stream entry has {} parts, expected 2",
                parts.len()
            )));
        };
        let id = as_text(id)
            .ok_or_else(|| BusError::Protocol(format!("expected string entry id, got {id:?}")))?;
        if matches!(fields, redis::Value::Nil) {
            continue;
        }
        let fields = as_array(fields, "fields")?
            .chunks_exact(2)
            .filter_map(|pair| Some((as_text(&pair[0])?, as_bytes(&pair[1])?)))
            .collect();
        entries.push(StreamEntry { id, fields });
    }
    Ok(entries)
}

/// Parses `[[stream, [entries...]], ...]` from `XREADGROUP`; nil means the
/// block timed out.
fn parse_xreadgroup(value: &redis::Value) -> BusResult<Vec<StreamEntry>> {
    if matches!(value, redis::Value::Nil) {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for stream in as_array(value, "streams")? {
        match as_array(stream, "stream")? {
            [_key, stream_entries] => entries.extend(parse_entries(stream_entries)?),
            other => {
                return Err(BusError::Protocol(format!(
                    "stream reply has {} parts, expected 2",
                    other.len()
                )));
            }
        }
    }
    Ok(entries)
}

/// Parses the extended `XPENDING` reply `[[id, consumer, idle, count], ...]`.
fn parse_pending(value: &redis::Value) -> BusResult<Vec<PendingEntry>> {
    let mut pending = Vec::new();
    for row in as_array(value, "pending entries")? {
        let row = as_array(row, "pending entry")?;
        let [id, _consumer, redis::Value::Int(idle_ms), redis::Value::Int(count)] = row else {
            return Err(BusError::Protocol(format!(
                "unexpected pending entry shape: {row:?}"
            )));
        };
        let id = as_text(id)
            .ok_or_else(|| BusError::Protocol(format!("expected string pending id, got {id:?}")))?;
        pending.push(PendingEntry {
            id,
            idle_ms: *idle_ms,
            delivery_count: u32::try_from(*count).unwrap_or(u32::MAX),
        });
    }
    Ok(pending)
}

/// Dead-letters deliveries that have used up their receive attempts and
/// claims the rest.
fn plan_reclaim(pending: Vec<PendingEntry>, redrive: &RedrivePolicy) -> ReclaimPlan {
    let (dead_letter, claim) = pending
        .into_iter()
        .partition(|p| redrive.is_exhausted(p.delivery_count));
    ReclaimPlan { dead_letter, claim }
}

/// Converts entries returned by `XCLAIM`. Claiming counts as a delivery, so
/// each receive count is one more than `XPENDING` reported.
fn claimed_messages(
    entries: Vec<StreamEntry>,
    claimed: &[PendingEntry],
) -> BusResult<Vec<ReceivedMessage>> {
    let counts: HashMap<&str, u32> = claimed
        .iter()
        .map(|p| (p.id.as_str(), p.delivery_count))
        .collect();
    entries
        .into_iter()
        .map(|entry| {
            let count = counts.get(entry.id.as_str()).copied().unwrap_or(0) + 1;
            to_received(entry, count)
        })
        .collect()
}

/// Field/value pairs for the dead-letter copy of `entry`: the original
/// fields in name order, then the source stream and receive count.
fn dead_letter_fields(
    entry: &StreamEntry,
    source_stream: &str,
    receive_count: u32,
) -> Vec<(String, Vec<u8>)> {
    let mut fields: Vec<(String, Vec<u8>)> = entry
        .fields
        .iter()
        .filter(|(name, _)| *name != FIELD_SOURCE_STREAM && *name != FIELD_RECEIVE_COUNT)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    fields.push((FIELD_SOURCE_STREAM.to_owned(), source_stream.as_bytes().to_vec()));
    fields.push((
        FIELD_RECEIVE_COUNT.to_owned(),
        receive_count.to_string().into_bytes(),
    ));
    fields
}

fn to_received(entry: StreamEntry, receive_count: u32) -> BusResult<ReceivedMessage> {
    let StreamEntry { id, mut fields } = entry;
    let body = fields
        .remove(FIELD_BODY)
        .ok_or_else(|| BusError::Protocol(format!("entry {id} missing {FIELD_BODY} field")))?;
    let dedupe_key = fields
        .remove(FIELD_DEDUPE_KEY)
        .map(|v| String::from_utf8_lossy(&v).into_owned())
        .unwrap_or_default();
    let event_id = fields
        .get(FIELD_EVENT_ID)
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|s| Uuid::parse_str(s).ok());
    Ok(ReceivedMessage {
        receipt: id.clone(),
        message_id: id,
        event_id,
        dedupe_key,
        body,
        receive_count,
    })
}
