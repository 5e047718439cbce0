//! Consumer side of the event bus boundary.

use std::convert::Infallible;
use std::str::FromStr;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BusResult;

/// Receive attempts after which an unacknowledged message is dead-lettered.
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;

/// A delivery handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Broker-assigned message id; stable across redeliveries.
    pub message_id: String,
    /// Handle for acknowledging this particular delivery.
    pub receipt: String,
    /// `event_id` attribute.
    pub event_id: Option<Uuid>,
    /// `dedupe_key` attribute.
    pub dedupe_key: String,
    /// Serialized envelope.
    pub body: Vec<u8>,
    /// How many times the message has been delivered, this one included.
    pub receive_count: u32,
}

/// Where a queue sends messages that keep failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrivePolicy {
    /// Target dead-letter queue.
    pub dead_letter_queue: String,
    /// Deliveries without acknowledgement before a message is moved.
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    /// Policy with the default receive limit.
    #[must_use]
    pub fn new(dead_letter_queue: impl Into<String>) -> Self {
        Self {
            dead_letter_queue: dead_letter_queue.into(),
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
        }
    }

    /// Whether a message delivered `receive_count` times has exhausted its
    /// attempts.
    #[must_use]
    pub fn is_exhausted(&self, receive_count: u32) -> bool {
        receive_count >= self.max_receive_count
    }
}

/// Which source queues may use a queue as their dead-letter target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RedriveAllowPolicy {
    /// Any queue.
    #[default]
    AllowAll,
    /// No queue.
    DenyAll,
    /// Only the named queues.
    ByQueue(Vec<String>),
}

impl RedriveAllowPolicy {
    /// Whether `source_queue` may redrive into the owning queue.
    #[must_use]
    pub fn allows(&self, source_queue: &str) -> bool {
        match self {
            Self::AllowAll => true,
            Self::DenyAll => false,
            Self::ByQueue(queues) => queues.iter().any(|q| q == source_queue),
        }
    }
}

/// Parses `*` as [`AllowAll`](RedriveAllowPolicy::AllowAll), `none` or an
/// empty string as [`DenyAll`](RedriveAllowPolicy::DenyAll), and anything
/// else as a comma-separated list of queue names.
impl FromStr for RedriveAllowPolicy {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(Self::AllowAll);
        }
        if s.eq_ignore_ascii_case("none") {
            return Ok(Self::DenyAll);
        }
        let queues: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_owned)
            .collect();
        if queues.is_empty() {
            Ok(Self::DenyAll)
        } else {
            Ok(Self::ByQueue(queues))
        }
    }
}

/// A queue a consumer reads from.
///
/// Received messages stay invisible to other consumers for the visibility
/// timeout. An acknowledged message is deleted; an unacknowledged one becomes
/// visible again and its receive count grows until the redrive policy moves
/// it to the dead-letter queue.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Receives up to `max` visible messages.
    async fn receive(&self, max: usize) -> BusResult<Vec<ReceivedMessage>>;

    /// Deletes the delivered message.
    async fn ack(&self, receipt: &str) -> BusResult<()>;

    /// Gives the delivery up. The message is redelivered later or, once its
    /// attempts are exhausted, moved to the dead-letter queue.
    async fn nack(&self, receipt: &str) -> BusResult<()>;
}
