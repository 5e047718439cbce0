//! In-memory broker with queue semantics for tests and local runs.
//!
//! Models the parts of a managed queue the pipeline relies on: per-delivery
//! visibility timeouts, a receive counter, redrive to a dead-letter queue
//! after a bounded number of receives, and a dead-letter allow-list.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tip_core::bus::{EventBus, OutgoingMessage, PublishError};
use tip_core::clock::Clock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BusError, BusResult};
use crate::queue::{Queue, ReceivedMessage, RedriveAllowPolicy, RedrivePolicy};

#[derive(Debug)]
struct InFlight {
    receipt: String,
    visible_at: DateTime<Utc>,
}

#[derive(Debug)]
struct StoredMessage {
    message_id: String,
    event_id: Option<Uuid>,
    dedupe_key: String,
    body: Vec<u8>,
    receive_count: u32,
    in_flight: Option<InFlight>,
}

impl StoredMessage {
    fn view(&self, receipt: String) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.message_id.clone(),
            receipt,
            event_id: self.event_id,
            dedupe_key: self.dedupe_key.clone(),
            body: self.body.clone(),
            receive_count: self.receive_count,
        }
    }
}

#[derive(Debug)]
struct QueueState {
    redrive: Option<RedrivePolicy>,
    allow: RedriveAllowPolicy,
    messages: Vec<StoredMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_message_id: u64,
}

impl BrokerState {
    fn queue_mut(&mut self, name: &str) -> BusResult<&mut QueueState> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BusError::QueueNotFound(name.to_owned()))
    }

    /// Returns expired in-flight deliveries to the queue, dead-lettering
    /// those whose attempts are exhausted.
    fn sweep(&mut self, name: &str, now: DateTime<Utc>) -> BusResult<()> {
        let queue = self.queue_mut(name)?;
        let redrive = queue.redrive.clone();
        let mut dead = Vec::new();
        let mut kept = Vec::with_capacity(queue.messages.len());
        for mut message in queue.messages.drain(..) {
            if message
                .in_flight
                .as_ref()
                .is_some_and(|f| f.visible_at <= now)
            {
                message.in_flight = None;
                if redrive
                    .as_ref()
                    .is_some_and(|r| r.is_exhausted(message.receive_count))
                {
                    dead.push(message);
                    continue;
                }
            }
            kept.push(message);
        }
        queue.messages = kept;

        match redrive {
            Some(policy) if !dead.is_empty() => self.dead_letter(name, &policy, dead),
            _ => Ok(()),
        }
    }

    fn dead_letter(
        &mut self,
        source: &str,
        policy: &RedrivePolicy,
        messages: Vec<StoredMessage>,
    ) -> BusResult<()> {
        let dlq = self.queue_mut(&policy.dead_letter_queue)?;
        for mut message in messages {
            warn!(
                queue = %source,
                dead_letter_queue = %policy.dead_letter_queue,
                message_id = %message.message_id,
                dedupe_key = %message.dedupe_key,
                receive_count = message.receive_count,
                "message moved to dead-letter queue"
            );
            message.in_flight = None;
            dlq.messages.push(message);
        }
        Ok(())
    }
}

/// A set of named in-memory queues sharing one clock.
pub struct InMemoryBroker {
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
    state: Mutex<BrokerState>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("visibility_timeout", &self.visibility_timeout)
            .finish_non_exhaustive()
    }
}

impl InMemoryBroker {
    /// Creates a broker whose deliveries stay invisible for
    /// `visibility_timeout`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, visibility_timeout: Duration) -> Self {
        Self {
            clock,
            visibility_timeout,
            state: Mutex::new(BrokerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a queue.
    ///
    /// `allow` governs which queues may later name this one as their
    /// dead-letter target.
    ///
    /// # Errors
    ///
    /// Returns `BusError::QueueAlreadyExists` for a taken name,
    /// `BusError::QueueNotFound` if the redrive target does not exist, and
    /// `BusError::RedriveNotAllowed` if the target's allow-list excludes
    /// this queue.
    pub fn create_queue(
        &self,
        name: &str,
        redrive: Option<RedrivePolicy>,
        allow: RedriveAllowPolicy,
    ) -> BusResult<()> {
        let mut state = self.lock();
        if state.queues.contains_key(name) {
            return Err(BusError::QueueAlreadyExists(name.to_owned()));
        }
        if let Some(policy) = &redrive {
            let dlq = state
                .queues
                .get(&policy.dead_letter_queue)
                .ok_or_else(|| BusError::QueueNotFound(policy.dead_letter_queue.clone()))?;
            if !dlq.allow.allows(name) {
                return Err(BusError::RedriveNotAllowed {
                    source_queue: name.to_owned(),
                    dead_letter_queue: policy.dead_letter_queue.clone(),
                });
            }
        }
        state.queues.insert(
            name.to_owned(),
            QueueState {
                redrive,
                allow,
                messages: Vec::new(),
            },
        );
        debug!(queue = %name, "queue created");
        Ok(())
    }

    /// A handle bound to one queue, usable as both publisher and consumer
    /// source.
    ///
    /// # Errors
    ///
    /// Returns `BusError::QueueNotFound` if the queue does not exist.
    pub fn handle(self: &Arc<Self>, name: &str) -> BusResult<QueueHandle> {
        if !self.lock().queues.contains_key(name) {
            return Err(BusError::QueueNotFound(name.to_owned()));
        }
        Ok(QueueHandle {
            broker: Arc::clone(self),
            name: name.to_owned(),
        })
    }

    /// Appends a message to `queue` and returns its id.
    ///
    /// # Errors
    ///
    /// Returns `BusError::QueueNotFound` if the queue does not exist.
    pub fn send(&self, queue: &str, message: &OutgoingMessage) -> BusResult<String> {
        let mut state = self.lock();
        state.next_message_id += 1;
        let message_id = format!("m-{}", state.next_message_id);
        state.queue_mut(queue)?.messages.push(StoredMessage {
            message_id: message_id.clone(),
            event_id: Some(message.event_id),
            dedupe_key: message.dedupe_key.clone(),
            body: message.body.clone(),
            receive_count: 0,
            in_flight: None,
        });
        Ok(message_id)
    }

    /// Delivers up to `max` visible messages from `queue`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `BusError::QueueNotFound` if the queue (or its dead-letter
    /// target) does not exist.
    pub fn receive(&self, queue: &str, max: usize) -> BusResult<Vec<ReceivedMessage>> {
        let now = self.clock.now();
        let visible_at = now + self.visibility_timeout;
        let mut state = self.lock();
        state.sweep(queue, now)?;

        let delivered = state
            .queue_mut(queue)?
            .messages
            .iter_mut()
            .filter(|m| m.in_flight.is_none())
            .take(max)
            .map(|m| {
                m.receive_count += 1;
                let receipt = format!("{}#{}", m.message_id, m.receive_count);
                m.in_flight = Some(InFlight {
                    receipt: receipt.clone(),
                    visible_at,
                });
                m.view(receipt)
            })
            .collect();
        Ok(delivered)
    }

    /// Deletes the message delivered under `receipt`.
    ///
    /// # Errors
    ///
    /// Returns `BusError::UnknownReceipt` if no in-flight delivery matches.
    pub fn ack(&self, queue: &str, receipt: &str) -> BusResult<()> {
        let mut state = self.lock();
        let messages = &mut state.queue_mut(queue)?.messages;
        let index = find_receipt(messages, receipt)?;
        messages.remove(index);
        Ok(())
    }

    /// Abandons the delivery under `receipt`. The message becomes visible
    /// again immediately, or moves to the dead-letter queue if its receive
    /// count has reached the redrive limit.
    ///
    /// # Errors
    ///
    /// Returns `BusError::UnknownReceipt` if no in-flight delivery matches.
    pub fn nack(&self, queue: &str, receipt: &str) -> BusResult<()> {
        let mut state = self.lock();
        let source = state.queue_mut(queue)?;
        let index = find_receipt(&source.messages, receipt)?;
        let exhausted = source
            .redrive
            .as_ref()
            .filter(|r| r.is_exhausted(source.messages[index].receive_count))
            .cloned();

        match exhausted {
            Some(policy) => {
                let message = source.messages.remove(index);
                state.dead_letter(queue, &policy, vec![message])
            }
            None => {
                source.messages[index].in_flight = None;
                Ok(())
            }
        }
    }

    /// Number of messages held by `queue`, in flight or not.
    ///
    /// # Errors
    ///
    /// Returns `BusError::QueueNotFound` if the queue does not exist.
    pub fn depth(&self, queue: &str) -> BusResult<usize> {
        Ok(self.lock().queue_mut(queue)?.messages.len())
    }

    /// Snapshot of the messages held by `queue`, without delivering them.
    /// Receipts are empty.
    ///
    /// # Errors
    ///
    /// Returns `BusError::QueueNotFound` if the queue does not exist.
    pub fn peek(&self, queue: &str) -> BusResult<Vec<ReceivedMessage>> {
        Ok(self
            .lock()
            .queue_mut(queue)?
            .messages
            .iter()
            .map(|m| m.view(String::new()))
            .collect())
    }
}

fn find_receipt(messages: &[StoredMessage], receipt: &str) -> BusResult<usize> {
    messages
        .iter()
        .position(|m| m.in_flight.as_ref().is_some_and(|f| f.receipt == receipt))
        .ok_or_else(|| BusError::UnknownReceipt(receipt.to_owned()))
}

/// One queue of an [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct QueueHandle {
    broker: Arc<InMemoryBroker>,
    name: String,
}

impl QueueHandle {
    /// The queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl EventBus for QueueHandle {
    async fn send(&self, message: OutgoingMessage) -> Result<String, PublishError> {
        self.broker
            .send(&self.name, &message)
            .map_err(|e| PublishError::Permanent(e.to_string()))
    }
}

#[async_trait]
impl Queue for QueueHandle {
    async fn receive(&self, max: usize) -> BusResult<Vec<ReceivedMessage>> {
        self.broker.receive(&self.name, max)
    }

    async fn ack(&self, receipt: &str) -> BusResult<()> {
        self.broker.ack(&self.name, receipt)
    }

    async fn nack(&self, receipt: &str) -> BusResult<()> {
        self.broker.nack(&self.name, receipt)
    }
}
