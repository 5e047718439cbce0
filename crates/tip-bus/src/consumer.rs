//! Idempotent consumer runner.
//!
//! Receives a batch, decodes each envelope, skips dedupe keys that were
//! already processed, runs the handler, records the key and only then
//! acknowledges. Anything that fails is nacked and left to the queue's
//! redelivery and dead-letter policy.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tip_core::consumer::{DeliveredEvent, EventHandler, ProcessedKeys};
use tip_core::error::DomainError;
use tip_core::outbox::BusMessage;
use tip_core::payload::TypedPayload;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::BusResult;
use crate::queue::{Queue, ReceivedMessage};

/// Counters for one batch or a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries received.
    pub received: u64,
    /// Deliveries whose handler ran and succeeded.
    pub processed: u64,
    /// Deliveries skipped because their dedupe key was already processed.
    pub duplicates: u64,
    /// Deliveries nacked.
    pub failed: u64,
}

impl ConsumerStats {
    fn merge(&mut self, other: Self) {
        self.received += other.received;
        self.processed += other.processed;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
    }
}

enum Outcome {
    Processed,
    Duplicate,
    Failed,
}

/// Process-local processed-key set. Suitable for tests and single-process
/// consumers whose side effects are themselves in memory.
#[derive(Debug, Default)]
pub struct InMemoryProcessedKeys {
    keys: Mutex<HashSet<String>>,
}

impl InMemoryProcessedKeys {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessedKeys for InMemoryProcessedKeys {
    async fn contains(&self, dedupe_key: &str) -> Result<bool, DomainError> {
        let keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(keys.contains(dedupe_key))
    }

    async fn insert(&self, dedupe_key: &str) -> Result<(), DomainError> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.insert(dedupe_key.to_owned());
        Ok(())
    }
}

/// Drives an [`EventHandler`] from a [`Queue`].
pub struct Consumer {
    queue: Arc<dyn Queue>,
    handler: Arc<dyn EventHandler>,
    processed: Arc<dyn ProcessedKeys>,
    batch_size: usize,
    idle_wait: Duration,
    error_backoff: Duration,
}

impl Consumer {
    /// Creates a consumer receiving up to 10 messages per batch.
    #[must_use]
    pub fn new(
        queue: Arc<dyn Queue>,
        handler: Arc<dyn EventHandler>,
        processed: Arc<dyn ProcessedKeys>,
    ) -> Self {
        Self {
            queue,
            handler,
            processed,
            batch_size: 10,
            idle_wait: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }

    /// Sets the maximum batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets how long to wait after an empty batch and after a receive error.
    #[must_use]
    pub fn with_waits(mut self, idle_wait: Duration, error_backoff: Duration) -> Self {
        self.idle_wait = idle_wait;
        self.error_backoff = error_backoff;
        self
    }

    /// Receives and handles one batch.
    ///
    /// # Errors
    ///
    /// Returns the queue's error if receiving fails. Per-message failures
    /// are nacked and counted, not returned.
    pub async fn process_batch(&self) -> BusResult<ConsumerStats> {
        let messages = self.queue.receive(self.batch_size).await?;
        let mut stats = ConsumerStats {
            received: messages.len() as u64,
            ..ConsumerStats::default()
        };
        for message in &messages {
            match self.process_one(message).await {
                Outcome::Processed => stats.processed += 1,
                Outcome::Duplicate => stats.duplicates += 1,
                Outcome::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn process_one(&self, received: &ReceivedMessage) -> Outcome {
        let message: BusMessage = match serde_json::from_slice(&received.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(message_id = %received.message_id, error = %e, "undecodable message");
                return self.give_up(received).await;
            }
        };
        let dedupe_key = message.dedupe_key.clone();

        match self.processed.contains(&dedupe_key).await {
            Ok(true) => {
                debug!(%dedupe_key, receive_count = received.receive_count, "already processed; acknowledging");
                self.acknowledge(received).await;
                return Outcome::Duplicate;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(%dedupe_key, error = %e, "processed-key lookup failed");
                return self.give_up(received).await;
            }
        }

        let payload = match TypedPayload::decode(
            &message.schema_version,
            message.event_type,
            &message.payload_json,
        ) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%dedupe_key, error = %e, "payload does not match its schema");
                return self.give_up(received).await;
            }
        };

        let delivered = DeliveredEvent {
            message,
            payload,
            receive_count: received.receive_count,
        };
        if let Err(e) = self.handler.handle(&delivered).await {
            warn!(%dedupe_key, receive_count = received.receive_count, error = %e, "handler failed");
            return self.give_up(received).await;
        }
        if let Err(e) = self.processed.insert(&dedupe_key).await {
            // Side effects are done; a redelivery will rerun the handler.
            warn!(%dedupe_key, error = %e, "could not record processed key");
            return self.give_up(received).await;
        }
        self.acknowledge(received).await;
        Outcome::Processed
    }

    async fn acknowledge(&self, received: &ReceivedMessage) {
        if let Err(e) = self.queue.ack(&received.receipt).await {
            warn!(message_id = %received.message_id, error = %e, "ack failed; message will be redelivered");
        }
    }

    async fn give_up(&self, received: &ReceivedMessage) -> Outcome {
        if let Err(e) = self.queue.nack(&received.receipt).await {
            warn!(message_id = %received.message_id, error = %e, "nack failed");
        }
        Outcome::Failed
    }

    /// Processes batches until `shutdown` flips to `true` or, when given,
    /// `max_iterations` batches have run. Returns the accumulated stats.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        max_iterations: Option<usize>,
    ) -> ConsumerStats {
        let mut total = ConsumerStats::default();
        let mut iterations = 0;
        info!(batch_size = self.batch_size, "consumer started");

        while !*shutdown.borrow() {
            let wait = match self.process_batch().await {
                Ok(stats) => {
                    total.merge(stats);
                    if stats.received > 0 {
                        info!(?stats, ?total, "batch processed");
                        None
                    } else {
                        Some(self.idle_wait)
                    }
                }
                Err(e) => {
                    error!(error = %e, "receive failed");
                    Some(self.error_backoff)
                }
            };

            iterations += 1;
            if max_iterations.is_some_and(|max| iterations >= max) {
                info!(iterations, "reached iteration limit");
                break;
            }
            if let Some(wait) = wait {
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(?total, "consumer stopped");
        total
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use tip_core::bus::OutgoingMessage;
    use tip_core::consumer::HandlerError;
    use tip_test_support::{ManualClock, make_event};

    use super::*;
    use crate::in_memory::InMemoryBroker;
    use crate::queue::{RedriveAllowPolicy, RedrivePolicy};

    const SOURCE: &str = "tip-events";
    const DLQ: &str = "tip-events-dlq";

    #[derive(Debug, Default)]
    struct CountingHandler {
        handled: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, event: &DeliveredEvent) -> Result<(), HandlerError> {
            if self.fail {
                return Err(HandlerError("enrichment service unavailable".into()));
            }
            self.handled
                .lock()
                .unwrap()
                .push(event.message.dedupe_key.clone());
            Ok(())
        }
    }

    fn broker() -> Arc<InMemoryBroker> {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let broker = Arc::new(InMemoryBroker::new(clock, ChronoDuration::seconds(30)));
        broker
            .create_queue(DLQ, None, RedriveAllowPolicy::AllowAll)
            .unwrap();
        broker
            .create_queue(
                SOURCE,
                Some(RedrivePolicy::new(DLQ)),
                RedriveAllowPolicy::DenyAll,
            )
            .unwrap();
        broker
    }

    fn publish(broker: &InMemoryBroker, dedupe_key: &str) {
        let event = make_event(dedupe_key, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let body = BusMessage::from(&event).to_payload().to_string().into_bytes();
        broker
            .send(
                SOURCE,
                &OutgoingMessage {
                    event_id: event.event_id,
                    dedupe_key: dedupe_key.to_owned(),
                    body,
                },
            )
            .unwrap();
    }

    fn consumer(broker: &Arc<InMemoryBroker>, handler: Arc<CountingHandler>) -> Consumer {
        Consumer::new(
            Arc::new(broker.handle(SOURCE).unwrap()),
            handler,
            Arc::new(InMemoryProcessedKeys::new()),
        )
    }

    #[tokio::test]
    async fn test_redelivered_dedupe_key_runs_handler_once() {
        let broker = broker();
        let handler = Arc::new(CountingHandler::default());
        let consumer = consumer(&broker, handler.clone());
        publish(&broker, "wsb:2024-01-01:AAPL:post123");
        publish(&broker, "wsb:2024-01-01:AAPL:post123");

        let stats = consumer.process_batch().await.unwrap();

        assert_eq!(
            stats,
            ConsumerStats {
                received: 2,
                processed: 1,
                duplicates: 1,
                failed: 0
            }
        );
        assert_eq!(handler.handled.lock().unwrap().len(), 1);
        assert_eq!(broker.depth(SOURCE).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failing_handler_leaves_message_until_dead_lettered() {
        let broker = broker();
        let handler = Arc::new(CountingHandler {
            fail: true,
            ..CountingHandler::default()
        });
        let consumer = consumer(&broker, handler);
        publish(&broker, "edgar:0000320193-24-000001");

        for _ in 0..4 {
            let stats = consumer.process_batch().await.unwrap();
            assert_eq!(stats.failed, 1);
        }
        assert_eq!(broker.depth(SOURCE).unwrap(), 1);

        consumer.process_batch().await.unwrap();
        assert_eq!(broker.depth(SOURCE).unwrap(), 0);
        assert_eq!(broker.depth(DLQ).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_body_is_nacked() {
        let broker = broker();
        let consumer = consumer(&broker, Arc::new(CountingHandler::default()));
        broker
            .send(
                SOURCE,
                &OutgoingMessage {
                    event_id: uuid::Uuid::new_v4(),
                    dedupe_key: "garbage".into(),
                    body: b"not json".to_vec(),
                },
            )
            .unwrap();

        let stats = consumer.process_batch().await.unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(broker.peek(SOURCE).unwrap()[0].receive_count, 1);
    }

    #[tokio::test]
    async fn test_run_stops_after_iteration_limit() {
        let broker = broker();
        let handler = Arc::new(CountingHandler::default());
        let consumer = consumer(&broker, handler.clone())
            .with_waits(Duration::from_millis(1), Duration::from_millis(1));
        publish(&broker, "market:AAPL:bar0");
        publish(&broker, "market:AAPL:bar1");
        let (_tx, rx) = watch::channel(false);

        let total = consumer.run(rx, Some(2)).await;

        assert_eq!(total.received, 2);
        assert_eq!(total.processed, 2);
        assert_eq!(
            *handler.handled.lock().unwrap(),
            vec!["market:AAPL:bar0".to_string(), "market:AAPL:bar1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_run_returns_immediately_when_already_shut_down() {
        let broker = broker();
        let consumer = consumer(&broker, Arc::new(CountingHandler::default()));
        publish(&broker, "market:AAPL:bar0");
        let (_tx, rx) = watch::channel(true);

        let total = consumer.run(rx, None).await;

        assert_eq!(total, ConsumerStats::default());
        assert_eq!(broker.depth(SOURCE).unwrap(), 1);
    }
}
