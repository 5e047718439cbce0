//! Mock `EventBus` implementations for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tip_core::bus::{EventBus, OutgoingMessage, PublishError};

use crate::clock::ManualClock;

#[derive(Debug, Default)]
struct BusState {
    accepted: Vec<OutgoingMessage>,
    attempts: Vec<OutgoingMessage>,
    outage: Option<PublishError>,
    failing_keys: HashMap<String, PublishError>,
}

/// A bus that records every send attempt and accepts messages unless told
/// otherwise.
///
/// An outage fails every send; a per-key failure fails only messages with
/// that dedupe key. Accepted messages get ids `msg-1`, `msg-2`, ...
#[derive(Debug, Default)]
pub struct RecordingBus {
    state: Mutex<BusState>,
}

impl RecordingBus {
    /// Create a bus that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus that fails every send with `error`.
    #[must_use]
    pub fn failing(error: PublishError) -> Self {
        let bus = Self::new();
        bus.set_outage(Some(error));
        bus
    }

    /// Starts (`Some`) or ends (`None`) a broker outage.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn set_outage(&self, error: Option<PublishError>) {
        self.state.lock().unwrap().outage = error;
    }

    /// Fails every send of `dedupe_key` with `error`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn fail_dedupe_key(&self, dedupe_key: &str, error: PublishError) {
        self.state
            .lock()
            .unwrap()
            .failing_keys
            .insert(dedupe_key.to_owned(), error);
    }

    /// Messages the bus accepted, in acceptance order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn accepted(&self) -> Vec<OutgoingMessage> {
        self.state.lock().unwrap().accepted.clone()
    }

    /// Dedupe keys of accepted messages, in acceptance order.
    pub fn accepted_dedupe_keys(&self) -> Vec<String> {
        self.accepted().into_iter().map(|m| m.dedupe_key).collect()
    }

    /// Every send attempt, accepted or not, in call order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn attempts(&self) -> Vec<OutgoingMessage> {
        self.state.lock().unwrap().attempts.clone()
    }
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn send(&self, message: OutgoingMessage) -> Result<String, PublishError> {
        let mut state = self.state.lock().unwrap();
        state.attempts.push(message.clone());
        if let Some(error) = &state.outage {
            return Err(error.clone());
        }
        if let Some(error) = state.failing_keys.get(&message.dedupe_key) {
            return Err(error.clone());
        }
        state.accepted.push(message);
        Ok(format!("msg-{}", state.accepted.len()))
    }
}

/// A bus that waits before delegating to an inner [`RecordingBus`].
///
/// Used to exercise publish deadlines.
#[derive(Debug)]
pub struct SlowBus {
    delay: Duration,
    inner: RecordingBus,
}

impl SlowBus {
    /// Create a bus that answers after `delay`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: RecordingBus::new(),
        }
    }

    /// The bus that eventually receives the messages.
    #[must_use]
    pub fn inner(&self) -> &RecordingBus {
        &self.inner
    }
}

#[async_trait]
impl EventBus for SlowBus {
    async fn send(&self, message: OutgoingMessage) -> Result<String, PublishError> {
        tokio::time::sleep(self.delay).await;
        self.inner.send(message).await
    }
}

/// A bus that advances a [`ManualClock`] by a fixed step on every send,
/// then delegates to an inner [`RecordingBus`].
///
/// Simulates slow publishes against wall-clock leases without sleeping.
#[derive(Debug)]
pub struct SteppingBus {
    clock: Arc<ManualClock>,
    step: chrono::Duration,
    inner: RecordingBus,
}

impl SteppingBus {
    /// Create a bus that moves `clock` forward by `step` per send.
    #[must_use]
    pub fn new(clock: Arc<ManualClock>, step: chrono::Duration) -> Self {
        Self {
            clock,
            step,
            inner: RecordingBus::new(),
        }
    }

    /// The bus that receives the messages.
    #[must_use]
    pub fn inner(&self) -> &RecordingBus {
        &self.inner
    }
}

#[async_trait]
impl EventBus for SteppingBus {
    async fn send(&self, message: OutgoingMessage) -> Result<String, PublishError> {
        self.clock.advance(self.step);
        self.inner.send(message).await
    }
}
