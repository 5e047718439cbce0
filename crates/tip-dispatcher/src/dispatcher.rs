//! The poll / claim / publish / mark loop.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tip_core::bus::{EventBus, OutgoingMessage, PublishError};
use tip_core::clock::Clock;
use tip_core::outbox::{ClaimRequest, OutboxEntry};
use tip_core::store::OutboxRepository;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::config::DispatcherConfig;
use crate::error::DispatchError;

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Rows claimed.
    pub claimed: usize,
    /// Rows accepted by the bus and marked published.
    pub published: usize,
    /// Rows whose publish failed.
    pub failed: usize,
    /// Failed rows that were quarantined.
    pub quarantined: usize,
    /// Rows accepted by the bus whose mark failed; they will be published
    /// again.
    pub mark_failed: usize,
    /// Claimed rows left unpublished because the lease would have lapsed
    /// before their publish deadline.
    pub lease_expired: usize,
}

impl CycleReport {
    fn merge(&mut self, other: &Self) {
        self.claimed += other.claimed;
        self.published += other.published;
        self.failed += other.failed;
        self.quarantined += other.quarantined;
        self.mark_failed += other.mark_failed;
        self.lease_expired += other.lease_expired;
    }
}

/// Drains the outbox into the event bus.
pub struct Dispatcher {
    outbox: Arc<dyn OutboxRepository>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Creates a dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Config` if `config` fails
    /// [`DispatcherConfig::validate`].
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        Ok(Self {
            outbox,
            bus,
            clock,
            config,
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn claim_request(&self) -> Result<ClaimRequest, DispatchError> {
        let now = self.clock.now();
        let lease_until = self
            .config
            .claim_lease
            .map(|lease| {
                chrono::Duration::from_std(lease)
                    .map(|lease| now + lease)
                    .map_err(|e| DispatchError::Config(format!("claim lease out of range: {e}")))
            })
            .transpose()?;
        Ok(ClaimRequest {
            limit: self.config.batch_size,
            now,
            lease_until,
            claimant: self.config.claimant.clone(),
        })
    }

    async fn publish(&self, entry: &OutboxEntry) -> Result<String, PublishError> {
        let message = OutgoingMessage {
            event_id: entry.event_id,
            dedupe_key: entry.dedupe_key.clone(),
            body: entry.body(),
        };
        let timeout = self.config.publish_timeout;
        tokio::time::timeout(timeout, self.bus.send(message))
            .await
            .unwrap_or(Err(PublishError::Timeout(timeout)))
    }

    /// Runs one cycle: claim up to `batch_size` rows, publish them with at
    /// most `max_in_flight` in flight, and mark the accepted ones.
    ///
    /// Publishes start in ascending `outbox_id` order. A row is marked only
    /// after the bus accepted it; a failed publish or mark leaves the row
    /// unpublished for a later cycle. With a claim lease, a chunk whose
    /// publish deadline would outrun the lease is not started; its rows
    /// become claimable again once the lease lapses.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Store` if the claim fails. Per-row failures
    /// are reported in the returned [`CycleReport`].
    #[instrument(skip(self), fields(claimant = %self.config.claimant))]
    pub async fn dispatch_once(&self) -> Result<CycleReport, DispatchError> {
        let request = self.claim_request()?;
        let rows = self.outbox.claim_pending(&request).await?;
        let mut report = CycleReport {
            claimed: rows.len(),
            ..CycleReport::default()
        };
        if rows.is_empty() {
            return Ok(report);
        }
        debug!(claimed = rows.len(), "claimed outbox rows");

        for (index, chunk) in rows.chunks(self.config.max_in_flight).enumerate() {
            if request
                .lease_until
                .is_some_and(|lease_until| !self.lease_covers_next_chunk(lease_until))
            {
                report.lease_expired = rows.len() - index * self.config.max_in_flight;
                warn!(
                    remaining = report.lease_expired,
                    lease_until = ?request.lease_until,
                    "claim lease would lapse mid-publish; leaving remaining rows"
                );
                break;
            }
            let results = join_all(chunk.iter().map(|row| self.publish(row))).await;
            for (row, result) in chunk.iter().zip(results) {
                match result {
                    Ok(message_id) => self.mark(row, &message_id, &mut report).await,
                    Err(err) => self.record_failure(row, &err, &mut report).await,
                }
            }
        }

        if report.failed > 0 || report.mark_failed > 0 || report.lease_expired > 0 {
            warn!(?report, "dispatch cycle finished with failures");
        } else {
            info!(published = report.published, "dispatch cycle finished");
        }
        Ok(report)
    }

    fn lease_covers_next_chunk(&self, lease_until: chrono::DateTime<chrono::Utc>) -> bool {
        match chrono::Duration::from_std(self.config.publish_timeout) {
            Ok(timeout) => self.clock.now() + timeout < lease_until,
            Err(_) => false,
        }
    }

    async fn mark(&self, row: &OutboxEntry, message_id: &str, report: &mut CycleReport) {
        match self
            .outbox
            .mark_published(row.outbox_id, self.clock.now())
            .await
        {
            Ok(true) => {
                report.published += 1;
                debug!(outbox_id = row.outbox_id, event_id = %row.event_id, %message_id, "published");
            }
            Ok(false) => {
                debug!(outbox_id = row.outbox_id, "row was already marked by another dispatcher");
            }
            Err(e) => {
                report.mark_failed += 1;
                error!(
                    outbox_id = row.outbox_id,
                    event_id = %row.event_id,
                    dedupe_key = %row.dedupe_key,
                    error = %e,
                    "published but could not mark; row will be republished"
                );
            }
        }
    }

    async fn record_failure(&self, row: &OutboxEntry, err: &PublishError, report: &mut CycleReport) {
        report.failed += 1;
        let now = self.clock.now();
        let failure = self.config.retry.on_failure(row.attempts, err, now);
        if failure.quarantine {
            report.quarantined += 1;
            error!(
                outbox_id = row.outbox_id,
                event_id = %row.event_id,
                attempts = row.attempts + 1,
                error = %err,
                "quarantining outbox row"
            );
        } else {
            warn!(
                outbox_id = row.outbox_id,
                event_id = %row.event_id,
                attempts = row.attempts + 1,
                retryable = err.is_retryable(),
                next_attempt_at = ?failure.next_attempt_at,
                error = %err,
                "publish failed"
            );
        }
        if let Err(e) = self.outbox.record_failure(row.outbox_id, &failure, now).await {
            warn!(outbox_id = row.outbox_id, error = %e, "could not record publish failure");
        }
    }

    /// Runs cycles until `shutdown` turns `true` or its sender is dropped.
    ///
    /// A cycle that published a full batch is followed immediately by the
    /// next; otherwise the loop sleeps for `poll_interval`. An in-flight
    /// cycle always completes before the loop exits. Returns the totals.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> CycleReport {
        let mut totals = CycleReport::default();
        info!(
            batch_size = self.config.batch_size,
            max_in_flight = self.config.max_in_flight,
            leased = self.config.claim_lease.is_some(),
            "dispatcher started"
        );

        while !*shutdown.borrow() {
            let more_work = match self.dispatch_once().await {
                Ok(report) => {
                    totals.merge(&report);
                    report.published > 0 && report.claimed == self.config.batch_size
                }
                Err(e) => {
                    error!(error = %e, "dispatch cycle failed");
                    false
                }
            };
            if more_work {
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(?totals, "dispatcher stopped");
        totals
    }
}
