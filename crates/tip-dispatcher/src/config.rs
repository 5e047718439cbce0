//! Dispatcher configuration.
//!
//! Read once at startup from `DISPATCH_*` environment variables. Parsing
//! goes through a lookup function so tests need not touch the process
//! environment.

use std::str::FromStr;
use std::time::Duration;

use crate::error::DispatchError;
use crate::retry::{Backoff, RetryPolicy};

/// Rows claimed per cycle.
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Sleep between cycles that found no full batch.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Concurrent publishes within a batch.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;
/// Deadline for one publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime settings of a dispatcher instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Rows claimed per cycle.
    pub batch_size: usize,
    /// Sleep between cycles when there is no immediate further work.
    pub poll_interval: Duration,
    /// Concurrent publishes within a batch.
    pub max_in_flight: usize,
    /// Deadline for one publish; expiry counts as a retryable failure.
    pub publish_timeout: Duration,
    /// When set, claimed rows are leased to this instance for this long so
    /// concurrent dispatchers skip them.
    pub claim_lease: Option<Duration>,
    /// Identifies this instance in claim stamps.
    pub claimant: String,
    /// Handling of failed publishes.
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            claim_lease: None,
            claimant: format!("dispatcher-{}", std::process::id()),
            retry: RetryPolicy::disabled(),
        }
    }
}

impl DispatcherConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Config` if a variable is malformed or the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self, DispatchError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, falling back to defaults
    /// for unset variables.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `DISPATCH_BATCH_SIZE` | rows per cycle |
    /// | `DISPATCH_POLL_INTERVAL_MS` | idle sleep |
    /// | `DISPATCH_MAX_IN_FLIGHT` | concurrent publishes |
    /// | `DISPATCH_PUBLISH_TIMEOUT_MS` | publish deadline |
    /// | `DISPATCH_CLAIM_LEASE_MS` | enables leased claiming; must exceed the batch publish budget |
    /// | `DISPATCH_CLAIMANT` | instance name |
    /// | `DISPATCH_BACKOFF_INITIAL_MS` | enables backoff |
    /// | `DISPATCH_BACKOFF_MAX_MS` | backoff cap (default 5 min) |
    /// | `DISPATCH_BACKOFF_JITTER` | `true`/`false` |
    /// | `DISPATCH_QUARANTINE_AFTER` | attempts before quarantining permanent failures |
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Config` if a variable is malformed or the
    /// resulting configuration is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DispatchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str| parse::<u64, _>(&lookup, key).map(|v| v.map(Duration::from_millis));

        let backoff = match millis("DISPATCH_BACKOFF_INITIAL_MS")? {
            Some(initial) => Some(Backoff {
                initial,
                max: millis("DISPATCH_BACKOFF_MAX_MS")?.unwrap_or(Duration::from_secs(300)),
                jitter: parse::<bool, _>(&lookup, "DISPATCH_BACKOFF_JITTER")?.unwrap_or(false),
            }),
            None => None,
        };

        let config = Self {
            batch_size: parse(&lookup, "DISPATCH_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            poll_interval: millis("DISPATCH_POLL_INTERVAL_MS")?.unwrap_or(defaults.poll_interval),
            max_in_flight: parse(&lookup, "DISPATCH_MAX_IN_FLIGHT")?
                .unwrap_or(defaults.max_in_flight),
            publish_timeout: millis("DISPATCH_PUBLISH_TIMEOUT_MS")?
                .unwrap_or(defaults.publish_timeout),
            claim_lease: millis("DISPATCH_CLAIM_LEASE_MS")?,
            claimant: lookup("DISPATCH_CLAIMANT")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.claimant),
            retry: RetryPolicy {
                backoff,
                quarantine_after: parse(&lookup, "DISPATCH_QUARANTINE_AFTER")?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Longest time one cycle can spend publishing: the number of
    /// sequential chunks times the per-publish deadline. `None` on overflow.
    #[must_use]
    pub fn batch_publish_budget(&self) -> Option<Duration> {
        let chunks = self.batch_size.div_ceil(self.max_in_flight.max(1));
        self.publish_timeout.checked_mul(u32::try_from(chunks).ok()?)
    }

    /// Checks invariants between fields.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Config` naming the first violated constraint.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.batch_size == 0 {
            return Err(DispatchError::Config("batch_size must be at least 1".into()));
        }
        if self.max_in_flight == 0 {
            return Err(DispatchError::Config("max_in_flight must be at least 1".into()));
        }
        if self.publish_timeout.is_zero() {
            return Err(DispatchError::Config("publish_timeout must be positive".into()));
        }
        if let Some(lease) = self.claim_lease {
            let budget = self.batch_publish_budget().ok_or_else(|| {
                DispatchError::Config("batch publish budget overflows".into())
            })?;
            // One lease spans every sequential chunk of the batch.
            if lease <= budget {
                return Err(DispatchError::Config(format!(
                    "claim_lease {lease:?} must exceed the batch publish budget {budget:?} \
                     (ceil(batch_size / max_in_flight) * publish_timeout)"
                )));
            }
        }
        if let Some(backoff) = self.retry.backoff {
            if backoff.initial > backoff.max {
                return Err(DispatchError::Config(
                    "backoff initial delay exceeds its maximum".into(),
                ));
            }
        }
        if self.retry.quarantine_after == Some(0) {
            return Err(DispatchError::Config("quarantine_after must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, DispatchError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| DispatchError::Config(format!("{key}={raw:?} is invalid: {e}")))
        })
        .transpose()
}
