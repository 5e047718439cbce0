//! Retry policy for rows whose publish failed.
//!
//! Disabled by default: a failed row is simply claimed again on the next
//! cycle. When enabled, failures push `next_attempt_at` out exponentially
//! and a row that keeps failing permanently can be quarantined.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tip_core::bus::PublishError;
use tip_core::outbox::DeliveryFailure;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Backoff {
    /// Delay before the next attempt after `failures` consecutive failures.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let delay = self
            .initial
            .checked_mul(1 << exponent)
            .unwrap_or(self.max)
            .min(self.max);
        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            rand::thread_rng().gen_range(half..=delay)
        } else {
            delay
        }
    }
}

/// What happens to a row after a failed publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Backoff between attempts; `None` retries on the next cycle.
    pub backoff: Option<Backoff>,
    /// Quarantine a row after this many failed attempts, if its latest
    /// failure was permanent. `None` never quarantines.
    pub quarantine_after: Option<u32>,
}

impl RetryPolicy {
    /// Retry every cycle, never quarantine.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Builds the failure record for a row that had `prior_attempts` failed
    /// attempts before this one.
    #[must_use]
    pub fn on_failure(
        &self,
        prior_attempts: i32,
        error: &PublishError,
        now: DateTime<Utc>,
    ) -> DeliveryFailure {
        let failures = u32::try_from(prior_attempts.max(0))
            .unwrap_or(0)
            .saturating_add(1);
        let quarantine = !error.is_retryable()
            && self.quarantine_after.is_some_and(|limit| failures >= limit);
        let next_attempt_at = self
            .backoff
            .filter(|_| !quarantine)
            .and_then(|b| chrono::Duration::from_std(b.delay(failures)).ok())
            .map(|delay| now + delay);

        DeliveryFailure {
            error: error.to_string(),
            next_attempt_at,
            quarantine,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn backoff(jitter: bool) -> Backoff {
        Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter,
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_the_cap() {
        let b = backoff(false);

        assert_eq!(b.delay(1), Duration::from_secs(1));
        assert_eq!(b.delay(2), Duration::from_secs(2));
        assert_eq!(b.delay(4), Duration::from_secs(8));
        assert_eq!(b.delay(7), Duration::from_secs(60));
        assert_eq!(b.delay(200), Duration::from_secs(60));
    }

    #[test]
    fn test_jittered_backoff_stays_within_half_to_full_delay() {
        let b = backoff(true);

        for _ in 0..100 {
            let d = b.delay(3);
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(4), "{d:?}");
        }
    }

    #[test]
    fn test_disabled_policy_retries_next_cycle() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let failure = RetryPolicy::disabled().on_failure(
            9,
            &PublishError::Permanent("too large".into()),
            now,
        );

        assert_eq!(failure.next_attempt_at, None);
        assert!(!failure.quarantine);
        assert_eq!(failure.error, "permanent publish failure: too large");
    }

    #[test]
    fn test_backoff_schedules_next_attempt() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let policy = RetryPolicy {
            backoff: Some(backoff(false)),
            quarantine_after: None,
        };

        let failure = policy.on_failure(2, &PublishError::Transient("down".into()), now);

        assert_eq!(
            failure.next_attempt_at,
            Some(now + chrono::Duration::seconds(4))
        );
    }

    #[test]
    fn test_only_permanent_failures_quarantine() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let policy = RetryPolicy {
            backoff: Some(backoff(false)),
            quarantine_after: Some(3),
        };

        let transient = policy.on_failure(5, &PublishError::Timeout(Duration::from_secs(10)), now);
        let early = policy.on_failure(0, &PublishError::Permanent("bad".into()), now);
        let exhausted = policy.on_failure(2, &PublishError::Permanent("bad".into()), now);

        assert!(!transient.quarantine);
        assert!(!early.quarantine);
        assert!(exhausted.quarantine);
        assert_eq!(exhausted.next_attempt_at, None);
    }
}
