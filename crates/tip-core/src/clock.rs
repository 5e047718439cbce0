//! Clock abstraction for determinism.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Abstraction over system time for deterministic behavior.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock that delegates to the system clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that never goes backwards within one process.
///
/// Wraps another clock and clamps each reading to be no earlier than the
/// previous one. Used to stamp `ts_ingested`, which is monotonic per process
/// but not globally ordered.
#[derive(Debug)]
pub struct MonotonicClock<C> {
    inner: C,
    last: Mutex<Option<DateTime<Utc>>>,
}

impl<C: Clock> MonotonicClock<C> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            last: Mutex::new(None),
        }
    }
}

impl<C: Clock> Clock for MonotonicClock<C> {
    fn now(&self) -> DateTime<Utc> {
        let reading = self.inner.now();
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = match *last {
            Some(previous) if previous > reading => previous,
            _ => reading,
        };
        *last = Some(now);
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    struct ScriptedClock(Mutex<Vec<DateTime<Utc>>>);

    impl Clock for ScriptedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0.lock().unwrap().remove(0)
        }
    }

    #[test]
    fn test_monotonic_clock_never_goes_backwards() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let clock = MonotonicClock::new(ScriptedClock(Mutex::new(vec![
            t0,
            t0 - Duration::seconds(5),
            t0 + Duration::seconds(1),
        ])));

        assert_eq!(clock.now(), t0);
        assert_eq!(clock.now(), t0);
        assert_eq!(clock.now(), t0 + Duration::seconds(1));
    }
}
