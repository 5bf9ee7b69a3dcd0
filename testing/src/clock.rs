//! A deterministic [`Clock`] for tests.

use chrono::{DateTime, Utc};
use ordlog_core::clock::Clock;
use std::sync::{Arc, RwLock};

/// A [`Clock`] that returns a fixed, manually advanceable instant.
#[derive(Clone, Debug)]
pub struct FixedClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl FixedClock {
    /// Create a clock fixed at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(now)),
        }
    }

    /// Advance the clock by `duration`.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now += duration;
    }

    /// Set the clock to an exact instant.
    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = now;
    }
}

/// A [`FixedClock`] fixed at the Unix epoch, useful when the exact instant
/// doesn't matter to the test.
#[must_use]
pub fn test_clock() -> FixedClock {
    FixedClock::new(DateTime::<Utc>::UNIX_EPOCH)
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_time_forward() {
        let clock = test_clock();
        let before = clock.now();
        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(clock.now(), before + chrono::Duration::seconds(5));
    }
}
