//! Clock abstraction for deterministic testing of `created_at` assignment.

use chrono::{DateTime, Utc};

/// Abstracts wall-clock time so producers can be tested deterministically.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock, backed by [`chrono::Utc::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
