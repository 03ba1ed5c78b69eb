//! Time source for the engine.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

use crate::config::MAX_DURATION_SECS;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at the Unix epoch.
    pub fn at_epoch() -> Self {
        Self::new(DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `secs` as a chrono duration, capped at [`MAX_DURATION_SECS`].
pub fn span(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// Start of the period of length `period_secs` containing `at`.
///
/// Periods are aligned to the Unix epoch so every node computes the same
/// boundary.
pub fn period_start(at: DateTime<Utc>, period_secs: u64) -> DateTime<Utc> {
    let period = period_secs.clamp(1, MAX_DURATION_SECS) as i64;
    let aligned = at.timestamp().div_euclid(period) * period;
    DateTime::<Utc>::from_timestamp(aligned, 0).unwrap_or(at)
}

/// Index of the window of length `window_secs` containing `at`.
pub fn window_index(at: DateTime<Utc>, window_secs: u64) -> i64 {
    at.timestamp().div_euclid(window_secs.clamp(1, MAX_DURATION_SECS) as i64)
}
