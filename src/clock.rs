//! Wall-clock source for persisted timestamps
//!
//! DLQ scheduling, stale-event expiry and audit rows use wall-clock time
//! because they are persisted and compared across processes. Tests drive a
//! [`ManualClock`] instead of sleeping for days.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Source of the current UTC time
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    /// Jump to an absolute time
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Shared handle to the system clock
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
