//! Abstracted time source used for durations, heartbeats, and deadlines.
//!
//! All timing-sensitive code in this workspace reads time through a `Clock`
//! rather than calling `std::time::Instant::now()`/`chrono::Utc::now()`
//! directly, so tests can substitute a `FixedClock` and assert on exact
//! heartbeat/orphan-threshold boundaries without sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;

/// A monotonic and wall-clock time source.
pub trait Clock: Send + Sync {
    /// A monotonic instant, suitable for measuring durations.
    fn now(&self) -> Instant;

    /// Current wall-clock time in milliseconds since the Unix epoch.
    /// This is the unit `InflightRegistry` uses for KV sorted-set scores.
    fn now_ms(&self) -> i64;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A clock whose `now_ms` can be advanced explicitly by tests. `now()` still
/// reads the real monotonic clock, since `Instant` cannot be constructed from
/// an arbitrary offset; tests that need to control elapsed monotonic time
/// should instead assert on `now_ms` deltas, which is what the registry and
/// monitor actually key their decisions on.
pub struct FixedClock {
    base: Instant,
    ms: AtomicI64,
}

impl FixedClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            base: Instant::now(),
            ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.ms.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set_ms(&self, ms: i64) {
        self.ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Instant {
        self.base
    }

    fn now_ms(&self) -> i64 {
        self.ms.load(Ordering::SeqCst)
    }
}
