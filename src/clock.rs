//! Time sources for the executor.
//!
//! Everything the executor timestamps (pending-tuple emit times, ack
//! latency deltas, metrics snapshots) goes through a [`Clock`], so
//! timeout behaviour is driven in tests by a [`TestClock`] instead of
//! wall-clock sleeping.

use std::cell::Cell;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// One consistent time snapshot per executor iteration.
///
/// All timestamps taken within the same iteration see the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerTime {
    /// Monotonic time, used for all interval arithmetic.
    pub instant: Instant,
    /// Wall time, used only for reporting.
    pub wall: OffsetDateTime,
}

pub trait Clock: Send {
    fn trigger_time(&mut self) -> TriggerTime;
}

/// A clock that caches wall time and uses fast `Instant` calls for
/// precision, resyncing periodically to absorb clock adjustments.
pub struct PrecisionClock {
    base_wall: Cell<OffsetDateTime>,
    base_instant: Cell<Instant>,
    last_resync: Cell<Instant>,
    resync_interval: Duration,
}

impl PrecisionClock {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            base_wall: Cell::new(OffsetDateTime::now_utc()),
            base_instant: Cell::new(now),
            last_resync: Cell::new(now),
            resync_interval: Duration::from_secs(1),
        }
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    fn resync(&self) {
        let now = Instant::now();
        self.base_wall.set(OffsetDateTime::now_utc());
        self.base_instant.set(now);
        self.last_resync.set(now);
    }
}

impl Clock for PrecisionClock {
    fn trigger_time(&mut self) -> TriggerTime {
        let now = Instant::now();
        if now.duration_since(self.last_resync.get()) >= self.resync_interval {
            self.resync();
        }
        let elapsed = now.duration_since(self.base_instant.get());
        TriggerTime {
            instant: now,
            wall: self.base_wall.get() + elapsed,
        }
    }
}

impl Default for PrecisionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A manually advanced clock starting at Unix epoch.
///
/// Clones share state, so a test can hold one handle while the executor
/// owns another. Instants are synthetic: baseline + elapsed, which makes
/// interval assertions exact.
pub struct TestClock(Arc<Mutex<TestClockInner>>);

struct TestClockInner {
    baseline_wall: OffsetDateTime,
    baseline_instant: Instant,
    elapsed: Duration,
}

impl TestClock {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(TestClockInner {
            baseline_wall: OffsetDateTime::UNIX_EPOCH,
            baseline_instant: Instant::now(),
            elapsed: Duration::ZERO,
        })))
    }

    /// Advance both monotonic and wall time.
    pub fn advance(&self, duration: Duration) {
        self.0.lock().unwrap().elapsed += duration;
    }

    pub fn elapsed(&self) -> Duration {
        self.0.lock().unwrap().elapsed
    }
}

impl Clock for TestClock {
    fn trigger_time(&mut self) -> TriggerTime {
        let inner = self.0.lock().unwrap();
        TriggerTime {
            instant: inner.baseline_instant + inner.elapsed,
            wall: inner.baseline_wall + inner.elapsed,
        }
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for TestClock {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
