//! Rolling rates and latency samples backing the queue and executor
//! metrics snapshots.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const BUCKET_COUNT: u64 = 10;
const BUCKET_MS: u64 = 1_000;

/// Windowed event rate, safe to notify from any number of producer
/// threads. Ten one-second buckets; a bucket is lazily reclaimed the
/// first time a notification lands in its slot for a newer epoch, so
/// there is no timer thread and nothing allocates after construction.
///
/// Counts are approximate under heavy contention (a reclaim can drop a
/// concurrent notification) — fine for rates, not for accounting. The
/// `total` counter is exact.
pub struct RateTracker {
    origin: Instant,
    buckets: [CachePadded<Bucket>; BUCKET_COUNT as usize],
    total: AtomicU64,
    closed: AtomicBool,
}

#[derive(Default)]
struct Bucket {
    /// Bucket epoch + 1; zero means never written.
    epoch: AtomicU64,
    count: AtomicU64,
}

impl RateTracker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            buckets: std::array::from_fn(|_| CachePadded::new(Bucket::default())),
            total: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn notify(&self, count: u64) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        self.notify_at(self.origin.elapsed(), count);
    }

    pub(crate) fn notify_at(&self, elapsed: Duration, count: u64) {
        let epoch = elapsed.as_millis() as u64 / BUCKET_MS + 1;
        let bucket = &self.buckets[(epoch % BUCKET_COUNT) as usize];
        let seen = bucket.epoch.load(Ordering::Acquire);
        if seen != epoch {
            // First notification of this epoch reclaims the bucket.
            if bucket
                .epoch
                .compare_exchange(seen, epoch, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                bucket.count.store(0, Ordering::Release);
            }
        }
        bucket.count.fetch_add(count, Ordering::Relaxed);
        self.total.fetch_add(count, Ordering::Relaxed);
    }

    /// Events per second over the trailing window.
    pub fn rate_per_sec(&self) -> f64 {
        self.rate_at(self.origin.elapsed())
    }

    pub(crate) fn rate_at(&self, elapsed: Duration) -> f64 {
        let now_epoch = elapsed.as_millis() as u64 / BUCKET_MS + 1;
        let oldest = now_epoch.saturating_sub(BUCKET_COUNT - 1);
        let mut sum = 0u64;
        for bucket in &self.buckets {
            let epoch = bucket.epoch.load(Ordering::Acquire);
            if epoch >= oldest && epoch <= now_epoch {
                sum += bucket.count.load(Ordering::Relaxed);
            }
        }
        if sum == 0 {
            return 0.0;
        }
        let window_ms = (elapsed.as_millis() as u64).clamp(1, BUCKET_COUNT * BUCKET_MS);
        sum as f64 * 1_000.0 / window_ms as f64
    }

    /// Exact lifetime event count.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Stop accepting notifications. Reads stay valid.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental sample statistics, owned by a single thread.
#[derive(Debug, Clone, Default)]
pub struct RunningStat {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl RunningStat {
    pub fn push(&mut self, sample: f64) {
        if self.count == 0 {
            self.min = sample;
            self.max = sample;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        self.count += 1;
        self.sum += sample;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

/// Counters accumulated by the executor thread between metrics ticks.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    pub acked: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub skipped_inactive: u64,
    pub skipped_max_pending: u64,
    pub ack_latency_ms: RunningStat,
}

/// Point-in-time copy of the per-executor metrics.
#[derive(Debug, Clone)]
pub struct ExecutorStatsSnapshot {
    pub emitted: u64,
    pub empty_emit_streak: u64,
    pub pending: usize,
    pub acked: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub skipped_inactive: u64,
    pub skipped_max_pending: u64,
    pub ack_latency_mean_ms: f64,
    pub ack_latency_samples: u64,
}

/// Point-in-time copy of one queue's metrics.
#[derive(Debug, Clone)]
pub struct QueueState {
    pub name: String,
    pub capacity: usize,
    pub population: usize,
    pub pct_full: f64,
    pub arrival_rate_secs: f64,
    /// Estimated time an element spends queued, assuming the queue is
    /// stable (arrival rate ≈ departure rate).
    pub sojourn_time_ms: f64,
    pub insert_failure_rate_secs: f64,
    pub empty_batches: u64,
}
