//! Pluggable idle policies for the two places the executor gives up the
//! CPU: an empty `next_tuple` pass, and a full downstream queue.
//!
//! A strategy is called with the current idle-iteration count and
//! returns the next one. Escalation state therefore lives with the
//! caller, so one strategy instance can be shared by any number of
//! producers.

use serde::{Deserialize, Serialize};
use std::hint;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub trait WaitStrategy: Send + Sync {
    /// Idle once at escalation level `idle_count`, returning the count
    /// the caller should pass next time (usually `idle_count + 1`).
    fn idle(&self, idle_count: u64) -> u64;
}

/// Spin, then yield, then park for doubling durations up to a cap.
pub struct ProgressiveWait {
    spin_up_to: u64,
    yield_up_to: u64,
    park: Duration,
    park_cap: Duration,
}

impl ProgressiveWait {
    pub fn new(spin_up_to: u64, yield_up_to: u64, park: Duration, park_cap: Duration) -> Self {
        Self {
            spin_up_to,
            yield_up_to: yield_up_to.max(spin_up_to),
            park,
            park_cap: park_cap.max(park),
        }
    }
}

impl WaitStrategy for ProgressiveWait {
    #[inline]
    fn idle(&self, idle_count: u64) -> u64 {
        if idle_count < self.spin_up_to {
            hint::spin_loop();
        } else if idle_count < self.yield_up_to {
            thread::yield_now();
        } else {
            // Doubling park duration, capped. The shift saturates well
            // before overflow.
            let exp = (idle_count - self.yield_up_to).min(32) as u32;
            let park = self
                .park
                .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
                .min(self.park_cap);
            thread::park_timeout(park);
        }
        idle_count + 1
    }
}

/// Sleep a fixed interval per idle call.
pub struct SleepWait(Duration);

impl SleepWait {
    pub fn new(interval: Duration) -> Self {
        Self(interval)
    }
}

impl WaitStrategy for SleepWait {
    #[inline]
    fn idle(&self, idle_count: u64) -> u64 {
        thread::sleep(self.0);
        idle_count + 1
    }
}

/// Busy retry: returns immediately.
pub struct NoWait;

impl WaitStrategy for NoWait {
    #[inline(always)]
    fn idle(&self, idle_count: u64) -> u64 {
        idle_count + 1
    }
}

/// Declarative strategy selection, deserialized from topology config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum WaitStrategyConfig {
    Progressive {
        spin_up_to: u64,
        yield_up_to: u64,
        park_micros: u64,
        park_cap_micros: u64,
    },
    Sleep {
        millis: u64,
    },
    NoOp,
}

impl WaitStrategyConfig {
    /// Defaults for the empty-emit slot: back off quickly, park shallow.
    pub fn default_spout() -> Self {
        WaitStrategyConfig::Progressive {
            spin_up_to: 0,
            yield_up_to: 0,
            park_micros: 1_000,
            park_cap_micros: 10_000,
        }
    }

    /// Defaults for the back-pressure slot: spin briefly before parking,
    /// since downstream usually frees a slot within microseconds.
    pub fn default_backpressure() -> Self {
        WaitStrategyConfig::Progressive {
            spin_up_to: 100,
            yield_up_to: 1_000,
            park_micros: 1_000,
            park_cap_micros: 1_000_000,
        }
    }

    pub fn build(&self) -> Arc<dyn WaitStrategy> {
        match *self {
            WaitStrategyConfig::Progressive {
                spin_up_to,
                yield_up_to,
                park_micros,
                park_cap_micros,
            } => Arc::new(ProgressiveWait::new(
                spin_up_to,
                yield_up_to,
                Duration::from_micros(park_micros),
                Duration::from_micros(park_cap_micros),
            )),
            WaitStrategyConfig::Sleep { millis } => {
                Arc::new(SleepWait::new(Duration::from_millis(millis)))
            }
            WaitStrategyConfig::NoOp => Arc::new(NoWait),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn idle_count_monotonic() {
        for strategy in [
            WaitStrategyConfig::default_spout().build(),
            WaitStrategyConfig::NoOp.build(),
            WaitStrategyConfig::Sleep { millis: 0 }.build(),
        ] {
            let mut n = 0;
            for _ in 0..5 {
                let next = strategy.idle(n);
                assert_eq!(next, n + 1);
                n = next;
            }
        }
    }

    #[test]
    fn progressive_parks_after_yield_phase() {
        let strategy = ProgressiveWait::new(
            2,
            4,
            Duration::from_millis(5),
            Duration::from_millis(5),
        );
        // Counts below the yield threshold return without parking.
        let start = Instant::now();
        strategy.idle(0);
        strategy.idle(3);
        assert!(start.elapsed() < Duration::from_millis(5));
        // Past the threshold it parks; several calls must accumulate at
        // least one full park even if one wakes spuriously.
        let start = Instant::now();
        for _ in 0..3 {
            strategy.idle(10);
        }
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn progressive_park_respects_cap() {
        let strategy = ProgressiveWait::new(
            0,
            0,
            Duration::from_millis(1),
            Duration::from_millis(8),
        );
        // Escalation far past the doubling range must still park at the
        // cap, not overflow into a huge sleep.
        let start = Instant::now();
        strategy.idle(1_000);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn config_round_trips_through_serde() {
        let conf = WaitStrategyConfig::default_backpressure();
        let json = serde_json::to_string(&conf).unwrap();
        let back: WaitStrategyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, conf);
    }
}
