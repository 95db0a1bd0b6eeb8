//! Topology configuration consumed by the executor core.
//!
//! Field docs carry the wire-stable key names the surrounding system
//! uses for the same settings.

use crate::wait::WaitStrategyConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// `topology.max.spout.pending` — cap on in-flight anchored messages
    /// per task; 0 disables throttling.
    pub max_spout_pending: usize,

    /// `topology.producer.batch.size` — per-producer staging batch.
    /// Clamped to half the destination queue capacity at registration.
    pub producer_batch_size: usize,

    /// `topology.spout.wait.strategy` — idle policy after an empty
    /// `next_tuple` pass.
    pub spout_wait_strategy: WaitStrategyConfig,

    /// `topology.backpressure.wait.strategy` — idle policy while a
    /// downstream queue is full.
    pub backpressure_wait_strategy: WaitStrategyConfig,

    /// `topology.debug` — per-tuple logging on the emit/ack paths.
    pub debug: bool,

    /// `topology.message.timeout.secs` — period of the tick thread
    /// (see `worker::spawn_tick_thread`) that rotates the pending map:
    /// an unacked message expires within
    /// `[timeout, timeout * pending_buckets]`.
    pub message_timeout_secs: u64,

    /// Receive ring capacity; rounded up to a power of two.
    pub receive_queue_capacity: usize,

    /// Bucket count of the rotating pending map.
    pub pending_buckets: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            max_spout_pending: 0,
            producer_batch_size: 1,
            spout_wait_strategy: WaitStrategyConfig::default_spout(),
            backpressure_wait_strategy: WaitStrategyConfig::default_backpressure(),
            debug: false,
            message_timeout_secs: 30,
            receive_queue_capacity: 1024,
            pending_buckets: 2,
        }
    }
}

impl TopologyConfig {
    /// The throttling limit scales with the number of tasks assigned to
    /// the executor. Zero means unlimited.
    pub fn effective_max_pending(&self, num_tasks: usize) -> usize {
        self.max_spout_pending * num_tasks
    }

    /// Interval between `Tick` rotations of the pending map.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }
}
