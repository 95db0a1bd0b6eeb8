//! Single-executor core of a distributed stream-processing worker.
//!
//! A [`SpoutExecutor`](executor::SpoutExecutor) drives the source tasks
//! of one component on one thread: it calls the user spout for new
//! tuples, routes them to local peer queues or remote batches through
//! the transfer layer, tracks anchored messages in a rotating timeout
//! map, and consumes acks, fails, ticks, and flush signals from its own
//! bounded receive queue. Back-pressure propagates by blocking
//! producers on full queues, never by dropping.
//!
//! The crate talks to the rest of the worker through three seams:
//! [`Spout`](spout::Spout) (the user source),
//! [`WorkerHandle`](worker::WorkerHandle) (queue registry + remote
//! sink), and [`TupleSerializer`](worker::TupleSerializer) (wire
//! encoding).

pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod grouping;
pub mod metrics;
pub mod queue;
pub mod rotating;
pub mod spout;
pub mod tuple;
pub mod wait;
pub mod worker;

pub mod prelude {
    pub use crate::clock::{Clock, PrecisionClock, TestClock, TriggerTime};
    pub use crate::config::TopologyConfig;
    pub use crate::error::{CancelToken, Cancelled, ExecutorError, FailReason};
    pub use crate::executor::collector::TaskCollector;
    pub use crate::executor::{MetricsSnapshot, SpoutExecutor, SpoutExecutorBuilder};
    pub use crate::grouping::{Grouping, StreamRouter};
    pub use crate::queue::{BoundedQueue, ProducerHandle, ProducerKind, QueueConsumer};
    pub use crate::rotating::RotatingMap;
    pub use crate::spout::{Credentials, Spout, TaskContext};
    pub use crate::tuple::{streams, AckMsg, QueueMsg, TaskId, Tuple, TupleInfo, Value};
    pub use crate::wait::{WaitStrategy, WaitStrategyConfig};
    pub use crate::worker::{
        spawn_tick_thread, InProcessWorker, TaskMessage, TupleSerializer, WorkerHandle,
    };
}
