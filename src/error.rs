use crate::tuple::{QueueMsg, TaskId};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative shutdown signal shared between an executor and every
/// blocking publish path it owns. Tripping the token makes the next
/// blocking call return [`Cancelled`] instead of parking again.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Returned by every blocking call once the owning [`CancelToken`]
/// has been tripped. Always propagated up; never swallowed below the
/// executor's shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cancelled")]
pub struct Cancelled;

/// A wait-free publish found the ring full. Normal flow control, not
/// an error: callers convert it into a back-pressure wait. Carries the
/// rejected message back to the caller.
#[derive(Debug, thiserror::Error)]
#[error("queue full")]
pub struct QueueFull(pub QueueMsg);

/// A second producer handle was requested on a single-producer queue.
#[derive(Debug, thiserror::Error)]
#[error("queue '{0}' is single-producer and already has a registered producer")]
pub struct SingleProducerViolation(pub String);

/// Why a spout message is being failed.
///
/// The display strings are wire-stable: they match what the rest of the
/// topology reports for the same condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// No ack arrived before the pending entry rotated out.
    Timeout,
    /// A downstream task explicitly failed the tuple tree.
    FailStream,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::Timeout => f.write_str("TIMEOUT"),
            FailReason::FailStream => f.write_str("FAIL-STREAM"),
        }
    }
}

/// Terminal failures of a spout executor.
///
/// `Invariant` and `User` unwind out of the run loop to the supervisor,
/// which typically restarts the worker. Cancellation is translated into
/// the orderly shutdown sequence before `run` returns.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("cancelled")]
    Cancelled(#[from] Cancelled),

    /// A broken internal invariant, e.g. an ack whose task id does not
    /// match the emitter recorded in the pending map.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A user callback failed; wrapped with the task and call site.
    #[error("spout {during} failed on task {task}: {source}")]
    User {
        task: TaskId,
        during: &'static str,
        #[source]
        source: anyhow::Error,
    },
}
