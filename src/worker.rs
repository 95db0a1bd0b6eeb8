//! Seams to the surrounding worker process.
//!
//! The executor core does not know how the worker wires queues or moves
//! bytes between hosts; it sees exactly three capabilities: local-task
//! lookup, local queue access, and a remote byte sink.

use crate::config::TopologyConfig;
use crate::error::CancelToken;
use crate::queue::BoundedQueue;
use crate::tuple::{QueueMsg, TaskId, Tuple};
use ahash::AHashMap;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of the tick thread's cancellation checks.
const TICK_SLICE: Duration = Duration::from_millis(10);

/// Drive an executor's pending-map rotation: publishes
/// [`QueueMsg::Tick`] into `queue` every
/// [`tick_period`](TopologyConfig::tick_period) until `cancel` trips.
/// The worker runs one of these per spout executor. A full ring drops
/// the tick and rotation waits one more period.
pub fn spawn_tick_thread(
    queue: Arc<BoundedQueue>,
    conf: &TopologyConfig,
    cancel: CancelToken,
) -> thread::JoinHandle<()> {
    let period = conf.tick_period();
    thread::spawn(move || {
        let mut last = Instant::now();
        while !cancel.is_cancelled() {
            thread::sleep(TICK_SLICE.min(period));
            if last.elapsed() >= period {
                last = Instant::now();
                let _ = queue.try_publish(QueueMsg::Tick);
            }
        }
    })
}

/// One serialized tuple addressed to a remote task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    pub task: TaskId,
    pub payload: Vec<u8>,
}

pub trait WorkerHandle: Send + Sync {
    fn is_local(&self, task: TaskId) -> bool;

    /// Receive queue of a local task; `None` when the task is not local.
    fn local_queue(&self, task: TaskId) -> Option<Arc<BoundedQueue>>;

    /// Hand off staged remote batches. Drains the map; must not block
    /// the caller beyond its own buffering.
    fn send_remote(&self, batches: &mut AHashMap<TaskId, Vec<TaskMessage>>);
}

/// Opaque wire encoder for tuples leaving the worker.
pub trait TupleSerializer: Send + Sync {
    fn serialize(&self, tuple: &Tuple) -> Vec<u8>;
}

/// Serializer for single-process setups and tests: the tuple's debug
/// rendering. Not a wire format.
pub struct DebugSerializer;

impl TupleSerializer for DebugSerializer {
    fn serialize(&self, tuple: &Tuple) -> Vec<u8> {
        format!("{tuple:?}").into_bytes()
    }
}

/// Worker registry for a single process: tasks map straight to queues,
/// and remote sends collect into a buffer the caller can inspect or
/// forward.
pub struct InProcessWorker {
    queues: RwLock<AHashMap<TaskId, Arc<BoundedQueue>>>,
    remote: RwLock<AHashMap<TaskId, Vec<TaskMessage>>>,
}

impl InProcessWorker {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(AHashMap::new()),
            remote: RwLock::new(AHashMap::new()),
        }
    }

    pub fn register_task(&self, task: TaskId, queue: Arc<BoundedQueue>) {
        self.queues.write().unwrap().insert(task, queue);
    }

    /// Take everything "sent remote" so far.
    pub fn drain_remote(&self) -> AHashMap<TaskId, Vec<TaskMessage>> {
        std::mem::take(&mut *self.remote.write().unwrap())
    }
}

impl Default for InProcessWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerHandle for InProcessWorker {
    fn is_local(&self, task: TaskId) -> bool {
        self.queues.read().unwrap().contains_key(&task)
    }

    fn local_queue(&self, task: TaskId) -> Option<Arc<BoundedQueue>> {
        self.queues.read().unwrap().get(&task).cloned()
    }

    fn send_remote(&self, batches: &mut AHashMap<TaskId, Vec<TaskMessage>>) {
        let mut remote = self.remote.write().unwrap();
        for (task, mut messages) in batches.drain() {
            remote.entry(task).or_default().append(&mut messages);
        }
    }
}
