//! The spout executor: one thread driving the source tasks of a
//! component.
//!
//! The executor is the sole consumer of its receive queue and the sole
//! mutator of its pending map, collector, and spouts. [`cycle`] performs
//! exactly one unit of work and returns, so a supervisor can interleave
//! executors for fairness; [`run`] loops it until cancellation and then
//! shuts down in order: deactivate, flush, drain outstanding acks up to
//! a deadline, close queue metrics.
//!
//! [`cycle`]: SpoutExecutor::cycle
//! [`run`]: SpoutExecutor::run

pub mod collector;
pub mod transfer;

use crate::clock::{Clock, PrecisionClock};
use crate::config::TopologyConfig;
use crate::error::{CancelToken, Cancelled, ExecutorError, FailReason};
use crate::executor::collector::{OutputCollector, TaskCollector};
use crate::executor::transfer::ExecutorTransfer;
use crate::grouping::StreamRouter;
use crate::metrics::{ExecutorStats, ExecutorStatsSnapshot, QueueState};
use crate::queue::BoundedQueue;
use crate::spout::{Credentials, Spout, TaskContext};
use crate::tuple::{AckMsg, QueueMsg, TaskId, TupleInfo};
use crate::wait::WaitStrategy;
use crate::worker::{DebugSerializer, TupleSerializer, WorkerHandle};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, info, trace, warn};

/// Sleep per iteration while the topology is deactivated.
const INACTIVE_SLEEP: Duration = Duration::from_millis(100);

/// Poll interval while waiting for the first activation before open.
const OPEN_POLL: Duration = Duration::from_millis(100);

/// Receive-queue drain happens on every n-th iteration, which amortises
/// the poll and rate-limits the arrival-tracker notifications.
const DEFAULT_CONSUME_CADENCE: u32 = 8;

/// How long shutdown keeps draining outstanding acks.
const SHUTDOWN_ACK_DRAIN: Duration = Duration::from_secs(1);

/// Snapshot produced on `MetricsTick`.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub wall: OffsetDateTime,
    pub receive_queue: QueueState,
    pub executor: ExecutorStatsSnapshot,
}

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("no tasks added")]
    NoTasks,
    #[error("no receive queue provided")]
    NoReceiveQueue,
    #[error("no worker handle provided")]
    NoWorker,
}

pub struct SpoutExecutorBuilder<S: Spout> {
    component: String,
    tasks: Vec<(TaskId, S)>,
    conf: TopologyConfig,
    receive_queue: Option<Arc<BoundedQueue>>,
    worker: Option<Arc<dyn WorkerHandle>>,
    serializer: Arc<dyn TupleSerializer>,
    router: StreamRouter,
    acker_tasks: Vec<TaskId>,
    clock: Option<Box<dyn Clock>>,
    active: Option<Arc<AtomicBool>>,
    cancel: CancelToken,
    consume_cadence: u32,
    credentials: Credentials,
}

impl<S: Spout> SpoutExecutorBuilder<S> {
    pub fn add_task(mut self, task: TaskId, spout: S) -> Self {
        self.tasks.push((task, spout));
        self
    }

    pub fn with_conf(mut self, conf: TopologyConfig) -> Self {
        self.conf = conf;
        self
    }

    pub fn with_receive_queue(mut self, queue: Arc<BoundedQueue>) -> Self {
        self.receive_queue = Some(queue);
        self
    }

    pub fn with_worker(mut self, worker: Arc<dyn WorkerHandle>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn TupleSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_router(mut self, router: StreamRouter) -> Self {
        self.router = router;
        self
    }

    pub fn with_acker_tasks(mut self, tasks: Vec<TaskId>) -> Self {
        self.acker_tasks = tasks;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    /// Externally toggled activation flag; defaults to an always-active
    /// flag owned by the executor.
    pub fn with_active_flag(mut self, active: Arc<AtomicBool>) -> Self {
        self.active = Some(active);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_consume_cadence(mut self, cadence: u32) -> Self {
        self.consume_cadence = cadence.max(1);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn build(self) -> Result<SpoutExecutor<S>, BuilderError> {
        if self.tasks.is_empty() {
            return Err(BuilderError::NoTasks);
        }
        let receive_queue = self.receive_queue.ok_or(BuilderError::NoReceiveQueue)?;
        let worker = self.worker.ok_or(BuilderError::NoWorker)?;
        let mut clock = self.clock.unwrap_or_else(|| Box::new(PrecisionClock::new()));
        let origin = clock.trigger_time().instant;

        let transfer = ExecutorTransfer::new(
            worker,
            self.serializer,
            self.conf.producer_batch_size.max(1),
            self.conf.debug,
            self.cancel.clone(),
        );
        let collector = OutputCollector::new(
            transfer,
            self.router,
            self.acker_tasks,
            self.conf.pending_buckets,
            self.conf.debug,
        );

        let num_tasks = self.tasks.len();
        let mut task_ids = Vec::with_capacity(num_tasks);
        let mut contexts = Vec::with_capacity(num_tasks);
        let mut spouts = Vec::with_capacity(num_tasks);
        for (index, (task, spout)) in self.tasks.into_iter().enumerate() {
            task_ids.push(task);
            contexts.push(TaskContext {
                task_id: task,
                component: self.component.clone(),
                task_index: index,
                num_tasks,
            });
            spouts.push(spout);
        }

        let max_pending = self.conf.effective_max_pending(num_tasks);
        let spout_wait = self.conf.spout_wait_strategy.build();
        Ok(SpoutExecutor {
            component: self.component,
            task_ids,
            contexts,
            spouts,
            receive_queue,
            collector,
            conf: self.conf,
            clock,
            origin,
            active: self
                .active
                .unwrap_or_else(|| Arc::new(AtomicBool::new(true))),
            cancel: self.cancel,
            last_active: false,
            open_called: false,
            max_pending,
            spout_wait,
            empty_emit_streak: 0,
            iter: 0,
            consume_cadence: self.consume_cadence,
            inbox: Vec::new(),
            ack_scratch: Vec::new(),
            stats: ExecutorStats::default(),
            credentials: self.credentials,
            last_metrics: None,
        })
    }
}

pub struct SpoutExecutor<S: Spout> {
    component: String,
    task_ids: Vec<TaskId>,
    contexts: Vec<TaskContext>,
    spouts: Vec<S>,
    receive_queue: Arc<BoundedQueue>,
    collector: OutputCollector<S::MessageId>,
    conf: TopologyConfig,
    clock: Box<dyn Clock>,
    origin: Instant,
    active: Arc<AtomicBool>,
    cancel: CancelToken,
    last_active: bool,
    open_called: bool,
    max_pending: usize,
    spout_wait: Arc<dyn WaitStrategy>,
    empty_emit_streak: u64,
    iter: u32,
    consume_cadence: u32,
    inbox: Vec<QueueMsg>,
    ack_scratch: Vec<S::MessageId>,
    stats: ExecutorStats,
    credentials: Credentials,
    last_metrics: Option<MetricsSnapshot>,
}

impl<S: Spout> std::fmt::Debug for SpoutExecutor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoutExecutor")
            .field("component", &self.component)
            .field("task_ids", &self.task_ids)
            .finish_non_exhaustive()
    }
}

impl<S: Spout> SpoutExecutor<S> {
    pub fn builder(component: impl Into<String>) -> SpoutExecutorBuilder<S> {
        SpoutExecutorBuilder {
            component: component.into(),
            tasks: Vec::new(),
            conf: TopologyConfig::default(),
            receive_queue: None,
            worker: None,
            serializer: Arc::new(DebugSerializer),
            router: StreamRouter::new(),
            acker_tasks: Vec::new(),
            clock: None,
            active: None,
            cancel: CancelToken::new(),
            consume_cadence: DEFAULT_CONSUME_CADENCE,
            credentials: Credentials::new(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.collector.pending().len()
    }

    pub fn emitted(&self) -> u64 {
        self.collector.emitted()
    }

    pub fn last_metrics(&self) -> Option<&MetricsSnapshot> {
        self.last_metrics.as_ref()
    }

    pub fn stats_snapshot(&self) -> ExecutorStatsSnapshot {
        ExecutorStatsSnapshot {
            emitted: self.collector.emitted(),
            empty_emit_streak: self.empty_emit_streak,
            pending: self.collector.pending().len(),
            acked: self.stats.acked,
            failed: self.stats.failed,
            timed_out: self.stats.timed_out,
            skipped_inactive: self.stats.skipped_inactive,
            skipped_max_pending: self.stats.skipped_max_pending,
            ack_latency_mean_ms: self.stats.ack_latency_ms.mean(),
            ack_latency_samples: self.stats.ack_latency_ms.count(),
        }
    }

    /// Milliseconds since the executor's time origin, snapped once per
    /// iteration.
    fn now_ms(&mut self) -> u64 {
        let snapshot = self.clock.trigger_time();
        snapshot
            .instant
            .saturating_duration_since(self.origin)
            .as_millis() as u64
    }

    fn task_index(&self, task: TaskId) -> Result<usize, ExecutorError> {
        self.task_ids
            .iter()
            .position(|t| *t == task)
            .ok_or_else(|| ExecutorError::Invariant(format!("unknown task id {task}")))
    }

    /// Open every spout. Blocks nothing; `run` calls this after the
    /// first activation.
    pub fn open(&mut self) -> Result<(), ExecutorError> {
        if self.open_called {
            return Ok(());
        }
        info!(component = %self.component, tasks = ?self.task_ids, "opening spout");
        for i in 0..self.spouts.len() {
            if !self.credentials.is_empty() {
                self.spouts[i].set_credentials(&self.credentials);
            }
            let task = self.task_ids[i];
            self.spouts[i]
                .open(&self.conf, &self.contexts[i])
                .map_err(|source| ExecutorError::User {
                    task,
                    during: "open",
                    source,
                })?;
        }
        self.open_called = true;
        info!(component = %self.component, "opened spout");
        Ok(())
    }

    /// Drive the executor until cancellation or a fatal error.
    pub fn run(&mut self) -> Result<(), ExecutorError> {
        while !self.active.load(Ordering::Acquire) {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            thread::sleep(OPEN_POLL);
        }
        self.open()?;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.cycle() {
                Ok(()) => {}
                Err(ExecutorError::Cancelled(_)) => break,
                Err(err) => return Err(err),
            }
        }
        self.shutdown();
        Ok(())
    }

    /// One iteration of the run loop.
    pub fn cycle(&mut self) -> Result<(), ExecutorError> {
        let now_ms = self.now_ms();

        if self.iter == 0 {
            self.drain_receive_queue(now_ms)?;
        }
        self.iter += 1;
        if self.iter >= self.consume_cadence {
            self.iter = 0;
        }

        let curr_emitted = self.collector.emitted();
        let reached_max = self.max_pending > 0 && self.collector.pending().len() >= self.max_pending;
        let is_active = self.active.load(Ordering::Acquire);

        if is_active {
            if !self.last_active {
                self.last_active = true;
                info!(component = %self.component, tasks = ?self.task_ids, "activating spout");
                for i in 0..self.spouts.len() {
                    self.spouts[i].activate();
                }
            }
            if !reached_max {
                // Perf-critical scan: indexed, no iterator.
                for i in 0..self.spouts.len() {
                    let task = self.task_ids[i];
                    let mut out = TaskCollector::new(&mut self.collector, task, now_ms);
                    self.spouts[i]
                        .next_tuple(&mut out)
                        .map_err(|source| ExecutorError::User {
                            task,
                            during: "next_tuple",
                            source,
                        })?;
                    self.deliver_immediate_acks(i)?;
                }
            } else {
                self.stats.skipped_max_pending += 1;
            }
        } else {
            if self.last_active {
                self.last_active = false;
                info!(component = %self.component, tasks = ?self.task_ids, "deactivating spout");
                for i in 0..self.spouts.len() {
                    self.spouts[i].deactivate();
                }
            }
            thread::sleep(INACTIVE_SLEEP);
            self.stats.skipped_inactive += 1;
        }

        if self.collector.emitted() == curr_emitted && is_active {
            self.empty_emit_streak = self.spout_wait.idle(self.empty_emit_streak);
        } else {
            self.empty_emit_streak = 0;
        }
        Ok(())
    }

    /// Ackerless mode: acks queued by the collector during the emit are
    /// delivered right after the owning `next_tuple` returns.
    fn deliver_immediate_acks(&mut self, spout_index: usize) -> Result<(), ExecutorError> {
        self.collector.drain_immediate_acks(&mut self.ack_scratch);
        if self.ack_scratch.is_empty() {
            return Ok(());
        }
        let task = self.task_ids[spout_index];
        let mut result = Ok(());
        for message_id in self.ack_scratch.drain(..) {
            if result.is_err() {
                continue;
            }
            if self.conf.debug {
                debug!(task, message = ?message_id, "acking without acker");
            }
            match self.spouts[spout_index].ack(&message_id) {
                Ok(()) => self.stats.acked += 1,
                Err(source) => {
                    result = Err(ExecutorError::User {
                        task,
                        during: "ack",
                        source,
                    });
                }
            }
        }
        result
    }

    fn drain_receive_queue(&mut self, now_ms: u64) -> Result<(), ExecutorError> {
        let queue = Arc::clone(&self.receive_queue);
        queue.consume(&mut self.inbox);
        if self.inbox.is_empty() {
            return Ok(());
        }
        let mut msgs = std::mem::take(&mut self.inbox);
        let mut result = Ok(());
        for msg in msgs.drain(..) {
            if result.is_ok() {
                result = self.dispatch(msg, now_ms);
            }
        }
        self.inbox = msgs;
        result
    }

    fn dispatch(&mut self, msg: QueueMsg, now_ms: u64) -> Result<(), ExecutorError> {
        match msg {
            QueueMsg::Flush => self.collector.flush(),
            QueueMsg::Tick => self.rotate_pending(now_ms),
            QueueMsg::MetricsTick => {
                self.metrics_tick();
                Ok(())
            }
            QueueMsg::CredsChanged(credentials) => {
                self.credentials = credentials;
                for i in 0..self.spouts.len() {
                    self.spouts[i].set_credentials(&self.credentials);
                }
                Ok(())
            }
            QueueMsg::ResetTimeout(root_id) => {
                // Refresh into the head bucket; the stored info (and its
                // emit timestamp) is reused unchanged.
                if let Some(info) = self.collector.pending_mut().remove(&root_id) {
                    self.collector.pending_mut().put(root_id, info);
                }
                Ok(())
            }
            QueueMsg::Ack(ack) => self.ack_spout_msg(ack),
            QueueMsg::Fail(fail) => self.fail_spout_msg(fail),
            QueueMsg::Interrupt => {
                debug!(component = %self.component, "interrupt received on receive queue");
                self.cancel.cancel();
                Err(Cancelled.into())
            }
            QueueMsg::Tuple(addressed) => {
                trace!(dest = addressed.dest, "spout executor ignoring data tuple");
                Ok(())
            }
        }
    }

    fn ack_spout_msg(&mut self, ack: AckMsg) -> Result<(), ExecutorError> {
        let Some(info) = self.collector.pending_mut().remove(&ack.root_id) else {
            return Ok(());
        };
        let Some(message_id) = info.message_id.clone() else {
            return Ok(());
        };
        if ack.task != info.task_id {
            return Err(ExecutorError::Invariant(format!(
                "mismatched task ids on ack: {} != {}",
                ack.task, info.task_id
            )));
        }
        let time_delta = if info.timestamp_ms != 0 {
            ack.time_delta_ms
        } else {
            None
        };
        if self.conf.debug {
            debug!(root = info.root_id, message = ?message_id, "acking message");
        }
        let index = self.task_index(info.task_id)?;
        self.spouts[index]
            .ack(&message_id)
            .map_err(|source| ExecutorError::User {
                task: info.task_id,
                during: "ack",
                source,
            })?;
        self.stats.acked += 1;
        if let Some(delta) = time_delta {
            self.stats.ack_latency_ms.push(delta as f64);
        }
        Ok(())
    }

    fn fail_spout_msg(&mut self, fail: AckMsg) -> Result<(), ExecutorError> {
        let Some(info) = self.collector.pending_mut().remove(&fail.root_id) else {
            return Ok(());
        };
        let Some(message_id) = info.message_id.clone() else {
            return Ok(());
        };
        if fail.task != info.task_id {
            return Err(ExecutorError::Invariant(format!(
                "mismatched task ids on fail: {} != {}",
                fail.task, info.task_id
            )));
        }
        if self.conf.debug {
            debug!(root = info.root_id, message = ?message_id, reason = %FailReason::FailStream, "failing message");
        }
        let index = self.task_index(info.task_id)?;
        self.spouts[index]
            .fail(&message_id, FailReason::FailStream)
            .map_err(|source| ExecutorError::User {
                task: info.task_id,
                during: "fail",
                source,
            })?;
        self.stats.failed += 1;
        Ok(())
    }

    /// Tick: rotate the pending map and fail every entry that expired.
    fn rotate_pending(&mut self, now_ms: u64) -> Result<(), ExecutorError> {
        let mut expired = self.collector.pending_mut().rotate();
        let mut result = Ok(());
        for (_, info) in expired.drain() {
            if result.is_ok() {
                result = self.fail_expired(info, now_ms);
            }
        }
        self.collector.pending_mut().recycle(expired);
        result
    }

    fn fail_expired(
        &mut self,
        info: TupleInfo<S::MessageId>,
        now_ms: u64,
    ) -> Result<(), ExecutorError> {
        let Some(message_id) = info.message_id else {
            return Ok(());
        };
        if self.conf.debug {
            let elapsed = now_ms.saturating_sub(info.timestamp_ms);
            debug!(root = info.root_id, message = ?message_id, elapsed_ms = elapsed, reason = %FailReason::Timeout, "failing message");
        }
        let index = self.task_index(info.task_id)?;
        self.spouts[index]
            .fail(&message_id, FailReason::Timeout)
            .map_err(|source| ExecutorError::User {
                task: info.task_id,
                during: "fail",
                source,
            })?;
        self.stats.failed += 1;
        self.stats.timed_out += 1;
        Ok(())
    }

    fn metrics_tick(&mut self) {
        let snapshot = MetricsSnapshot {
            wall: self.clock.trigger_time().wall,
            receive_queue: self.receive_queue.state(),
            executor: self.stats_snapshot(),
        };
        debug!(component = %self.component, snapshot = ?snapshot, "metrics tick");
        self.last_metrics = Some(snapshot);
    }

    /// Orderly teardown: deactivate, flush staged output, drain acks
    /// that are already in flight up to a deadline, close queue metrics.
    fn shutdown(&mut self) {
        info!(component = %self.component, pending = self.collector.pending().len(), "shutting down spout");
        if self.last_active {
            self.last_active = false;
            for i in 0..self.spouts.len() {
                self.spouts[i].deactivate();
            }
        }
        if let Err(err) = self.collector.flush() {
            warn!(component = %self.component, error = %err, "flush during shutdown failed");
        }
        let deadline = Instant::now() + SHUTDOWN_ACK_DRAIN;
        while !self.collector.pending().is_empty() && Instant::now() < deadline {
            let now_ms = self.now_ms();
            let queue = Arc::clone(&self.receive_queue);
            let drained = queue.consume(&mut self.inbox);
            let mut msgs = std::mem::take(&mut self.inbox);
            for msg in msgs.drain(..) {
                match msg {
                    QueueMsg::Ack(_) | QueueMsg::Fail(_) => {
                        if let Err(err) = self.dispatch(msg, now_ms) {
                            warn!(component = %self.component, error = %err, "error draining acks during shutdown");
                        }
                    }
                    _ => {}
                }
            }
            self.inbox = msgs;
            if drained == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        self.receive_queue.close_metrics();
        info!(
            component = %self.component,
            acked = self.stats.acked,
            failed = self.stats.failed,
            "spout shut down"
        );
    }
}
