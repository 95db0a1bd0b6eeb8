//! Turning user `emit` calls into routed tuples.
//!
//! The collector owns exactly the state the emit path needs — the
//! pending map, the emitted counter, the transfer, and the stream
//! router — all mutated only by the executor thread. A [`TaskCollector`]
//! is the thin per-task view handed to `Spout::next_tuple`, binding the
//! emitting task id and the iteration's time snapshot.

use crate::error::ExecutorError;
use crate::executor::transfer::ExecutorTransfer;
use crate::grouping::StreamRouter;
use crate::rotating::RotatingMap;
use crate::tuple::{streams, AddressedTuple, TaskId, Tuple, TupleInfo, Value};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use tracing::{debug, error};

pub struct OutputCollector<M> {
    pending: RotatingMap<u64, TupleInfo<M>>,
    emitted: u64,
    transfer: ExecutorTransfer,
    router: StreamRouter,
    acker_tasks: Vec<TaskId>,
    rng: SmallRng,
    /// Message ids awaiting the immediate ack of ackerless mode; the
    /// executor drains this right after the emitting `next_tuple` call.
    immediate_acks: Vec<M>,
    /// Scratch for grouping selection; reused across emits.
    dests: Vec<TaskId>,
    reported_errors: u64,
    debug: bool,
}

impl<M: Clone + fmt::Debug> OutputCollector<M> {
    pub(crate) fn new(
        transfer: ExecutorTransfer,
        router: StreamRouter,
        acker_tasks: Vec<TaskId>,
        pending_buckets: usize,
        debug: bool,
    ) -> Self {
        Self {
            pending: RotatingMap::new(pending_buckets),
            emitted: 0,
            transfer,
            router,
            acker_tasks,
            rng: SmallRng::from_entropy(),
            immediate_acks: Vec::new(),
            dests: Vec::new(),
            reported_errors: 0,
            debug,
        }
    }

    /// Monotone count of `emit`/`emit_direct` calls.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn pending(&self) -> &RotatingMap<u64, TupleInfo<M>> {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut RotatingMap<u64, TupleInfo<M>> {
        &mut self.pending
    }

    pub fn reported_errors(&self) -> u64 {
        self.reported_errors
    }

    /// Flush staged output: local producer batches and the remote map.
    pub fn flush(&mut self) -> Result<(), ExecutorError> {
        self.transfer.flush()
    }

    pub(crate) fn drain_immediate_acks(&mut self, out: &mut Vec<M>) {
        out.append(&mut self.immediate_acks);
    }

    fn next_root(&mut self) -> u64 {
        loop {
            let id: u64 = self.rng.gen();
            if id != 0 {
                return id;
            }
        }
    }

    fn emit_from(
        &mut self,
        task: TaskId,
        now_ms: u64,
        stream: &str,
        values: Vec<Value>,
        message_id: Option<M>,
    ) -> Result<Vec<TaskId>, ExecutorError> {
        let mut dests = std::mem::take(&mut self.dests);
        let routed = self
            .router
            .select(stream, &values, &mut dests)
            .map_err(|e| ExecutorError::Invariant(e.to_string()));
        if let Err(e) = routed {
            self.dests = dests;
            return Err(e);
        }
        let result = self.send(task, now_ms, &dests, stream, values, message_id);
        let out = dests.clone();
        self.dests = dests;
        result.map(|()| out)
    }

    fn emit_direct_from(
        &mut self,
        task: TaskId,
        now_ms: u64,
        dest: TaskId,
        stream: &str,
        values: Vec<Value>,
        message_id: Option<M>,
    ) -> Result<(), ExecutorError> {
        self.send(task, now_ms, &[dest], stream, values, message_id)
    }

    fn send(
        &mut self,
        task: TaskId,
        now_ms: u64,
        dests: &[TaskId],
        stream: &str,
        values: Vec<Value>,
        message_id: Option<M>,
    ) -> Result<(), ExecutorError> {
        let mut tuple = Tuple::new(task, stream, values);
        if message_id.is_some() && !self.acker_tasks.is_empty() {
            let root = self.next_root();
            tuple.anchor = Some(root);
            self.pending.put(root, TupleInfo {
                root_id: root,
                message_id,
                task_id: task,
                stream: stream.to_owned(),
                timestamp_ms: now_ms,
            });
            if self.debug {
                debug!(root, task, stream, "emitting anchored tuple");
            }
            // One edge id per destination; the acker starts the tree
            // checksum from their xor.
            let mut checksum = 0u64;
            for _ in dests {
                checksum ^= self.next_root();
            }
            let acker = self.acker_tasks[(root % self.acker_tasks.len() as u64) as usize];
            let init = Tuple::new(task, streams::ACK_INIT, vec![
                Value::Int(root as i64),
                Value::Int(checksum as i64),
                Value::Int(task as i64),
            ]);
            self.transfer.transfer(AddressedTuple {
                dest: acker,
                tuple: init,
            })?;
        } else if let Some(message_id) = message_id {
            // No acker in the topology: best-effort at-most-once mode,
            // the ack is delivered as soon as next_tuple returns.
            self.immediate_acks.push(message_id);
        }
        for &dest in dests {
            self.transfer.transfer(AddressedTuple {
                dest,
                tuple: tuple.clone(),
            })?;
        }
        self.emitted += 1;
        Ok(())
    }
}

/// Per-task emit surface handed to `Spout::next_tuple`.
pub struct TaskCollector<'a, M> {
    collector: &'a mut OutputCollector<M>,
    task: TaskId,
    now_ms: u64,
}

impl<'a, M: Clone + fmt::Debug> TaskCollector<'a, M> {
    pub(crate) fn new(collector: &'a mut OutputCollector<M>, task: TaskId, now_ms: u64) -> Self {
        Self {
            collector,
            task,
            now_ms,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// Emit to every task the stream's grouping selects; returns the
    /// destination task ids. A `message_id` opts the tuple into ack
    /// tracking.
    pub fn emit(
        &mut self,
        stream: &str,
        values: Vec<Value>,
        message_id: Option<M>,
    ) -> Result<Vec<TaskId>, ExecutorError> {
        self.collector
            .emit_from(self.task, self.now_ms, stream, values, message_id)
    }

    /// Emit to one explicit task, bypassing the grouping.
    pub fn emit_direct(
        &mut self,
        dest: TaskId,
        stream: &str,
        values: Vec<Value>,
        message_id: Option<M>,
    ) -> Result<(), ExecutorError> {
        self.collector
            .emit_direct_from(self.task, self.now_ms, dest, stream, values, message_id)
    }

    /// Surface a non-fatal spout-side error without unwinding the loop.
    pub fn report_error(&mut self, err: &anyhow::Error) {
        self.collector.reported_errors += 1;
        error!(task = self.task, error = %err, "spout reported error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CancelToken;
    use crate::grouping::Grouping;
    use crate::queue::{BoundedQueue, ProducerKind};
    use crate::tuple::QueueMsg;
    use crate::wait::WaitStrategyConfig;
    use crate::worker::{DebugSerializer, InProcessWorker, WorkerHandle};
    use std::sync::Arc;

    struct Fixture {
        collector: OutputCollector<u64>,
        downstream: Arc<BoundedQueue>,
        acker: Arc<BoundedQueue>,
    }

    fn fixture(with_ackers: bool) -> Fixture {
        let worker = Arc::new(InProcessWorker::new());
        let mk = |name: &str| {
            BoundedQueue::new(
                name,
                ProducerKind::Multi,
                64,
                1,
                WaitStrategyConfig::NoOp.build(),
            )
        };
        let downstream = mk("task-20");
        let acker = mk("task-30");
        worker.register_task(20, downstream.clone());
        worker.register_task(30, acker.clone());
        let transfer = ExecutorTransfer::new(
            worker as Arc<dyn WorkerHandle>,
            Arc::new(DebugSerializer),
            1,
            false,
            CancelToken::new(),
        );
        let mut router = StreamRouter::new();
        router.declare("default", Grouping::Shuffle { targets: vec![20] });
        let acker_tasks = if with_ackers { vec![30] } else { Vec::new() };
        Fixture {
            collector: OutputCollector::new(transfer, router, acker_tasks, 2, false),
            downstream,
            acker,
        }
    }

    fn drain(queue: &BoundedQueue) -> Vec<QueueMsg> {
        let mut sink: Vec<QueueMsg> = Vec::new();
        queue.consume(&mut sink);
        sink
    }

    #[test]
    fn unanchored_emit_never_enters_pending() {
        let mut fx = fixture(true);
        let dests = {
            let mut out = TaskCollector::new(&mut fx.collector, 7, 5);
            out.emit("default", vec![Value::Int(1)], None).unwrap()
        };
        assert_eq!(dests, vec![20]);
        assert_eq!(fx.collector.emitted(), 1);
        assert!(fx.collector.pending().is_empty());
        // The routed tuple is unanchored and no acker-init was sent.
        let msgs = drain(&fx.downstream);
        assert_eq!(msgs[0].as_tuple().unwrap().tuple.anchor, None);
        assert!(drain(&fx.acker).is_empty());
    }

    #[test]
    fn anchored_emit_tracks_pending_and_notifies_acker() {
        let mut fx = fixture(true);
        TaskCollector::new(&mut fx.collector, 7, 123)
            .emit("default", vec![Value::Int(1)], Some(41))
            .unwrap();
        assert_eq!(fx.collector.pending().len(), 1);
        let root = *fx.collector.pending().keys().next().unwrap();
        let info = fx.collector.pending().get(&root).unwrap();
        assert_eq!(info.message_id, Some(41));
        assert_eq!(info.task_id, 7);
        assert_eq!(info.timestamp_ms, 123);
        // Data tuple carries the root anchor.
        let msgs = drain(&fx.downstream);
        assert_eq!(msgs[0].as_tuple().unwrap().tuple.anchor, Some(root));
        // Bookkeeping tuple went to the acker with (root, checksum, task).
        let init = drain(&fx.acker);
        let init = init[0].as_tuple().unwrap();
        assert_eq!(init.tuple.stream, streams::ACK_INIT);
        assert_eq!(init.tuple.values[0], Value::Int(root as i64));
        assert_eq!(init.tuple.values[2], Value::Int(7));
    }

    #[test]
    fn no_ackers_queues_immediate_ack() {
        let mut fx = fixture(false);
        TaskCollector::new(&mut fx.collector, 7, 0)
            .emit("default", vec![Value::Int(1)], Some(99))
            .unwrap();
        assert!(fx.collector.pending().is_empty());
        let mut acks = Vec::new();
        fx.collector.drain_immediate_acks(&mut acks);
        assert_eq!(acks, vec![99]);
        // Drained once; a second drain yields nothing.
        fx.collector.drain_immediate_acks(&mut acks);
        assert_eq!(acks.len(), 1);
    }

    #[test]
    fn emit_direct_bypasses_grouping() {
        let mut fx = fixture(true);
        TaskCollector::new(&mut fx.collector, 7, 0)
            .emit_direct(30, "default", vec![Value::Int(8)], None)
            .unwrap();
        let msgs = drain(&fx.acker);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].as_tuple().unwrap().dest, 30);
        assert!(drain(&fx.downstream).is_empty());
    }

    #[test]
    fn unknown_stream_is_rejected() {
        let mut fx = fixture(true);
        let err = TaskCollector::new(&mut fx.collector, 7, 0)
            .emit("mystery", vec![], None)
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Invariant(_)));
        assert_eq!(fx.collector.emitted(), 0);
    }

    #[test]
    fn report_error_is_counted_not_fatal() {
        let mut fx = fixture(true);
        let mut out = TaskCollector::new(&mut fx.collector, 7, 0);
        out.report_error(&anyhow::anyhow!("source unavailable"));
        drop(out);
        assert_eq!(fx.collector.reported_errors(), 1);
    }

    #[test]
    fn root_ids_are_unique_and_nonzero() {
        let mut fx = fixture(true);
        for i in 0..50 {
            TaskCollector::new(&mut fx.collector, 7, 1)
                .emit("default", vec![Value::Int(i)], Some(i as u64))
                .unwrap();
        }
        assert_eq!(fx.collector.pending().len(), 50);
        assert!(fx.collector.pending().keys().all(|root| *root != 0));
    }
}
