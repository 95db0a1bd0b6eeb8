//! Routing emitted tuples out of an executor.
//!
//! Local destinations get the tuple published into their receive queue
//! through a cached producer handle; remote destinations get the tuple
//! serialized once and staged per task until the batch threshold trips
//! a bulk hand-off to the worker's remote sender.

use crate::error::{CancelToken, ExecutorError, QueueFull};
use crate::queue::ProducerHandle;
use crate::tuple::{AddressedTuple, QueueMsg, TaskId};
use crate::worker::{TaskMessage, TupleSerializer, WorkerHandle};
use ahash::AHashMap;
use std::sync::Arc;
use tracing::debug;

pub struct ExecutorTransfer {
    worker: Arc<dyn WorkerHandle>,
    serializer: Arc<dyn TupleSerializer>,
    cancel: CancelToken,
    /// Producer handle per local destination, resolved on first use.
    outbound: AHashMap<TaskId, ProducerHandle>,
    /// Serialized tuples staged per remote destination.
    remote: AHashMap<TaskId, Vec<TaskMessage>>,
    curr_batch: usize,
    producer_batch: usize,
    debug: bool,
}

impl ExecutorTransfer {
    pub fn new(
        worker: Arc<dyn WorkerHandle>,
        serializer: Arc<dyn TupleSerializer>,
        producer_batch: usize,
        debug: bool,
        cancel: CancelToken,
    ) -> Self {
        Self {
            worker,
            serializer,
            cancel,
            outbound: AHashMap::new(),
            remote: AHashMap::new(),
            curr_batch: 0,
            producer_batch: producer_batch.max(1),
            debug,
        }
    }

    pub fn transfer(&mut self, addressed: AddressedTuple) -> Result<(), ExecutorError> {
        if self.debug {
            debug!(dest = addressed.dest, tuple = ?addressed.tuple, "transferring tuple");
        }
        if self.worker.is_local(addressed.dest) {
            return self.transfer_local(addressed);
        }
        let payload = self.serializer.serialize(&addressed.tuple);
        self.remote
            .entry(addressed.dest)
            .or_default()
            .push(TaskMessage {
                task: addressed.dest,
                payload,
            });
        self.curr_batch += 1;
        if self.curr_batch >= self.producer_batch {
            self.flush_remotes();
        }
        Ok(())
    }

    /// Blocking publish into the destination's receive queue; honors
    /// back-pressure and propagates cancellation. A full destination
    /// ring means this call is about to park, so all staged output
    /// (local batches and the remote map) is flushed first instead of
    /// sitting behind the wait.
    pub fn transfer_local(&mut self, addressed: AddressedTuple) -> Result<(), ExecutorError> {
        let dest = addressed.dest;
        if !self.outbound.contains_key(&dest) {
            let queue = self.worker.local_queue(dest).ok_or_else(|| {
                ExecutorError::Invariant(format!("no local receive queue for task {dest}"))
            })?;
            let handle = queue
                .register_producer(self.cancel.clone())
                .map_err(|e| ExecutorError::Invariant(e.to_string()))?;
            self.outbound.insert(dest, handle);
        }
        let handle = self.outbound.get_mut(&dest).expect("resolved above");
        let msg = match handle.try_publish(QueueMsg::Tuple(addressed)) {
            Ok(()) => return Ok(()),
            Err(QueueFull(msg)) => msg,
        };
        self.flush_remotes();
        self.flush_local()?;
        let handle = self.outbound.get_mut(&dest).expect("resolved above");
        handle.publish(msg)?;
        Ok(())
    }

    /// Flush every cached local producer handle.
    pub fn flush_local(&mut self) -> Result<(), ExecutorError> {
        for handle in self.outbound.values_mut() {
            handle.flush()?;
        }
        Ok(())
    }

    /// Hand the staged remote batches to the worker and reset the
    /// batch counter.
    pub fn flush_remotes(&mut self) {
        if !self.remote.is_empty() {
            self.worker.send_remote(&mut self.remote);
            self.remote.clear();
        }
        self.curr_batch = 0;
    }

    pub fn flush(&mut self) -> Result<(), ExecutorError> {
        self.flush_local()?;
        self.flush_remotes();
        Ok(())
    }
}
