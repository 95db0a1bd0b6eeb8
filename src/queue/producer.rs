//! Per-producer staging into a [`BoundedQueue`](super::BoundedQueue).
//!
//! Each producing executor registers one handle per destination queue
//! at setup and keeps the staging batch inside it, which amortises the
//! arrival-rate notification and the CAS traffic on the ring. With a
//! producer batch of 1 the handle inserts directly and staging is
//! bypassed entirely.

use super::BoundedQueue;
use crate::error::{CancelToken, Cancelled, QueueFull};
use crate::tuple::QueueMsg;
use std::collections::VecDeque;
use std::sync::Arc;

pub struct ProducerHandle {
    queue: Arc<BoundedQueue>,
    batch: VecDeque<QueueMsg>,
    batch_cap: usize,
    cancel: CancelToken,
}

impl ProducerHandle {
    pub(super) fn new(queue: Arc<BoundedQueue>, cancel: CancelToken) -> Self {
        let batch_cap = queue.producer_batch();
        Self {
            queue,
            batch: VecDeque::with_capacity(if batch_cap > 1 { batch_cap + 1 } else { 0 }),
            batch_cap,
            cancel,
        }
    }

    pub fn queue(&self) -> &Arc<BoundedQueue> {
        &self.queue
    }

    /// Messages staged but not yet published.
    pub fn staged(&self) -> usize {
        self.batch.len()
    }

    /// Blocking publish. Stages into the batch and flushes once the
    /// batch is full; honors back-pressure and cancellation.
    pub fn publish(&mut self, msg: QueueMsg) -> Result<(), Cancelled> {
        if self.batch_cap <= 1 {
            return self.queue.publish(msg, &self.cancel);
        }
        self.batch.push_back(msg);
        if self.batch.len() >= self.batch_cap {
            self.flush()?;
        }
        Ok(())
    }

    /// Non-blocking publish; a full ring (and a full staged batch)
    /// hands the message back so the caller can decide whether to
    /// flush, block, or drop.
    pub fn try_publish(&mut self, msg: QueueMsg) -> Result<(), QueueFull> {
        if self.batch_cap <= 1 {
            return self.queue.try_publish(msg);
        }
        if self.batch.len() >= self.batch_cap && !self.try_flush() {
            return Err(QueueFull(msg));
        }
        self.batch.push_back(msg);
        Ok(())
    }

    /// Blocking flush: does not return until at least one staged
    /// message was drained into the ring or cancellation trips. The
    /// accepted prefix is removed; a partial flush leaves the rest
    /// staged for the next call.
    pub fn flush(&mut self) -> Result<(), Cancelled> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let mut idle = 0u64;
        loop {
            if self.queue.try_publish_batch(&mut self.batch) > 0 {
                return Ok(());
            }
            self.queue.note_insert_failure();
            idle = self.queue.backpressure_wait().idle(idle);
            if self.cancel.is_cancelled() {
                return Err(Cancelled);
            }
        }
    }

    /// Non-blocking flush: true if the batch was empty or at least one
    /// message was drained.
    pub fn try_flush(&mut self) -> bool {
        if self.batch.is_empty() {
            return true;
        }
        if self.queue.try_publish_batch(&mut self.batch) == 0 {
            self.queue.note_insert_failure();
            return false;
        }
        true
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.queue.deregister_producer();
    }
}
