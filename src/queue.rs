//! The bounded queue between executors.
//!
//! One executor thread consumes; any number of peer executors publish
//! through registered [`ProducerHandle`]s. Publishing never drops: a
//! full ring turns into a back-pressure wait governed by the queue's
//! wait strategy, which is how downstream fullness propagates upstream
//! through the topology.

mod producer;

pub use producer::ProducerHandle;

use crate::error::{CancelToken, Cancelled, QueueFull, SingleProducerViolation};
use crate::metrics::{QueueState, RateTracker};
use crate::tuple::QueueMsg;
use crate::wait::WaitStrategy;
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// How many concurrent producers a queue admits.
///
/// `Single` is for point-to-point links where exactly one upstream
/// thread publishes; the restriction is enforced when producer handles
/// are registered, so a second producer is an error rather than a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerKind {
    Single,
    Multi,
}

/// Receives drained items during [`BoundedQueue::consume`].
///
/// `flush` is invoked exactly once per drain that yielded at least one
/// item, after the last `accept`.
pub trait QueueConsumer {
    fn accept(&mut self, msg: QueueMsg);
    fn flush(&mut self);
}

impl QueueConsumer for Vec<QueueMsg> {
    fn accept(&mut self, msg: QueueMsg) {
        self.push(msg);
    }

    fn flush(&mut self) {}
}

pub struct BoundedQueue {
    name: String,
    ring: ArrayQueue<QueueMsg>,
    kind: ProducerKind,
    producer_batch: usize,
    producers: AtomicUsize,
    backpressure_wait: Arc<dyn WaitStrategy>,
    arrivals: RateTracker,
    insert_failures: RateTracker,
    empty_batches: AtomicU64,
}

impl BoundedQueue {
    /// `capacity` is rounded up to a power of two. The effective
    /// producer batch is `max(1, min(batch_size, capacity / 2))` so a
    /// full staged batch can never occupy more than half the ring.
    pub fn new(
        name: impl Into<String>,
        kind: ProducerKind,
        capacity: usize,
        batch_size: usize,
        backpressure_wait: Arc<dyn WaitStrategy>,
    ) -> Arc<Self> {
        let capacity = capacity.next_power_of_two().max(2);
        Arc::new(Self {
            name: name.into(),
            ring: ArrayQueue::new(capacity),
            kind,
            producer_batch: batch_size.min(capacity / 2).max(1),
            producers: AtomicUsize::new(0),
            backpressure_wait,
            arrivals: RateTracker::new(),
            insert_failures: RateTracker::new(),
            empty_batches: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Estimate of the current element count.
    pub fn population(&self) -> usize {
        self.ring.len()
    }

    pub fn producer_batch(&self) -> usize {
        self.producer_batch
    }

    /// Acquire a publish handle. On a `Single` queue the second
    /// registration fails: the single-producer restriction is checked
    /// here, at the only publish entry point, instead of being left as
    /// an unchecked caller obligation.
    pub fn register_producer(
        self: &Arc<Self>,
        cancel: CancelToken,
    ) -> Result<ProducerHandle, SingleProducerViolation> {
        let prev = self.producers.fetch_add(1, Ordering::AcqRel);
        if self.kind == ProducerKind::Single && prev > 0 {
            self.producers.fetch_sub(1, Ordering::AcqRel);
            return Err(SingleProducerViolation(self.name.clone()));
        }
        Ok(ProducerHandle::new(Arc::clone(self), cancel))
    }

    pub(crate) fn deregister_producer(&self) {
        self.producers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Wait-free publish. Full ring is flow control, not an error; the
    /// rejected message comes back to the caller.
    pub fn try_publish(&self, msg: QueueMsg) -> Result<(), QueueFull> {
        match self.ring.push(msg) {
            Ok(()) => {
                self.arrivals.notify(1);
                Ok(())
            }
            Err(msg) => {
                self.insert_failures.notify(1);
                Err(QueueFull(msg))
            }
        }
    }

    /// Wait-free batch publish: accepts a prefix of `batch`, removing
    /// accepted messages from its head, and returns how many were taken.
    pub fn try_publish_batch(&self, batch: &mut std::collections::VecDeque<QueueMsg>) -> usize {
        let mut published = 0;
        while let Some(msg) = batch.pop_front() {
            if let Err(msg) = self.ring.push(msg) {
                batch.push_front(msg);
                break;
            }
            published += 1;
        }
        if published > 0 {
            self.arrivals.notify(published as u64);
        }
        published
    }

    /// Blocking publish: retries under the back-pressure wait strategy
    /// until the message lands or `cancel` trips.
    pub fn publish(&self, mut msg: QueueMsg, cancel: &CancelToken) -> Result<(), Cancelled> {
        let mut idle = 0u64;
        loop {
            match self.ring.push(msg) {
                Ok(()) => {
                    self.arrivals.notify(1);
                    return Ok(());
                }
                Err(rejected) => {
                    msg = rejected;
                    self.insert_failures.notify(1);
                    idle = self.backpressure_wait.idle(idle);
                    if cancel.is_cancelled() {
                        return Err(Cancelled);
                    }
                }
            }
        }
    }

    /// Non-blocking drain by the (sole) consumer. Items arrive at the
    /// handler in FIFO order per producer; `handler.flush()` fires once
    /// if anything was drained. Returns the drained count.
    pub fn consume(&self, handler: &mut impl QueueConsumer) -> usize {
        // Bounded by capacity so producers keeping pace cannot pin the
        // consumer in this loop.
        let mut count = 0;
        for _ in 0..self.ring.capacity() {
            match self.ring.pop() {
                Some(msg) => {
                    handler.accept(msg);
                    count += 1;
                }
                None => break,
            }
        }
        if count > 0 {
            handler.flush();
        } else {
            self.empty_batches.fetch_add(1, Ordering::Relaxed);
        }
        count
    }

    /// Best-effort shutdown wakeup: publishes the interrupt sentinel so
    /// the consumer observes teardown, then closes the metric trackers.
    pub fn halt_with_interrupt(&self) {
        let _ = self.ring.push(QueueMsg::Interrupt);
        self.close_metrics();
    }

    pub fn close_metrics(&self) {
        self.arrivals.close();
        self.insert_failures.close();
    }

    pub(crate) fn backpressure_wait(&self) -> &dyn WaitStrategy {
        &*self.backpressure_wait
    }

    pub(crate) fn note_insert_failure(&self) {
        self.insert_failures.notify(1);
    }

    /// Lifetime count of rejected publish attempts.
    pub fn insert_failure_total(&self) -> u64 {
        self.insert_failures.total()
    }

    /// Lifetime count of zero-item consume passes.
    pub fn empty_batch_total(&self) -> u64 {
        self.empty_batches.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> QueueState {
        let capacity = self.capacity();
        let population = self.population();
        let arrival_rate = self.arrivals.rate_per_sec();
        QueueState {
            name: self.name.clone(),
            capacity,
            population,
            pct_full: population as f64 / capacity as f64,
            arrival_rate_secs: arrival_rate,
            sojourn_time_ms: population as f64 / arrival_rate.max(1e-5) * 1_000.0,
            insert_failure_rate_secs: self.insert_failures.rate_per_sec(),
            empty_batches: self.empty_batch_total(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::AckMsg;
    use crate::wait::WaitStrategyConfig;
    use std::thread;
    use std::time::Duration;

    fn queue(kind: ProducerKind, capacity: usize, batch: usize) -> Arc<BoundedQueue> {
        BoundedQueue::new(
            "test",
            kind,
            capacity,
            batch,
            WaitStrategyConfig::NoOp.build(),
        )
    }

    fn ack(root_id: u64) -> QueueMsg {
        QueueMsg::Ack(AckMsg {
            task: 0,
            root_id,
            time_delta_ms: None,
        })
    }

    fn root_of(msg: &QueueMsg) -> u64 {
        msg.as_ack().expect("ack msg").root_id
    }

    struct Recording {
        seen: Vec<QueueMsg>,
        flushes: usize,
    }

    impl QueueConsumer for Recording {
        fn accept(&mut self, msg: QueueMsg) {
            self.seen.push(msg);
        }

        fn flush(&mut self) {
            self.flushes += 1;
        }
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let q = queue(ProducerKind::Multi, 100, 1);
        assert_eq!(q.capacity(), 128);
        assert_eq!(q.producer_batch(), 1);
    }

    #[test]
    fn producer_batch_clamped_to_half_capacity() {
        let q = queue(ProducerKind::Multi, 8, 100);
        assert_eq!(q.producer_batch(), 4);
        let q = queue(ProducerKind::Multi, 8, 0);
        assert_eq!(q.producer_batch(), 1);
    }

    #[test]
    fn try_publish_full_returns_message() {
        let q = queue(ProducerKind::Multi, 2, 1);
        assert!(q.try_publish(ack(1)).is_ok());
        assert!(q.try_publish(ack(2)).is_ok());
        let QueueFull(msg) = q.try_publish(ack(3)).unwrap_err();
        assert_eq!(root_of(&msg), 3);
        assert_eq!(q.insert_failure_total(), 1);
        assert_eq!(q.population(), 2);
    }

    #[test]
    fn consume_preserves_fifo_and_flushes_once() {
        let q = queue(ProducerKind::Multi, 8, 1);
        for i in 0..5 {
            q.try_publish(ack(i)).unwrap();
        }
        let mut rec = Recording {
            seen: Vec::new(),
            flushes: 0,
        };
        assert_eq!(q.consume(&mut rec), 5);
        let order: Vec<u64> = rec.seen.iter().map(root_of).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(rec.flushes, 1);
    }

    #[test]
    fn empty_consume_counts_and_does_not_flush() {
        let q = queue(ProducerKind::Multi, 8, 1);
        let mut rec = Recording {
            seen: Vec::new(),
            flushes: 0,
        };
        assert_eq!(q.consume(&mut rec), 0);
        assert_eq!(rec.flushes, 0);
        assert_eq!(q.empty_batch_total(), 1);
    }

    #[test]
    fn batch_publish_accepts_prefix() {
        let q = queue(ProducerKind::Multi, 4, 2);
        q.try_publish(ack(100)).unwrap();
        q.try_publish(ack(101)).unwrap();
        let mut batch: std::collections::VecDeque<QueueMsg> =
            (0..4u64).map(ack).collect();
        // Only two slots free: the prefix goes in, the rest stays.
        assert_eq!(q.try_publish_batch(&mut batch), 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(root_of(batch.front().unwrap()), 2);
    }

    #[test]
    fn single_queue_rejects_second_producer() {
        let q = queue(ProducerKind::Single, 8, 1);
        let first = q.register_producer(CancelToken::new()).unwrap();
        assert!(q.register_producer(CancelToken::new()).is_err());
        // Dropping the only producer frees the slot.
        drop(first);
        assert!(q.register_producer(CancelToken::new()).is_ok());
    }

    #[test]
    fn multi_queue_allows_many_producers() {
        let q = queue(ProducerKind::Multi, 8, 1);
        let _a = q.register_producer(CancelToken::new()).unwrap();
        let _b = q.register_producer(CancelToken::new()).unwrap();
    }

    #[test]
    fn blocking_publish_unblocks_when_slot_frees() {
        let q = queue(ProducerKind::Multi, 2, 1);
        q.try_publish(ack(0)).unwrap();
        q.try_publish(ack(1)).unwrap();
        thread::scope(|s| {
            let publisher = s.spawn(|| q.publish(ack(2), &CancelToken::new()));
            thread::sleep(Duration::from_millis(20));
            assert!(!publisher.is_finished());
            let mut sink: Vec<QueueMsg> = Vec::new();
            q.consume(&mut sink);
            publisher.join().unwrap().unwrap();
        });
        assert!(q.insert_failure_total() >= 1);
    }

    #[test]
    fn blocking_publish_observes_cancellation() {
        let q = queue(ProducerKind::Multi, 2, 1);
        q.try_publish(ack(0)).unwrap();
        q.try_publish(ack(1)).unwrap();
        let cancel = CancelToken::new();
        thread::scope(|s| {
            let publisher = s.spawn(|| q.publish(ack(2), &cancel));
            thread::sleep(Duration::from_millis(10));
            cancel.cancel();
            assert_eq!(publisher.join().unwrap(), Err(Cancelled));
        });
    }

    #[test]
    fn halt_publishes_interrupt_sentinel() {
        let q = queue(ProducerKind::Multi, 8, 1);
        q.halt_with_interrupt();
        let mut sink: Vec<QueueMsg> = Vec::new();
        q.consume(&mut sink);
        assert_eq!(sink.len(), 1);
        assert!(sink[0].is_interrupt());
    }

    #[test]
    fn per_producer_fifo_under_contention() {
        let q = queue(ProducerKind::Multi, 64, 1);
        const PER_PRODUCER: u64 = 500;
        let drained = thread::scope(|s| {
            for producer in 0..3u64 {
                let q = &q;
                s.spawn(move || {
                    let cancel = CancelToken::new();
                    for i in 0..PER_PRODUCER {
                        q.publish(ack(producer * 10_000 + i), &cancel).unwrap();
                    }
                });
            }
            let mut drained: Vec<u64> = Vec::new();
            while drained.len() < 3 * PER_PRODUCER as usize {
                let mut sink: Vec<QueueMsg> = Vec::new();
                q.consume(&mut sink);
                drained.extend(sink.iter().map(root_of));
            }
            drained
        });
        // Nothing lost, and each producer's sequence stays in order.
        assert_eq!(drained.len(), 3 * PER_PRODUCER as usize);
        for producer in 0..3u64 {
            let seq: Vec<u64> = drained
                .iter()
                .filter(|id| **id / 10_000 == producer)
                .map(|id| id % 10_000)
                .collect();
            let expected: Vec<u64> = (0..PER_PRODUCER).collect();
            assert_eq!(seq, expected);
        }
    }

    #[test]
    fn state_snapshot_reflects_population() {
        let q = queue(ProducerKind::Multi, 8, 1);
        q.try_publish(ack(1)).unwrap();
        q.try_publish(ack(2)).unwrap();
        let state = q.state();
        assert_eq!(state.capacity, 8);
        assert_eq!(state.population, 2);
        assert!((state.pct_full - 0.25).abs() < f64::EPSILON);
        assert!(state.arrival_rate_secs > 0.0);
        assert!(state.sojourn_time_ms > 0.0);
    }
}
