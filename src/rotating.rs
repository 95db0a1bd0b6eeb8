//! Bucketed TTL map for pending acknowledgements.
//!
//! A fixed ring of hash maps stands in for per-entry timers: each
//! `rotate()` retires the oldest bucket wholesale. An entry written at
//! tick `i` therefore expires at or before tick `i + num_buckets`
//! unless it was removed or refreshed first.

use ahash::AHashMap;
use std::collections::VecDeque;
use std::hash::Hash;

pub const DEFAULT_BUCKETS: usize = 2;

/// Owned by the executor thread; never shared.
pub struct RotatingMap<K, V> {
    /// Head bucket at the front, oldest at the back.
    buckets: VecDeque<AHashMap<K, V>>,
    /// Cleared bucket kept for reuse so steady-state ticks do not
    /// allocate.
    spare: Option<AHashMap<K, V>>,
}

impl<K: Eq + Hash, V> RotatingMap<K, V> {
    pub fn new(num_buckets: usize) -> Self {
        let num_buckets = num_buckets.max(1);
        let mut buckets = VecDeque::with_capacity(num_buckets + 1);
        for _ in 0..num_buckets {
            buckets.push_back(AHashMap::new());
        }
        Self {
            buckets,
            spare: None,
        }
    }

    /// Insert into the head bucket, clearing any older entry for the
    /// same key first. Re-putting an existing entry is how a timeout is
    /// extended: the entry moves back to the freshest bucket.
    pub fn put(&mut self, key: K, value: V) {
        for bucket in self.buckets.iter_mut().skip(1) {
            bucket.remove(&key);
        }
        self.buckets[0].insert(key, value);
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.buckets.iter().find_map(|bucket| bucket.get(key))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.buckets.iter().any(|bucket| bucket.contains_key(key))
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.buckets
            .iter_mut()
            .find_map(|bucket| bucket.remove(key))
    }

    /// Advance one tick: a fresh head bucket is pushed and the oldest
    /// bucket is handed to the caller, which owns expiring its entries.
    /// Hand the drained map back via [`recycle`](Self::recycle).
    #[must_use]
    pub fn rotate(&mut self) -> AHashMap<K, V> {
        let expired = self.buckets.pop_back().expect("at least one bucket");
        self.buckets
            .push_front(self.spare.take().unwrap_or_default());
        expired
    }

    /// Return a drained bucket so its allocation is reused by the next
    /// rotation.
    pub fn recycle(&mut self, mut bucket: AHashMap<K, V>) {
        bucket.clear();
        self.spare = Some(bucket);
    }

    /// All live keys, newest bucket first.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.buckets.iter().flat_map(|bucket| bucket.keys())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }
}
