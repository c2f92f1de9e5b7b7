//! Ready queue
//!
//! Ordered by effective priority (highest first), then requests that can
//! run straight away before semaphore waiters, then submission sequence.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, HashMap};

use crate::types::{Priority, RequestId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct QueueKey {
    pub priority: Priority,
    pub semaphore: bool,
    pub seq: u64,
    pub id: RequestId,
}

impl QueueKey {
    fn sort_key(&self) -> (Reverse<Priority>, bool, u64, RequestId) {
        (Reverse(self.priority), self.semaphore, self.seq, self.id)
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    ordered: BTreeSet<QueueKey>,
    keys: HashMap<RequestId, QueueKey>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: QueueKey) {
        if let Some(old) = self.keys.insert(key.id, key) {
            self.ordered.remove(&old);
        }
        self.ordered.insert(key);
    }

    pub fn remove(&mut self, id: RequestId) -> Option<QueueKey> {
        let key = self.keys.remove(&id)?;
        self.ordered.remove(&key);
        Some(key)
    }

    pub fn peek(&self) -> Option<QueueKey> {
        self.ordered.first().copied()
    }

    pub fn pop(&mut self) -> Option<QueueKey> {
        let key = self.ordered.pop_first()?;
        self.keys.remove(&key.id);
        Some(key)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.keys.contains_key(&id)
    }
}
