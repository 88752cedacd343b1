//! Per-CPU deadline runqueue storage.
//!
//! Two ordered maps keyed by `(absolute deadline, insertion sequence)`: the
//! tree of every queued entity and the subset that may be pushed elsewhere.
//! The sequence number makes equal deadlines FIFO.

use std::collections::BTreeMap;

use crate::bandwidth::RqBandwidth;
use crate::types::TaskId;

/// Cached deadlines used by the balancer without walking the trees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EarliestDl {
    /// Earliest queued deadline.
    pub curr: Option<u64>,
    /// Earliest pushable deadline (the running task is never pushable).
    pub next: Option<u64>,
}

/// Deadline runqueue of one CPU.
#[derive(Debug, Default)]
pub struct DlRunqueue {
    tree: BTreeMap<(u64, u64), TaskId>,
    pushable: BTreeMap<(u64, u64), TaskId>,
    seq: u64,
    pub(crate) earliest: EarliestDl,
    pub(crate) overloaded: bool,
    pub(crate) bw: RqBandwidth,
}

impl DlRunqueue {
    /// Number of queued (not throttled) entities.
    #[must_use]
    pub fn nr_running(&self) -> usize {
        self.tree.len()
    }

    /// Cached deadlines.
    #[must_use]
    pub const fn earliest(&self) -> EarliestDl {
        self.earliest
    }

    /// Bandwidth counters.
    #[must_use]
    pub const fn bandwidth(&self) -> RqBandwidth {
        self.bw
    }

    /// Whether any entity could run elsewhere.
    #[must_use]
    pub fn has_pushable(&self) -> bool {
        !self.pushable.is_empty()
    }

    fn next_key(&mut self, deadline: u64) -> (u64, u64) {
        self.seq = self.seq.wrapping_add(1);
        (deadline, self.seq)
    }

    /// Insert into the tree and return the key.
    pub fn insert(&mut self, task: TaskId, deadline: u64) -> (u64, u64) {
        let key = self.next_key(deadline);
        self.tree.insert(key, task);
        self.refresh_earliest();
        key
    }

    /// Remove a tree entry.
    pub fn remove(&mut self, key: (u64, u64)) -> bool {
        let removed = self.tree.remove(&key).is_some();
        self.refresh_earliest();
        removed
    }

    /// Insert into the pushable subset and return the key.
    pub fn insert_pushable(&mut self, task: TaskId, deadline: u64) -> (u64, u64) {
        let key = self.next_key(deadline);
        self.pushable.insert(key, task);
        self.refresh_earliest();
        key
    }

    /// Remove a pushable entry.
    pub fn remove_pushable(&mut self, key: (u64, u64)) -> bool {
        let removed = self.pushable.remove(&key).is_some();
        self.refresh_earliest();
        removed
    }

    /// Earliest queued entity.
    #[must_use]
    pub fn leftmost(&self) -> Option<TaskId> {
        self.tree.first_key_value().map(|(_, task)| *task)
    }

    /// Whether `key` is the earliest queued entry.
    #[must_use]
    pub fn is_leftmost(&self, key: (u64, u64)) -> bool {
        self.tree.first_key_value().is_some_and(|(k, _)| *k == key)
    }

    /// Pushable entities in deadline order.
    pub fn pushable(&self) -> impl Iterator<Item = (u64, TaskId)> + '_ {
        self.pushable.iter().map(|((dl, _), task)| (*dl, *task))
    }

    /// Queued entities in deadline order.
    pub fn queued(&self) -> impl Iterator<Item = (u64, TaskId)> + '_ {
        self.tree.iter().map(|((dl, _), task)| (*dl, *task))
    }

    fn refresh_earliest(&mut self) {
        self.earliest = EarliestDl {
            curr: self.tree.first_key_value().map(|((dl, _), _)| *dl),
            next: self.pushable.first_key_value().map(|((dl, _), _)| *dl),
        };
    }
}
