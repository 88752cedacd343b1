//! Per-CPU fixed-priority runqueue storage.
//!
//! One FIFO list per priority level plus a two-word presence bitmap, so the
//! highest non-empty level is found with two `trailing_zeros` calls.

use std::collections::{BTreeSet, VecDeque};

use crate::types::{MAX_RT_PRIO, TaskId};

/// Number of fixed-priority levels.
pub const RT_LEVELS: usize = 100;

/// Cached priorities used by the balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighestPrio {
    /// Highest queued priority, `MAX_RT_PRIO` when empty.
    pub curr: i32,
    /// Highest pushable priority, `MAX_RT_PRIO` when none.
    pub next: i32,
}

impl Default for HighestPrio {
    fn default() -> Self {
        Self {
            curr: MAX_RT_PRIO,
            next: MAX_RT_PRIO,
        }
    }
}

/// Fixed-priority runqueue of one CPU.
#[derive(Debug)]
pub struct RtRunqueue {
    queues: [VecDeque<TaskId>; RT_LEVELS],
    bitmap: [u64; 2],
    pushable: BTreeSet<(i32, u64, TaskId)>,
    seq: u64,
    nr_running: usize,
    pub(crate) highest_prio: HighestPrio,
    pub(crate) overloaded: bool,
    pub(crate) throttled: bool,
}

impl Default for RtRunqueue {
    fn default() -> Self {
        Self {
            queues: std::array::from_fn(|_| VecDeque::new()),
            bitmap: [0; 2],
            pushable: BTreeSet::new(),
            seq: 0,
            nr_running: 0,
            highest_prio: HighestPrio::default(),
            overloaded: false,
            throttled: false,
        }
    }
}

fn level(prio: i32) -> Option<usize> {
    usize::try_from(prio).ok().filter(|idx| *idx < RT_LEVELS)
}

impl RtRunqueue {
    /// Number of queued tasks, the running one included.
    #[must_use]
    pub const fn nr_running(&self) -> usize {
        self.nr_running
    }

    /// Cached priorities.
    #[must_use]
    pub const fn highest_prio(&self) -> HighestPrio {
        self.highest_prio
    }

    /// Whether the group is throttled.
    #[must_use]
    pub const fn is_throttled(&self) -> bool {
        self.throttled
    }

    /// Whether any task could run elsewhere.
    #[must_use]
    pub fn has_pushable(&self) -> bool {
        !self.pushable.is_empty()
    }

    /// Queue `task` at `prio`, at the head of the level when `head` is set.
    pub fn enqueue(&mut self, task: TaskId, prio: i32, head: bool) -> bool {
        let Some(idx) = level(prio) else {
            return false;
        };
        if head {
            self.queues[idx].push_front(task);
        } else {
            self.queues[idx].push_back(task);
        }
        self.bitmap[idx / 64] |= 1u64 << (idx % 64);
        self.nr_running += 1;
        self.refresh_highest();
        true
    }

    /// Remove `task` from level `prio`.
    pub fn dequeue(&mut self, task: TaskId, prio: i32) -> bool {
        let Some(idx) = level(prio) else {
            return false;
        };
        let queue = &mut self.queues[idx];
        let Some(pos) = queue.iter().position(|t| *t == task) else {
            return false;
        };
        let _removed = queue.remove(pos);
        if queue.is_empty() {
            self.bitmap[idx / 64] &= !(1u64 << (idx % 64));
        }
        self.nr_running -= 1;
        self.refresh_highest();
        true
    }

    /// Move `task` to the tail (or head) of its level.
    pub fn requeue(&mut self, task: TaskId, prio: i32, head: bool) -> bool {
        self.dequeue(task, prio) && self.enqueue(task, prio, head)
    }

    /// Whether `prio`'s level holds more than one task.
    #[must_use]
    pub fn has_peers(&self, prio: i32) -> bool {
        level(prio).is_some_and(|idx| self.queues[idx].len() > 1)
    }

    /// Highest non-empty level.
    #[must_use]
    pub fn first_level(&self) -> Option<i32> {
        let idx = if self.bitmap[0] != 0 {
            self.bitmap[0].trailing_zeros() as usize
        } else if self.bitmap[1] != 0 {
            64 + self.bitmap[1].trailing_zeros() as usize
        } else {
            return None;
        };
        i32::try_from(idx).ok()
    }

    /// Front task of the highest non-empty level.
    #[must_use]
    pub fn pick(&self) -> Option<TaskId> {
        let prio = self.first_level()?;
        level(prio).and_then(|idx| self.queues[idx].front().copied())
    }

    /// Tasks queued at `prio` in FIFO order.
    pub fn level_tasks(&self, prio: i32) -> impl Iterator<Item = TaskId> + '_ {
        level(prio)
            .map(|idx| self.queues[idx].iter().copied())
            .into_iter()
            .flatten()
    }

    /// Add to the pushable set and return the key.
    pub fn insert_pushable(&mut self, task: TaskId, prio: i32) -> (i32, u64) {
        self.seq = self.seq.wrapping_add(1);
        self.pushable.insert((prio, self.seq, task));
        self.refresh_highest();
        (prio, self.seq)
    }

    /// Remove from the pushable set.
    pub fn remove_pushable(&mut self, task: TaskId, key: (i32, u64)) -> bool {
        let removed = self.pushable.remove(&(key.0, key.1, task));
        self.refresh_highest();
        removed
    }

    /// Pushable tasks, highest priority first.
    pub fn pushable(&self) -> impl Iterator<Item = (i32, TaskId)> + '_ {
        self.pushable.iter().map(|(prio, _, task)| (*prio, *task))
    }

    fn refresh_highest(&mut self) {
        self.highest_prio = HighestPrio {
            curr: self.first_level().unwrap_or(MAX_RT_PRIO),
            next: self
                .pushable
                .first()
                .map_or(MAX_RT_PRIO, |(prio, _, _)| *prio),
        };
    }

    /// Whether the bitmap agrees with the level lists and the running count.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let mut total = 0;
        for (idx, queue) in self.queues.iter().enumerate() {
            let bit = self.bitmap[idx / 64] & (1u64 << (idx % 64)) != 0;
            if bit == queue.is_empty() {
                return false;
            }
            total += queue.len();
        }
        total == self.nr_running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> TaskId {
        TaskId::new(raw)
    }

    #[test]
    fn test_pick_lowest_numbered_level() {
        let mut rt = RtRunqueue::default();
        assert!(rt.enqueue(id(1), 50, false));
        assert!(rt.enqueue(id(2), 70, false));
        assert!(rt.enqueue(id(3), 10, false));
        assert_eq!(rt.pick(), Some(id(3)));
        assert!(rt.dequeue(id(3), 10));
        assert_eq!(rt.pick(), Some(id(1)));
        assert!(rt.is_consistent());
    }

    #[test]
    fn test_fifo_head_and_requeue() {
        let mut rt = RtRunqueue::default();
        assert!(rt.enqueue(id(1), 20, false));
        assert!(rt.enqueue(id(2), 20, false));
        assert!(rt.enqueue(id(3), 20, true));
        assert_eq!(rt.level_tasks(20).collect::<Vec<_>>(), vec![id(3), id(1), id(2)]);
        assert!(rt.requeue(id(3), 20, false));
        assert_eq!(rt.pick(), Some(id(1)));
        assert!(rt.has_peers(20));
    }

    #[test]
    fn test_second_bitmap_word() {
        let mut rt = RtRunqueue::default();
        assert!(rt.enqueue(id(1), 99, false));
        assert!(rt.enqueue(id(2), 64, false));
        assert_eq!(rt.first_level(), Some(64));
        assert!(!rt.enqueue(id(3), 100, false));
        assert!(!rt.enqueue(id(3), -1, false));
        assert!(rt.is_consistent());
    }

    #[test]
    fn test_highest_prio_cache() {
        let mut rt = RtRunqueue::default();
        assert!(rt.enqueue(id(1), 5, false));
        assert!(rt.enqueue(id(2), 9, false));
        assert_eq!(rt.highest_prio(), HighestPrio { curr: 5, next: MAX_RT_PRIO });
        let key = rt.insert_pushable(id(2), 9);
        assert_eq!(rt.highest_prio(), HighestPrio { curr: 5, next: 9 });
        assert!(rt.remove_pushable(id(2), key));
        assert_eq!(rt.highest_prio().next, MAX_RT_PRIO);
        assert!(rt.dequeue(id(1), 5));
        assert_eq!(rt.highest_prio().curr, 9);
    }
}
