//! Fair-share class boundary.
//!
//! The real-time core only needs a per-CPU queue it can defer to when neither
//! real-time class has work. [`FifoFairQueue`] is a minimal stand-in that
//! rotates its tasks every tick.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::types::TaskId;

/// Per-CPU fair-share runqueue.
///
/// The running task stays queued; `pick_next` only peeks.
pub trait FairQueue: Send + fmt::Debug {
    /// Add a runnable task.
    fn enqueue(&mut self, task: TaskId, prio: i32);

    /// Remove a task. Returns `false` if it was not queued.
    fn dequeue(&mut self, task: TaskId) -> bool;

    /// Task that should run next.
    fn pick_next(&self) -> Option<TaskId>;

    /// Move `task` behind its peers.
    fn yield_task(&mut self, task: TaskId);

    /// Periodic tick for the running task. Returns `true` to request a reschedule.
    fn task_tick(&mut self, task: TaskId, delta_ns: u64) -> bool;

    /// Number of queued tasks.
    fn nr_running(&self) -> usize;
}

/// Constructor for per-CPU fair queues, called once per CPU.
pub type FairQueueFactory = Arc<dyn Fn(usize) -> Box<dyn FairQueue> + Send + Sync>;

/// Factory producing [`FifoFairQueue`]s.
#[must_use]
pub fn fifo_factory() -> FairQueueFactory {
    Arc::new(|_cpu| Box::new(FifoFairQueue::default()))
}

/// FIFO fair queue that round-robins on every tick.
#[derive(Debug, Default, Clone)]
pub struct FifoFairQueue {
    queue: VecDeque<TaskId>,
}

impl FairQueue for FifoFairQueue {
    fn enqueue(&mut self, task: TaskId, _prio: i32) {
        if !self.queue.contains(&task) {
            self.queue.push_back(task);
        }
    }

    fn dequeue(&mut self, task: TaskId) -> bool {
        match self.queue.iter().position(|t| *t == task) {
            Some(pos) => self.queue.remove(pos).is_some(),
            None => false,
        }
    }

    fn pick_next(&self) -> Option<TaskId> {
        self.queue.front().copied()
    }

    fn yield_task(&mut self, task: TaskId) {
        if self.dequeue(task) {
            self.queue.push_back(task);
        }
    }

    fn task_tick(&mut self, task: TaskId, _delta_ns: u64) -> bool {
        if self.queue.len() < 2 {
            return false;
        }
        self.yield_task(task);
        true
    }

    fn nr_running(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_and_rotation() {
        let mut fair = FifoFairQueue::default();
        let (a, b) = (TaskId::new(1), TaskId::new(2));
        fair.enqueue(a, 120);
        fair.enqueue(b, 120);
        fair.enqueue(a, 120);
        assert_eq!(fair.nr_running(), 2);
        assert_eq!(fair.pick_next(), Some(a));

        assert!(fair.task_tick(a, 1_000));
        assert_eq!(fair.pick_next(), Some(b));

        assert!(fair.dequeue(b));
        assert!(!fair.dequeue(b));
        assert!(!fair.task_tick(a, 1_000));
    }

    #[test]
    fn test_factory_builds_independent_queues() {
        let factory = fifo_factory();
        let mut q0 = factory(0);
        let q1 = factory(1);
        q0.enqueue(TaskId::new(9), 120);
        assert_eq!(q0.nr_running(), 1);
        assert_eq!(q1.nr_running(), 0);
    }
}
