//! Scheduling classes and the dispatcher that routes runqueue operations to them.
//!
//! Classes are strictly ordered: a runnable task of a higher class always
//! runs before any task of a lower one. The core never calls class code
//! directly; it goes through [`SchedClass`], which matches on the class of
//! the task being operated on.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

use rtsched_atomic::SchedCounters;

use crate::config::SchedConfig;
use crate::deadline;
use crate::domain::RootDomain;
use crate::observer::UtilObserver;
use crate::rq::Runqueue;
use crate::rt;
use crate::task::Task;
use crate::timer::TimerFacility;
use crate::types::{TaskId, is_dl_prio, is_rt_prio};

/// Scheduling class, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SchedClass {
    /// EDF with CBS bandwidth isolation.
    Deadline,
    /// Fixed priority FIFO and round-robin.
    Rt,
    /// Fair-share stand-in.
    Fair,
    /// Nothing to run.
    Idle,
}

/// Pick order.
pub const CLASS_ORDER: [SchedClass; 4] = [
    SchedClass::Deadline,
    SchedClass::Rt,
    SchedClass::Fair,
    SchedClass::Idle,
];

bitflags! {
    /// Reason for an enqueue.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct EnqueueFlags: u8 {
        /// The task was blocked and is waking up.
        const WAKEUP = 1 << 0;
        /// Re-enqueue after a parameter change.
        const RESTORE = 1 << 1;
        /// Replenish a throttled deadline entity while enqueueing.
        const REPLENISH = 1 << 2;
        /// Queue at the head of the priority level.
        const HEAD = 1 << 3;
        /// First activation of a new task.
        const NEW = 1 << 4;
        /// Arrival from another runqueue.
        const MIGRATED = 1 << 5;
    }
}

bitflags! {
    /// Reason for a dequeue.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct DequeueFlags: u8 {
        /// The task is blocking.
        const SLEEP = 1 << 0;
        /// Temporary removal around a parameter change.
        const SAVE = 1 << 1;
        /// Departure to another runqueue.
        const MIGRATING = 1 << 2;
    }
}

impl EnqueueFlags {
    /// Whether the task becomes active on this runqueue.
    pub(crate) fn activates(self) -> bool {
        self.intersects(Self::WAKEUP | Self::RESTORE | Self::NEW | Self::MIGRATED)
    }
}

impl DequeueFlags {
    /// Whether the task stops being active on this runqueue.
    pub(crate) fn deactivates(self) -> bool {
        self.intersects(Self::SLEEP | Self::SAVE | Self::MIGRATING)
    }
}

/// Collaborators of one runqueue's partition, borrowed for the duration of an operation.
#[derive(Clone, Copy)]
pub(crate) struct Ctx<'a> {
    pub(crate) config: &'a SchedConfig,
    pub(crate) domain: &'a RootDomain,
    pub(crate) timers: &'a dyn TimerFacility,
    pub(crate) counters: &'a SchedCounters,
    pub(crate) observer: &'a dyn UtilObserver,
}

impl fmt::Debug for Ctx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx")
            .field("partition", &self.domain.id())
            .finish_non_exhaustive()
    }
}

impl Ctx<'_> {
    /// CPUs `task` may run on inside this partition.
    pub(crate) fn allowed(&self, task: &Task) -> crate::types::CpuMask {
        task.affinity & self.domain.span()
    }

    /// Whether the balancer may move `task`.
    pub(crate) fn migratable(&self, task: &Task) -> bool {
        self.allowed(task).weight() > 1
    }
}

/// Charge the running task for the time since it was last accounted.
///
/// Returns the task and the charged delta.
pub(crate) fn update_curr_common(rq: &mut Runqueue) -> Option<(TaskId, u64)> {
    let id = rq.curr?;
    let clock = rq.clock;
    let task = rq.tasks.get_mut(&id)?;
    let delta = clock.saturating_sub(task.exec_start);
    task.exec_start = clock;
    task.sum_exec_runtime = task.sum_exec_runtime.saturating_add(delta);
    Some((id, delta))
}

impl SchedClass {
    /// Class serving effective priority `prio`.
    #[must_use]
    pub const fn of_prio(prio: i32) -> Self {
        if is_dl_prio(prio) {
            Self::Deadline
        } else if is_rt_prio(prio) {
            Self::Rt
        } else {
            Self::Fair
        }
    }

    /// Whether tasks of `self` run before tasks of `other`.
    #[must_use]
    pub fn is_above(self, other: Self) -> bool {
        self < other
    }

    pub(crate) fn enqueue(self, ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId, flags: EnqueueFlags) {
        match self {
            Self::Deadline => deadline::enqueue(ctx, rq, id, flags),
            Self::Rt => rt::enqueue(ctx, rq, id, flags),
            Self::Fair => {
                if let Some(task) = rq.tasks.get(&id) {
                    rq.fair.enqueue(id, task.prio);
                }
            }
            Self::Idle => {}
        }
    }

    pub(crate) fn dequeue(self, ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId, flags: DequeueFlags) {
        match self {
            Self::Deadline => deadline::dequeue(ctx, rq, id, flags),
            Self::Rt => rt::dequeue(rq, id),
            Self::Fair => {
                let _queued = rq.fair.dequeue(id);
            }
            Self::Idle => {}
        }
    }

    pub(crate) fn update_curr(self, ctx: &Ctx<'_>, rq: &mut Runqueue) {
        match self {
            Self::Deadline => deadline::update_curr(ctx, rq),
            Self::Rt => rt::update_curr(ctx, rq),
            Self::Fair => {
                if let Some((_, delta)) = update_curr_common(rq) {
                    ctx.observer
                        .runtime_consumed(rq.cpu, self, delta, rq.dl.bandwidth().running_bw());
                }
            }
            Self::Idle => {}
        }
    }

    pub(crate) fn yield_task(self, ctx: &Ctx<'_>, rq: &mut Runqueue) {
        match self {
            Self::Deadline => deadline::yield_task(ctx, rq),
            Self::Rt => rt::yield_task(rq),
            Self::Fair => {
                if let Some(id) = rq.curr {
                    rq.fair.yield_task(id);
                }
            }
            Self::Idle => {}
        }
    }

    /// A task of this class became runnable; preempt the running task if it should.
    pub(crate) fn check_preempt(self, ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
        let Some(curr_class) = rq.curr_class() else {
            rq.resched_curr();
            return;
        };
        if rq.is_curr(id) {
            return;
        }
        if self.is_above(curr_class) {
            rq.resched_curr();
            return;
        }
        if self != curr_class {
            return;
        }
        match self {
            Self::Deadline => deadline::check_preempt(ctx, rq, id),
            Self::Rt => rt::check_preempt(ctx, rq, id),
            Self::Fair | Self::Idle => {}
        }
    }

    pub(crate) fn pick_next(self, rq: &Runqueue) -> Option<TaskId> {
        match self {
            Self::Deadline => rq.dl.leftmost(),
            Self::Rt => rt::pick_next(rq),
            Self::Fair => rq.fair.pick_next(),
            Self::Idle => None,
        }
    }

    pub(crate) fn put_prev(self, ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
        match self {
            Self::Deadline => deadline::put_prev(ctx, rq, id),
            Self::Rt => rt::put_prev(ctx, rq, id),
            Self::Fair | Self::Idle => {}
        }
    }

    pub(crate) fn set_next(self, rq: &mut Runqueue, id: TaskId) {
        if let Some(task) = rq.tasks.get_mut(&id) {
            task.exec_start = rq.clock;
        }
        match self {
            Self::Deadline => deadline::set_next(rq, id),
            Self::Rt => rt::set_next(rq, id),
            Self::Fair | Self::Idle => {}
        }
    }

    pub(crate) fn task_tick(self, ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
        match self {
            Self::Deadline => deadline::task_tick(ctx, rq),
            Self::Rt => rt::task_tick(ctx, rq, id),
            Self::Fair => {
                let delta = update_curr_common(rq).map_or(0, |(_, delta)| delta);
                ctx.observer
                    .runtime_consumed(rq.cpu, self, delta, rq.dl.bandwidth().running_bw());
                if rq.fair.task_tick(id, delta) {
                    rq.resched_curr();
                }
            }
            Self::Idle => {}
        }
    }

    pub(crate) fn task_woken(self, ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
        match self {
            Self::Deadline => deadline::task_woken(ctx, rq, id),
            Self::Rt => rt::task_woken(ctx, rq, id),
            Self::Fair | Self::Idle => {}
        }
    }

    pub(crate) fn switched_from(self, ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
        match self {
            Self::Deadline => deadline::switched_from(ctx, rq, id),
            Self::Rt => rt::switched_from(rq, id),
            Self::Fair | Self::Idle => {}
        }
    }

    pub(crate) fn switched_to(self, ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
        match self {
            Self::Deadline => deadline::switched_to(ctx, rq, id),
            Self::Rt => rt::switched_to(ctx, rq, id),
            Self::Fair => {
                if !rq.is_curr(id) && rq.tasks.get(&id).is_some_and(Task::is_queued) {
                    self.check_preempt(ctx, rq, id);
                }
            }
            Self::Idle => {}
        }
    }

    pub(crate) fn prio_changed(self, ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId, old_prio: i32) {
        match self {
            Self::Deadline => deadline::prio_changed(rq, id),
            Self::Rt => rt::prio_changed(ctx, rq, id, old_prio),
            Self::Fair | Self::Idle => {}
        }
    }
}

impl fmt::Display for SchedClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Deadline => "deadline",
            Self::Rt => "rt",
            Self::Fair => "fair",
            Self::Idle => "idle",
        };
        f.write_str(name)
    }
}
