//! Deadline class: EDF ordering with CBS budget enforcement.
//!
//! Each entity gets `runtime` every `period` and must receive it before its
//! relative `deadline`. Running down the budget throttles the entity until
//! the replenishment timer fires at the start of its next period.

pub mod entity;
pub mod rq;

use tracing::{debug, trace};

use crate::class::{Ctx, DequeueFlags, EnqueueFlags, SchedClass, update_curr_common};
use crate::macros::warn_once;
use crate::rq::{BalanceWork, Runqueue};
use crate::rt;
use crate::task::Task;
use crate::timer::TimerEvent;
use crate::types::{Policy, TaskId};
use entity::{DlFlags, Replenish, WakeupRefresh};

/// Bandwidth the task holds in its runqueue's accounting.
pub(crate) fn own_bw(task: &Task) -> u64 {
    if task.policy == Policy::Deadline {
        task.dl.dl_bw
    } else {
        0
    }
}

/// Arm the replenishment timer at the start of the next period.
///
/// Returns `false` when that instant is already behind `clock`.
fn start_timer(ctx: &Ctx<'_>, clock: u64, task: &mut Task) -> bool {
    let expires = task.dl.next_period();
    if expires < clock {
        return false;
    }
    if let Some(handle) = task.dl.timer.take() {
        let _pending = ctx.timers.cancel(handle);
    }
    let generation = task.dl.next_timer_generation();
    let handle = ctx.timers.arm(
        expires,
        TimerEvent::DlReplenish {
            task: task.id,
            generation,
        },
    );
    task.dl.timer = Some(handle);
    trace!(task = %task.id, expires, generation, "replenishment timer armed");
    true
}

/// Cancel a pending replenishment. A cancelled expiry already in flight is
/// recognised as stale by its generation.
pub(crate) fn cancel_timer(ctx: &Ctx<'_>, task: &mut Task) {
    if let Some(handle) = task.dl.timer.take() {
        let _pending = ctx.timers.cancel(handle);
    }
    let _stale = task.dl.next_timer_generation();
}

fn replenish(ctx: &Ctx<'_>, clock: u64, task: &mut Task) {
    if task.dl.replenish(clock) == Replenish::Lagged {
        warn_once!(task = %task.id, "deadline entity fell more than a period behind, restarting it");
        ctx.counters.inc_invariant_clamp();
    }
    ctx.counters.inc_dl_replenishment();
}

/// Throttle until the next period; replenish at once if that is already due.
fn throttle(ctx: &Ctx<'_>, clock: u64, task: &mut Task) {
    task.dl.throttle();
    ctx.counters.inc_dl_throttle();
    if task.dl.is_boosted() || !start_timer(ctx, clock, task) {
        replenish(ctx, clock, task);
    }
}

fn insert(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
    let running = rq.is_curr(id);
    let Some(task) = rq.tasks.get_mut(&id) else {
        return;
    };
    if task.dl.tree_key.is_some() {
        return;
    }
    task.dl.tree_key = Some(rq.dl.insert(id, task.dl.deadline));
    if !running && ctx.migratable(task) {
        task.dl.push_key = Some(rq.dl.insert_pushable(id, task.dl.deadline));
    }
}

fn remove(rq: &mut Runqueue, id: TaskId) {
    let Some(task) = rq.tasks.get_mut(&id) else {
        return;
    };
    if let Some(key) = task.dl.tree_key.take() {
        rq.dl.remove(key);
    }
    if let Some(key) = task.dl.push_key.take() {
        rq.dl.remove_pushable(key);
    }
}

pub(crate) fn enqueue(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId, flags: EnqueueFlags) {
    let clock = rq.clock;
    let shift = ctx.config.dl_scale_shift;
    let Some(task) = rq.tasks.get_mut(&id) else {
        return;
    };

    // Inheritance overrides throttling.
    if task.dl.is_boosted() && task.dl.is_throttled() {
        cancel_timer(ctx, task);
        task.dl.flags.remove(DlFlags::THROTTLED);
    }
    if flags.activates() {
        rq.dl.bw.add_running(own_bw(task));
    }

    if task.dl.is_new() {
        if flags.contains(EnqueueFlags::REPLENISH) {
            replenish(ctx, clock, task);
        } else {
            task.dl.setup_new(clock);
        }
    } else if flags.contains(EnqueueFlags::WAKEUP) {
        if !task.dl.is_throttled() {
            if task.dl.needs_constrained_throttle(clock) {
                debug!(task = %id, deadline = task.dl.deadline, "constrained task woke before its next period");
                throttle(ctx, clock, task);
            } else if task.dl.update_on_wakeup(clock, shift) == WakeupRefresh::Revised
                && task.dl.runtime <= 0
            {
                throttle(ctx, clock, task);
            }
        }
    } else if flags.contains(EnqueueFlags::REPLENISH) {
        replenish(ctx, clock, task);
    } else if flags.contains(EnqueueFlags::RESTORE)
        && !task.dl.is_boosted()
        && task.dl.deadline < clock
    {
        task.dl.setup_new(clock);
    }

    if task.dl.is_throttled() {
        return;
    }
    insert(ctx, rq, id);
}

pub(crate) fn dequeue(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId, flags: DequeueFlags) {
    remove(rq, id);
    if !flags.deactivates() {
        return;
    }
    if let Some(task) = rq.tasks.get(&id)
        && !rq.dl.bw.sub_running(own_bw(task))
    {
        warn_once!(cpu = rq.cpu, task = %id, "running bandwidth underflow");
        ctx.counters.inc_invariant_clamp();
    }
}

/// Charge the running deadline task and throttle it when its budget runs out.
pub(crate) fn update_curr(ctx: &Ctx<'_>, rq: &mut Runqueue) {
    let Some(id) = rq.curr else {
        return;
    };
    let clock = rq.clock;
    let Some(task) = rq.tasks.get_mut(&id) else {
        return;
    };
    if task.class() != SchedClass::Deadline || !task.is_queued() {
        return;
    }
    // Time spent throttled is not charged once the budget comes back.
    if task.dl.is_throttled() {
        task.exec_start = clock;
        return;
    }
    let Some((_, delta)) = update_curr_common(rq) else {
        return;
    };
    let cpu = rq.cpu;
    let Some(task) = rq.tasks.get_mut(&id) else {
        return;
    };
    if delta == 0 && !task.dl.is_yielded() {
        return;
    }

    if ctx.domain.rt_bw.is_enabled() {
        ctx.domain.rt_bw.account(cpu, delta);
        rt::start_period_timer(ctx, clock);
    }
    ctx.observer
        .runtime_consumed(cpu, SchedClass::Deadline, delta, rq.dl.bw.running_bw());

    if !task.dl.charge(delta) {
        return;
    }
    if let Some(key) = task.dl.tree_key.take() {
        rq.dl.remove(key);
    }
    if let Some(key) = task.dl.push_key.take() {
        rq.dl.remove_pushable(key);
    }
    throttle(ctx, clock, task);
    if task.dl.is_throttled() {
        debug!(cpu, task = %id, next_period = task.dl.next_period(), "deadline task throttled");
    } else {
        task.dl.tree_key = Some(rq.dl.insert(id, task.dl.deadline));
    }
    let leftmost = task.dl.tree_key.is_some_and(|key| rq.dl.is_leftmost(key));
    if !leftmost {
        rq.resched_curr();
    }
}

pub(crate) fn task_tick(ctx: &Ctx<'_>, rq: &mut Runqueue) {
    update_curr(ctx, rq);
}

/// Give up the rest of the current period.
pub(crate) fn yield_task(ctx: &Ctx<'_>, rq: &mut Runqueue) {
    let Some(id) = rq.curr else {
        return;
    };
    if let Some(task) = rq.tasks.get_mut(&id) {
        task.dl.flags.insert(DlFlags::YIELDED);
    }
    update_curr(ctx, rq);
    rq.resched_curr();
}

pub(crate) fn check_preempt(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
    let (Some(curr), Some(task)) = (rq.curr_task(), rq.tasks.get(&id)) else {
        return;
    };
    if task.dl.preempts(&curr.dl) {
        rq.resched_curr();
        return;
    }
    if task.dl.deadline != curr.dl.deadline || rq.need_resched {
        return;
    }

    // Equal deadlines: only preempt if the running task can move and the
    // woken one cannot.
    let curr_movable = ctx.migratable(curr)
        && ctx
            .domain
            .cpudl
            .lock()
            .find(curr.dl.deadline, ctx.allowed(curr))
            .is_some();
    if !curr_movable {
        return;
    }
    let task_movable = ctx.migratable(task)
        && ctx
            .domain
            .cpudl
            .lock()
            .find(task.dl.deadline, ctx.allowed(task))
            .is_some();
    if !task_movable {
        rq.resched_curr();
    }
}

pub(crate) fn put_prev(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
    let Some(task) = rq.tasks.get_mut(&id) else {
        return;
    };
    if task.dl.tree_key.is_some() && task.dl.push_key.is_none() && ctx.migratable(task) {
        task.dl.push_key = Some(rq.dl.insert_pushable(id, task.dl.deadline));
    }
}

pub(crate) fn set_next(rq: &mut Runqueue, id: TaskId) {
    if let Some(task) = rq.tasks.get_mut(&id)
        && let Some(key) = task.dl.push_key.take()
    {
        rq.dl.remove_pushable(key);
    }
    if rq.dl.has_pushable() {
        rq.queue_balance(BalanceWork::PUSH_DL);
    }
}

/// A woken task that will not preempt a deadline task may run sooner elsewhere.
pub(crate) fn task_woken(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
    let (Some(curr), Some(task)) = (rq.curr_task(), rq.tasks.get(&id)) else {
        return;
    };
    let push = !rq.is_curr(id)
        && !rq.need_resched
        && ctx.migratable(task)
        && curr.class() == SchedClass::Deadline
        && (!ctx.migratable(curr) || !task.dl.preempts(&curr.dl));
    if push {
        rq.queue_balance(BalanceWork::PUSH_DL);
    }
}

pub(crate) fn switched_from(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
    let Some(task) = rq.tasks.get_mut(&id) else {
        return;
    };
    cancel_timer(ctx, task);
    task.dl.flags.remove(DlFlags::THROTTLED | DlFlags::YIELDED);
    if task.is_queued() && rq.dl.nr_running() == 0 {
        rq.queue_balance(BalanceWork::PULL_DL);
    }
}

pub(crate) fn switched_to(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
    let Some(task) = rq.tasks.get(&id) else {
        return;
    };
    if !task.is_queued() || rq.is_curr(id) {
        return;
    }
    if ctx.migratable(task) && rq.dl.overloaded {
        rq.queue_balance(BalanceWork::PUSH_DL);
    }
    if rq.curr_class() == Some(SchedClass::Deadline) {
        check_preempt(ctx, rq, id);
    } else {
        rq.resched_curr();
    }
}

pub(crate) fn prio_changed(rq: &mut Runqueue, id: TaskId) {
    let Some(task) = rq.tasks.get(&id) else {
        return;
    };
    if !task.is_queued() {
        return;
    }
    let deadline = task.dl.deadline;
    let resched = if rq.is_curr(id) {
        rq.dl.earliest().curr.is_some_and(|earliest| earliest < deadline)
    } else {
        rq.curr_task().is_none_or(|curr| {
            curr.class() != SchedClass::Deadline || deadline < curr.dl.deadline
        })
    };
    if !rq.dl.overloaded {
        rq.queue_balance(BalanceWork::PULL_DL);
    }
    if resched {
        rq.resched_curr();
    }
}

/// Replenishment timer expiry, re-validated under the runqueue lock.
///
/// Returns `false` for a stale or superseded expiry.
pub(crate) fn replenish_timer(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId, generation: u64) -> bool {
    let (clock, running) = (rq.clock, rq.is_curr(id));
    let Some(task) = rq.tasks.get_mut(&id) else {
        return false;
    };
    if task.class() != SchedClass::Deadline
        || task.dl.is_boosted()
        || !task.dl.is_throttled()
        || task.dl.timer_generation != generation
    {
        return false;
    }
    task.dl.timer = None;
    if running {
        task.exec_start = clock;
    }
    if !task.is_queued() {
        replenish(ctx, clock, task);
        trace!(task = %id, "replenished a sleeping deadline task");
        return true;
    }

    enqueue(ctx, rq, id, EnqueueFlags::REPLENISH);
    if rq.curr_class() == Some(SchedClass::Deadline) {
        if !rq.is_curr(id) {
            check_preempt(ctx, rq, id);
        }
    } else {
        rq.resched_curr();
    }
    if rq.dl.has_pushable() {
        rq.queue_balance(BalanceWork::PUSH_DL);
    }
    trace!(cpu = rq.cpu, task = %id, "deadline task replenished");
    true
}

/// CPU in the partition where `task` would run earliest, skipping `exclude`.
pub(crate) fn find_later_cpu(ctx: &Ctx<'_>, task: &Task, exclude: Option<usize>) -> Option<usize> {
    let mut allowed = ctx.allowed(task);
    if allowed.weight() < 2 {
        return None;
    }
    if let Some(cpu) = exclude {
        allowed.remove(cpu);
    }
    let mask = ctx.domain.cpudl.lock().find(task.dl.deadline, allowed)?;
    if mask.contains(task.cpu) {
        Some(task.cpu)
    } else {
        mask.first()
    }
}
