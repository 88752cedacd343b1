//! Fixed-priority class: `SCHED_FIFO` and `SCHED_RR` semantics with group
//! bandwidth throttling.

pub mod bandwidth;
pub mod rq;

use tracing::{debug, trace};

use crate::class::{Ctx, EnqueueFlags, SchedClass, update_curr_common};
use crate::macros::warn_once;
use crate::rq::{BalanceWork, Runqueue};
use crate::task::Task;
use crate::timer::TimerEvent;
use crate::types::{Policy, TaskId};

/// Start the partition's period timer if it is not running.
pub(crate) fn start_period_timer(ctx: &Ctx<'_>, now: u64) {
    if let Some((expires, generation)) = ctx.domain.rt_bw.start_timer(now) {
        let handle = ctx.timers.arm(
            expires,
            TimerEvent::RtPeriod {
                partition: ctx.domain.id(),
                generation,
            },
        );
        ctx.domain.rt_bw.set_timer_handle(generation, handle);
        trace!(partition = ctx.domain.id(), expires, "rt period timer started");
    }
}

pub(crate) fn enqueue(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId, flags: EnqueueFlags) {
    let running = rq.is_curr(id);
    let clock = rq.clock;
    let Some(task) = rq.tasks.get_mut(&id) else {
        return;
    };
    if task.rt.queued_prio.is_some() {
        return;
    }
    if task.policy == Policy::RoundRobin && task.rt.time_slice == 0 {
        task.rt.time_slice = ctx.config.rr_timeslice_ns;
    }
    let prio = task.prio;
    if !rq.rt.enqueue(id, prio, flags.contains(EnqueueFlags::HEAD)) {
        return;
    }
    task.rt.queued_prio = Some(prio);
    if !running && ctx.migratable(task) {
        task.rt.push_key = Some(rq.rt.insert_pushable(id, prio));
    }
    start_period_timer(ctx, clock);
}

pub(crate) fn dequeue(rq: &mut Runqueue, id: TaskId) {
    let Some(task) = rq.tasks.get_mut(&id) else {
        return;
    };
    if let Some(prio) = task.rt.queued_prio.take() {
        rq.rt.dequeue(id, prio);
    }
    if let Some(key) = task.rt.push_key.take() {
        rq.rt.remove_pushable(id, key);
    }
}

/// Charge the running task, consume its round-robin slice and enforce the
/// group runtime.
pub(crate) fn update_curr(ctx: &Ctx<'_>, rq: &mut Runqueue) {
    let Some(id) = rq.curr else {
        return;
    };
    if !rq
        .tasks
        .get(&id)
        .is_some_and(|t| t.class() == SchedClass::Rt && t.is_queued())
    {
        return;
    }
    let Some((_, delta)) = update_curr_common(rq) else {
        return;
    };
    if delta == 0 {
        return;
    }
    let (cpu, clock) = (rq.cpu, rq.clock);
    ctx.observer
        .runtime_consumed(cpu, SchedClass::Rt, delta, rq.dl.bw.running_bw());
    if let Some(task) = rq.tasks.get_mut(&id)
        && task.policy == Policy::RoundRobin
    {
        task.rt.time_slice = task.rt.time_slice.saturating_sub(delta);
    }

    if !ctx.domain.rt_bw.is_enabled() {
        return;
    }
    ctx.domain.rt_bw.account(cpu, delta);
    start_period_timer(ctx, clock);
    if rq.rt.throttled {
        return;
    }
    let (exceeded, borrowed) = ctx.domain.rt_bw.runtime_exceeded(cpu);
    if borrowed > 0 {
        ctx.counters.add_rt_runtime_borrowed(borrowed);
        trace!(cpu, borrowed, "rt runtime borrowed from siblings");
    }
    if exceeded {
        warn_once!("RT throttling activated");
        debug!(cpu, "rt group throttled");
        rq.rt.throttled = true;
        ctx.counters.inc_rt_throttle();
        rq.resched_curr();
    }
}

/// Round-robin slice expiry: refill and rotate behind peers of equal priority.
pub(crate) fn task_tick(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
    update_curr(ctx, rq);
    let Some(task) = rq.tasks.get_mut(&id) else {
        return;
    };
    if task.policy != Policy::RoundRobin || task.rt.time_slice > 0 {
        return;
    }
    task.rt.time_slice = ctx.config.rr_timeslice_ns;
    let Some(prio) = task.rt.queued_prio else {
        return;
    };
    if rq.rt.has_peers(prio) {
        rq.rt.requeue(id, prio, false);
        rq.resched_curr();
    }
}

pub(crate) fn pick_next(rq: &Runqueue) -> Option<TaskId> {
    if rq.rt.throttled {
        return None;
    }
    rq.rt.pick()
}

pub(crate) fn yield_task(rq: &mut Runqueue) {
    let Some(id) = rq.curr else {
        return;
    };
    if let Some(prio) = rq.tasks.get(&id).and_then(|t| t.rt.queued_prio) {
        rq.rt.requeue(id, prio, false);
    }
}

pub(crate) fn put_prev(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
    let Some(task) = rq.tasks.get_mut(&id) else {
        return;
    };
    if let Some(prio) = task.rt.queued_prio
        && task.rt.push_key.is_none()
        && ctx.migratable(task)
    {
        task.rt.push_key = Some(rq.rt.insert_pushable(id, prio));
    }
}

pub(crate) fn set_next(rq: &mut Runqueue, id: TaskId) {
    if let Some(task) = rq.tasks.get_mut(&id)
        && let Some(key) = task.rt.push_key.take()
    {
        rq.rt.remove_pushable(id, key);
    }
    if rq.rt.has_pushable() {
        rq.queue_balance(BalanceWork::PUSH_RT);
    }
}

pub(crate) fn check_preempt(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
    let (Some(curr), Some(task)) = (rq.curr_task(), rq.tasks.get(&id)) else {
        return;
    };
    if task.prio < curr.prio {
        rq.resched_curr();
        return;
    }
    if task.prio != curr.prio || rq.need_resched {
        return;
    }

    // Equal priority: if the running task could go elsewhere but the woken
    // one cannot, put the woken one first and reschedule.
    let curr_movable = ctx.migratable(curr)
        && ctx
            .domain
            .cpupri
            .lock()
            .find(curr.prio, ctx.allowed(curr))
            .is_some();
    if !curr_movable {
        return;
    }
    let task_movable = ctx.migratable(task)
        && ctx
            .domain
            .cpupri
            .lock()
            .find(task.prio, ctx.allowed(task))
            .is_some();
    if task_movable {
        return;
    }
    if let Some(prio) = task.rt.queued_prio {
        rq.rt.requeue(id, prio, true);
    }
    rq.resched_curr();
}

/// A woken task that will not preempt the running one may run sooner elsewhere.
pub(crate) fn task_woken(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
    let (Some(curr), Some(task)) = (rq.curr_task(), rq.tasks.get(&id)) else {
        return;
    };
    let curr_realtime = matches!(curr.class(), SchedClass::Deadline | SchedClass::Rt);
    let push = !rq.is_curr(id)
        && !rq.need_resched
        && ctx.migratable(task)
        && curr_realtime
        && (!ctx.migratable(curr) || curr.prio <= task.prio);
    if push {
        rq.queue_balance(BalanceWork::PUSH_RT);
    }
}

pub(crate) fn switched_from(rq: &mut Runqueue, id: TaskId) {
    if !rq.tasks.get(&id).is_some_and(Task::is_queued) || rq.rt.nr_running() > 0 {
        return;
    }
    rq.queue_balance(BalanceWork::PULL_RT);
}

pub(crate) fn switched_to(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId) {
    let Some(task) = rq.tasks.get(&id) else {
        return;
    };
    if rq.is_curr(id) || !task.is_queued() {
        return;
    }
    let prio = task.prio;
    if ctx.migratable(task) && rq.rt.overloaded {
        rq.queue_balance(BalanceWork::PUSH_RT);
    }
    if prio < rq.curr_prio() {
        rq.resched_curr();
    }
}

pub(crate) fn prio_changed(ctx: &Ctx<'_>, rq: &mut Runqueue, id: TaskId, old_prio: i32) {
    let Some(task) = rq.tasks.get(&id) else {
        return;
    };
    if !task.is_queued() {
        return;
    }
    let prio = task.prio;
    let migratable = ctx.migratable(task);
    if rq.is_curr(id) {
        if old_prio < prio {
            rq.queue_balance(BalanceWork::PULL_RT);
        }
        if prio > rq.rt.highest_prio().curr {
            rq.resched_curr();
        }
    } else {
        if prio < rq.curr_prio() {
            rq.resched_curr();
        }
        if migratable && rq.rt.overloaded {
            rq.queue_balance(BalanceWork::PUSH_RT);
        }
    }
}

/// Lowest-priority CPU in the partition that `task` would preempt, skipping `exclude`.
pub(crate) fn find_lowest_cpu(ctx: &Ctx<'_>, task: &Task, exclude: Option<usize>) -> Option<usize> {
    let mut allowed = ctx.allowed(task);
    if allowed.weight() < 2 {
        return None;
    }
    if let Some(cpu) = exclude {
        allowed.remove(cpu);
    }
    let mask = ctx.domain.cpupri.lock().find(task.prio, allowed)?;
    if mask.contains(task.cpu) {
        Some(task.cpu)
    } else {
        mask.first()
    }
}
