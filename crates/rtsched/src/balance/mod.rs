//! Cross-CPU balancing for the two real-time classes.
//!
//! Push moves a queued, not running task from an overloaded CPU to one
//! running lower-priority (or later-deadline) work. Pull does the reverse
//! for a CPU about to run something worse than what its siblings hold.
//! With `rt_push_ipi` enabled, RT pulls are replaced by a push sweep driven
//! by IPIs (see [`ipi`]).
//!
//! Every path here runs with no runqueue lock held on entry. Candidates are
//! chosen under a single lock, which is then dropped before both runqueues
//! are taken through [`lock::RqPair`]. The candidate is re-validated under
//! the pair, since anything may have changed in between.

pub mod ipi;
pub(crate) mod lock;

use tracing::{debug, trace};

use crate::class::{DequeueFlags, EnqueueFlags, SchedClass};
use crate::core::Scheduler;
use crate::cpupri;
use crate::deadline::{self, own_bw};
use crate::macros::warn_once;
use crate::rq::{BalanceWork, Runqueue};
use crate::rt;
use crate::types::{MAX_CPUS, TaskId};
use ipi::Ipi;
use lock::RqPair;

/// Result of one push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Push {
    /// A task moved to another CPU.
    Moved,
    /// The best pushable task beats the running one; it was rescheduled instead.
    Resched,
    /// No pushable task or no CPU that would take it.
    Nothing,
    /// Lock contention or repeated state changes.
    Abandoned,
}

/// Result of moving a specific task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Migration {
    Moved,
    /// The task is no longer on the source runqueue.
    Stale,
    /// The second lock could not be taken.
    Contended,
}

impl Scheduler {
    /// Move `id` from `src` to `dst`. Both runqueues must be locked.
    ///
    /// Handles running, queued and sleeping tasks alike. Returns `false` if
    /// the task is not on `src`.
    pub(crate) fn migrate(&self, src: &mut Runqueue, dst: &mut Runqueue, id: TaskId) -> bool {
        let src_ctx = self.ctx(src.cpu);
        let dst_ctx = self.ctx(dst.cpu);
        let Some(task) = src.tasks.get(&id) else {
            return false;
        };
        let (class, queued, running) = (task.class(), task.is_queued(), src.is_curr(id));

        if running && queued {
            class.update_curr(&src_ctx, src);
        }
        if queued {
            class.dequeue(&src_ctx, src, id, DequeueFlags::MIGRATING);
        }
        if running {
            src.curr = None;
            src.resched_curr();
        }
        let Some(mut task) = src.tasks.remove(&id) else {
            return false;
        };

        let bw = own_bw(&task);
        if !src.dl.bw.sub_this(bw) {
            warn_once!(cpu = src.cpu, task = %id, "assigned bandwidth underflow on migration");
            self.counters.inc_invariant_clamp();
        }
        dst.update_clock(src.clock);
        dst.dl.bw.add_this(bw);
        task.cpu = dst.cpu;
        dst.tasks.insert(id, task);
        self.locator.write().insert(id, dst.cpu);

        if queued {
            class.enqueue(&dst_ctx, dst, id, EnqueueFlags::MIGRATED);
            class.check_preempt(&dst_ctx, dst, id);
        }
        src.publish(src_ctx.domain);
        dst.publish(dst_ctx.domain);
        trace!(task = %id, from = src.cpu, to = dst.cpu, %class, "task migrated");
        true
    }

    /// Lock `src` and `dst` and move `id` if it still lives on `src`.
    pub(crate) fn move_task(&self, src: usize, dst: usize, id: TaskId) -> Migration {
        let Some(mut pair) = RqPair::try_lock(&self.rqs, src, dst, self.config.balance.lock_retries)
        else {
            return Migration::Contended;
        };
        let (src_rq, dst_rq) = pair.split(src);
        if !self.migrate(src_rq, dst_rq, id) {
            return Migration::Stale;
        }
        let src_work = src_rq.take_balance_work();
        let dst_work = dst_rq.take_balance_work();
        drop(pair);
        self.run_balance_work(src, src_work);
        self.run_balance_work(dst, dst_work);
        Migration::Moved
    }

    /// Move tasks an affinity change could not migrate off `cpu`.
    pub(crate) fn migrate_misplaced(&self, cpu: usize) {
        let Ok(rq_lock) = self.runqueue(cpu) else {
            return;
        };
        let ctx = self.ctx(cpu);
        let pending = std::mem::take(&mut rq_lock.lock().misplaced);
        for id in pending {
            let target = {
                let rq = rq_lock.lock();
                let Some(task) = rq.tasks.get(&id) else {
                    continue;
                };
                let allowed = ctx.allowed(task);
                if allowed.contains(cpu) {
                    continue;
                }
                allowed.first()
            };
            let Some(target) = target else {
                continue;
            };
            match self.move_task(cpu, target, id) {
                Migration::Moved => debug!(task = %id, from = cpu, to = target, "misplaced task migrated"),
                Migration::Stale => {}
                Migration::Contended => {
                    self.counters.inc_balance_abandoned();
                    rq_lock.lock().mark_misplaced(id);
                }
            }
        }
    }

    /// Push the best pushable RT task of `cpu` to a CPU running lower-priority work.
    pub(crate) fn push_rt_task(&self, cpu: usize) -> Push {
        let Ok(rq_lock) = self.runqueue(cpu) else {
            return Push::Nothing;
        };
        let ctx = self.ctx(cpu);
        let mut tries = 0;
        loop {
            let (id, prio, target) = {
                let mut rq = rq_lock.lock();
                let Some((prio, id)) = rq.rt.pushable().next() else {
                    return Push::Nothing;
                };
                if prio < rq.curr_prio() {
                    rq.resched_curr();
                    return Push::Resched;
                }
                let Some(task) = rq.tasks.get(&id) else {
                    return Push::Nothing;
                };
                let Some(target) = rt::find_lowest_cpu(&ctx, task, Some(cpu)) else {
                    return Push::Nothing;
                };
                (id, prio, target)
            };

            let Some(mut pair) =
                RqPair::try_lock(&self.rqs, cpu, target, self.config.balance.lock_retries)
            else {
                self.counters.inc_balance_abandoned();
                debug!(cpu, target, "rt push abandoned, runqueue contended");
                return Push::Abandoned;
            };
            let (src, dst) = pair.split(cpu);
            let still_valid = !src.is_curr(id)
                && src.tasks.get(&id).is_some_and(|task| {
                    task.class() == SchedClass::Rt
                        && task.is_queued()
                        && task.prio == prio
                        && task.rt.push_key.is_some()
                        && ctx.allowed(task).contains(target)
                })
                && dst.published_level() < cpupri::convert(prio);
            if still_valid && self.migrate(src, dst, id) {
                self.counters.inc_push_migration();
                return Push::Moved;
            }
            drop(pair);

            tries += 1;
            if tries >= self.config.balance.max_push_tries {
                self.counters.inc_balance_abandoned();
                debug!(cpu, task = %id, "rt push abandoned after retries");
                return Push::Abandoned;
            }
        }
    }

    pub(crate) fn push_rt_tasks(&self, cpu: usize) {
        for _ in 0..MAX_CPUS {
            if self.push_rt_task(cpu) != Push::Moved {
                break;
            }
        }
    }

    /// Push the earliest pushable deadline task of `cpu` to a CPU with later work.
    pub(crate) fn push_dl_task(&self, cpu: usize) -> Push {
        let Ok(rq_lock) = self.runqueue(cpu) else {
            return Push::Nothing;
        };
        let ctx = self.ctx(cpu);
        let mut tries = 0;
        loop {
            let (id, deadline, target) = {
                let mut rq = rq_lock.lock();
                let Some((deadline, id)) = rq.dl.pushable().next() else {
                    return Push::Nothing;
                };
                let beats_curr = rq.curr_task().is_some_and(|curr| {
                    curr.class() == SchedClass::Deadline
                        && ctx.migratable(curr)
                        && deadline < curr.dl.deadline
                });
                if beats_curr {
                    rq.resched_curr();
                    return Push::Resched;
                }
                let Some(task) = rq.tasks.get(&id) else {
                    return Push::Nothing;
                };
                let Some(target) = deadline::find_later_cpu(&ctx, task, Some(cpu)) else {
                    return Push::Nothing;
                };
                (id, deadline, target)
            };

            let Some(mut pair) =
                RqPair::try_lock(&self.rqs, cpu, target, self.config.balance.lock_retries)
            else {
                self.counters.inc_balance_abandoned();
                debug!(cpu, target, "deadline push abandoned, runqueue contended");
                return Push::Abandoned;
            };
            let (src, dst) = pair.split(cpu);
            let still_valid = !src.is_curr(id)
                && src.tasks.get(&id).is_some_and(|task| {
                    task.class() == SchedClass::Deadline
                        && task.is_queued()
                        && task.dl.deadline == deadline
                        && task.dl.push_key.is_some()
                        && ctx.allowed(task).contains(target)
                })
                && dst.dl.earliest().curr.is_none_or(|earliest| deadline < earliest);
            if still_valid && self.migrate(src, dst, id) {
                self.counters.inc_push_migration();
                return Push::Moved;
            }
            drop(pair);

            tries += 1;
            if tries >= self.config.balance.max_push_tries {
                self.counters.inc_balance_abandoned();
                debug!(cpu, task = %id, "deadline push abandoned after retries");
                return Push::Abandoned;
            }
        }
    }

    pub(crate) fn push_dl_tasks(&self, cpu: usize) {
        for _ in 0..MAX_CPUS {
            if self.push_dl_task(cpu) != Push::Moved {
                break;
            }
        }
    }

    /// Pull higher-priority RT work to `this_cpu`, or ask overloaded CPUs to push it.
    pub(crate) fn pull_rt_task(&self, this_cpu: usize) {
        let domain = self.domain_of(this_cpu);
        if domain.rto_count() == 0 {
            return;
        }
        if self.config.balance.rt_push_ipi {
            if let Some(target) = domain.tell_cpu_to_push()
                && self.ipis.send(target, Ipi::PushRt { partition: domain.id() })
            {
                self.counters.inc_push_ipi();
                trace!(cpu = this_cpu, target, "rt push ipi sent");
            }
            return;
        }

        let ctx = self.ctx(this_cpu);
        for src_cpu in domain.rto_mask() {
            if src_cpu == this_cpu {
                continue;
            }
            let Some(mut pair) =
                RqPair::try_lock(&self.rqs, this_cpu, src_cpu, self.config.balance.lock_retries)
            else {
                self.counters.inc_balance_abandoned();
                continue;
            };
            let (this, src) = pair.split(this_cpu);
            let this_best = this.rt.highest_prio().curr;
            let candidate = src.rt.pushable().find(|(_, id)| {
                !src.is_curr(*id)
                    && src
                        .tasks
                        .get(id)
                        .is_some_and(|task| ctx.allowed(task).contains(this_cpu))
            });
            let Some((prio, id)) = candidate else {
                continue;
            };
            // A task that beats the sibling's own current task runs there soon anyway.
            if prio >= this_best || prio < src.curr_prio() {
                continue;
            }
            if self.migrate(src, this, id) {
                self.counters.inc_pull_migration();
            }
        }
    }

    /// Pull the earliest deadline work that beats what `this_cpu` holds.
    pub(crate) fn pull_dl_task(&self, this_cpu: usize) {
        let domain = self.domain_of(this_cpu);
        if domain.dlo_count() == 0 {
            return;
        }
        let ctx = self.ctx(this_cpu);
        let mut dmin: Option<u64> = None;
        for src_cpu in domain.dlo_mask() {
            if src_cpu == this_cpu {
                continue;
            }
            let Some(mut pair) =
                RqPair::try_lock(&self.rqs, this_cpu, src_cpu, self.config.balance.lock_retries)
            else {
                self.counters.inc_balance_abandoned();
                continue;
            };
            let (this, src) = pair.split(this_cpu);
            if src.dl.nr_running() <= 1 {
                continue;
            }
            let candidate = src.dl.pushable().find(|(_, id)| {
                !src.is_curr(*id)
                    && src
                        .tasks
                        .get(id)
                        .is_some_and(|task| ctx.allowed(task).contains(this_cpu))
            });
            let Some((deadline, id)) = candidate else {
                continue;
            };
            if this.dl.earliest().curr.is_some_and(|earliest| deadline >= earliest)
                || dmin.is_some_and(|pulled| deadline >= pulled)
            {
                continue;
            }
            let preempts_src = src.curr_task().is_some_and(|curr| {
                curr.class() == SchedClass::Deadline
                    && curr.is_queued()
                    && deadline < curr.dl.deadline
            });
            if preempts_src {
                continue;
            }
            if self.migrate(src, this, id) {
                self.counters.inc_pull_migration();
                dmin = Some(deadline);
            }
        }
    }

    /// Handle one IPI on `cpu`.
    pub(crate) fn handle_ipi(&self, cpu: usize, ipi: Ipi) {
        match ipi {
            Ipi::PushRt { partition } => {
                self.push_rt_tasks(cpu);
                let Some(domain) = self.domains.get(partition) else {
                    return;
                };
                if let Some(next) = domain.rto_push_next()
                    && self.ipis.send(next, ipi)
                {
                    self.counters.inc_push_ipi();
                    trace!(cpu, next, "rt push ipi forwarded");
                }
            }
        }
    }

    /// Run balancing queued on `cpu`'s runqueue. Pulls go first.
    pub(crate) fn run_balance_work(&self, cpu: usize, work: BalanceWork) {
        if work.contains(BalanceWork::MIGRATE) {
            self.migrate_misplaced(cpu);
        }
        if work.contains(BalanceWork::PULL_DL) {
            self.pull_dl_task(cpu);
        }
        if work.contains(BalanceWork::PULL_RT) {
            self.pull_rt_task(cpu);
        }
        if work.contains(BalanceWork::PUSH_DL) {
            self.push_dl_tasks(cpu);
        }
        if work.contains(BalanceWork::PUSH_RT) {
            self.push_rt_tasks(cpu);
        }
    }
}
