//! The scheduler: per-CPU runqueues, partitions and every public entry point.
//!
//! All entry points take the CPU or task they act on and the caller's clock
//! explicitly. Each one locks a single runqueue, mutates it through the
//! class dispatcher, publishes the result to the partition indexes and only
//! then, with the lock released, runs whatever balancing the classes queued.

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace};

use rtsched_atomic::{CounterSnapshot, SchedCounters};

use crate::balance::ipi::{Ipi, IpiMailboxes};
use crate::balance::Migration;
use crate::bandwidth::{DlBandwidthPool, RqBandwidth};
use crate::class::{CLASS_ORDER, Ctx, DequeueFlags, EnqueueFlags, SchedClass};
use crate::config::{BandwidthLimit, RtBandwidthConfig, SchedConfig};
use crate::deadline::entity::DlFlags;
use crate::deadline::{self, own_bw};
use crate::domain::RootDomain;
use crate::error::{SchedError, SchedResult};
use crate::fair::{FairQueueFactory, fifo_factory};
use crate::macros::warn_once;
use crate::observer::{NoopObserver, UtilObserver};
use crate::rq::{BalanceWork, Runqueue};
use crate::rt;
use crate::rt::bandwidth::RtRuntime;
use crate::task::{SchedAttr, SpawnParams, Task, TaskSnapshot, TaskState};
use crate::timer::{SoftTimerQueue, TimerEvent, TimerFacility};
use crate::types::{CpuMask, Policy, TaskId, is_dl_prio, is_rt_prio};

/// SMP real-time scheduler.
///
/// `Scheduler` is `Send + Sync`; different CPUs may be driven from different
/// threads concurrently.
///
/// # Example
///
/// ```
/// use rtsched::prelude::*;
///
/// # fn main() -> Result<(), SchedError> {
/// let sched = Scheduler::new(SchedConfig::builder().nr_cpus(2).build()?)?;
/// let id = sched.spawn(SpawnParams::new(SchedAttr::deadline(1_000_000, 10_000_000, 10_000_000)), 0)?;
/// sched.wake_up_new_task(id, 0)?;
/// let cpu = sched.task(id)?.cpu;
/// assert_eq!(sched.schedule(cpu, 0)?, Some(id));
/// # Ok(())
/// # }
/// ```
pub struct Scheduler {
    pub(crate) config: SchedConfig,
    pub(crate) rqs: Box<[Mutex<Runqueue>]>,
    pub(crate) domains: Box<[RootDomain]>,
    cpu_domain: Box<[usize]>,
    pub(crate) locator: RwLock<HashMap<TaskId, usize>>,
    next_id: AtomicU64,
    timers: Arc<dyn TimerFacility>,
    pub(crate) ipis: IpiMailboxes,
    pub(crate) counters: Arc<SchedCounters>,
    observer: Arc<dyn UtilObserver>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("nr_cpus", &self.config.nr_cpus)
            .field("partitions", &self.domains.len())
            .field("tasks", &self.locator.read().len())
            .finish_non_exhaustive()
    }
}

/// Dequeue, mutate and re-enqueue a task so every class sees a consistent
/// before/after picture, then run the class-change hooks.
fn change_task(
    ctx: &Ctx<'_>,
    rq: &mut Runqueue,
    id: TaskId,
    flags: EnqueueFlags,
    mutate: impl FnOnce(&mut Task),
) {
    let Some(task) = rq.tasks.get(&id) else {
        return;
    };
    let (old_class, old_prio, queued) = (task.class(), task.prio, task.is_queued());
    let running = rq.is_curr(id);

    if running && queued {
        old_class.update_curr(ctx, rq);
    }
    if queued {
        old_class.dequeue(ctx, rq, id, DequeueFlags::SAVE);
    }
    if running {
        old_class.put_prev(ctx, rq, id);
    }

    let Some(task) = rq.tasks.get_mut(&id) else {
        return;
    };
    mutate(task);
    let new_class = task.class();

    if queued {
        new_class.enqueue(ctx, rq, id, EnqueueFlags::RESTORE | flags);
    }
    if running {
        new_class.set_next(rq, id);
    }
    if old_class == new_class {
        new_class.prio_changed(ctx, rq, id, old_prio);
    } else {
        old_class.switched_from(ctx, rq, id);
        new_class.switched_to(ctx, rq, id);
    }
}

impl Scheduler {
    /// Build a scheduler with the FIFO fair-class stand-in, no utilization
    /// observer and a [`SoftTimerQueue`].
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidConfig`] when `config` fails validation.
    pub fn new(config: SchedConfig) -> SchedResult<Self> {
        Self::with_collaborators(
            config,
            fifo_factory(),
            Arc::new(NoopObserver),
            Arc::new(SoftTimerQueue::new()),
        )
    }

    /// Build a scheduler around caller-supplied collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidConfig`] when `config` fails validation.
    pub fn with_collaborators(
        config: SchedConfig,
        fair: FairQueueFactory,
        observer: Arc<dyn UtilObserver>,
        timers: Arc<dyn TimerFacility>,
    ) -> SchedResult<Self> {
        config.validate()?;
        let domains: Box<[RootDomain]> = config
            .partition_masks()
            .into_iter()
            .enumerate()
            .map(|(id, span)| RootDomain::new(id, span, &config))
            .collect();
        let mut cpu_domain = vec![0; config.nr_cpus];
        for domain in &*domains {
            for cpu in domain.span() {
                if let Some(slot) = cpu_domain.get_mut(cpu) {
                    *slot = domain.id();
                }
            }
        }
        let rqs = (0..config.nr_cpus)
            .map(|cpu| Mutex::new(Runqueue::new(cpu, fair(cpu))))
            .collect();

        info!(
            nr_cpus = config.nr_cpus,
            partitions = domains.len(),
            rt_push_ipi = config.balance.rt_push_ipi,
            "scheduler initialised"
        );
        Ok(Self {
            ipis: IpiMailboxes::new(config.nr_cpus),
            config,
            rqs,
            domains,
            cpu_domain: cpu_domain.into_boxed_slice(),
            locator: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timers,
            counters: Arc::new(SchedCounters::new()),
            observer,
        })
    }

    pub(crate) fn runqueue(&self, cpu: usize) -> SchedResult<&Mutex<Runqueue>> {
        self.rqs.get(cpu).ok_or(SchedError::InvalidCpu(cpu))
    }

    pub(crate) fn domain_of(&self, cpu: usize) -> &RootDomain {
        let idx = self.cpu_domain.get(cpu).copied().unwrap_or(0);
        &self.domains[idx]
    }

    pub(crate) fn ctx(&self, cpu: usize) -> Ctx<'_> {
        Ctx {
            config: &self.config,
            domain: self.domain_of(cpu),
            timers: &*self.timers,
            counters: &self.counters,
            observer: &*self.observer,
        }
    }

    fn missing(&self, id: TaskId) -> SchedError {
        let raw = id.as_u64();
        if raw > 0 && raw < self.next_id.load(Ordering::Acquire) {
            SchedError::TaskDead(id)
        } else {
            SchedError::TaskNotFound(id)
        }
    }

    /// Lock the runqueue that owns `id`.
    ///
    /// The locator is only a hint: ownership is re-checked under the lock and
    /// the lookup retried when the task moved in between.
    fn lock_task(&self, id: TaskId) -> SchedResult<MutexGuard<'_, Runqueue>> {
        loop {
            let cpu = self.locator.read().get(&id).copied();
            let Some(cpu) = cpu else {
                return Err(self.missing(id));
            };
            let rq = self.runqueue(cpu)?.lock();
            if rq.tasks.contains_key(&id) {
                return Ok(rq);
            }
            drop(rq);
            trace!(task = %id, cpu, "task moved while locating it");
        }
    }

    /// Publish, release the lock, then run the queued balancing.
    fn finish(&self, mut rq: MutexGuard<'_, Runqueue>) {
        let cpu = rq.cpu;
        rq.publish(self.domain_of(cpu));
        let work = rq.take_balance_work();
        drop(rq);
        if !work.is_empty() {
            self.run_balance_work(cpu, work);
        }
    }

    /// Create a task. It is not runnable until [`wake_up_new_task`](Self::wake_up_new_task).
    ///
    /// Deadline tasks go through admission control in the partition of
    /// their initial CPU.
    ///
    /// # Errors
    ///
    /// - [`SchedError::InvalidParams`] for bad priorities or deadline parameters
    /// - [`SchedError::InvalidCpu`] for a preferred CPU outside `0..nr_cpus`
    /// - [`SchedError::EmptyAffinity`] when the mask selects no CPU
    /// - [`SchedError::AffinityExcludesPartition`] for a deadline task that
    ///   may not run on every CPU of its partition
    /// - [`SchedError::AdmissionRejected`] when the bandwidth does not fit
    pub fn spawn(&self, params: SpawnParams, now: u64) -> SchedResult<TaskId> {
        let attr = params.attr;
        attr.validate_priority()?;
        let dl = if attr.policy == Policy::Deadline {
            Some(attr.dl.validate(&self.config)?)
        } else {
            None
        };

        let all = CpuMask::first_n(self.config.nr_cpus);
        let affinity = if params.affinity.is_empty() {
            all
        } else {
            params.affinity & all
        };
        let cpu = match params.cpu {
            Some(cpu) if cpu >= self.config.nr_cpus => return Err(SchedError::InvalidCpu(cpu)),
            Some(cpu) if affinity.contains(cpu) => cpu,
            _ => affinity.first().ok_or(SchedError::EmptyAffinity)?,
        };
        let domain = self.domain_of(cpu);
        if dl.is_some() && !domain.span().is_subset_of(affinity) {
            return Err(SchedError::AffinityExcludesPartition);
        }

        let bw = dl.map_or(0, |params| params.bandwidth());
        if bw > 0
            && let Err(err) = domain.dl_reserve(bw)
        {
            self.counters.inc_admission_reject();
            debug!(cpu, bw, partition = domain.id(), "deadline admission rejected");
            return Err(err);
        }

        let id = TaskId::new(self.next_id.fetch_add(1, Ordering::AcqRel));
        let mut task = Task::new(id, &attr, dl, affinity, cpu);
        if attr.policy == Policy::RoundRobin {
            task.rt.time_slice = self.config.rr_timeslice_ns;
        }

        let mut rq = self.runqueue(cpu)?.lock();
        rq.update_clock(now);
        rq.dl.bw.add_this(bw);
        rq.tasks.insert(id, task);
        self.locator.write().insert(id, cpu);
        drop(rq);

        debug!(task = %id, cpu, policy = %attr.policy, "task spawned");
        Ok(id)
    }

    /// Make a freshly spawned task runnable for the first time.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::TaskNotFound`] / [`SchedError::TaskDead`] for
    /// unknown tasks and [`SchedError::InvalidParams`] when the task was
    /// already woken once.
    pub fn wake_up_new_task(&self, id: TaskId, now: u64) -> SchedResult<()> {
        self.activate(id, now, true).map(|_| ())
    }

    /// Wake a sleeping task. Returns `false` if it was already runnable.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::TaskNotFound`] / [`SchedError::TaskDead`] for
    /// unknown tasks and [`SchedError::InvalidParams`] for a task that was
    /// never woken with [`wake_up_new_task`](Self::wake_up_new_task).
    pub fn wake_up(&self, id: TaskId, now: u64) -> SchedResult<bool> {
        self.activate(id, now, false)
    }

    fn activate(&self, id: TaskId, now: u64, new: bool) -> SchedResult<bool> {
        let mut rq = self.lock_task(id)?;
        rq.update_clock(now);
        let task = rq.tasks.get(&id).ok_or_else(|| self.missing(id))?;
        match (task.state, new) {
            (TaskState::Runnable, _) => return Ok(false),
            (TaskState::New, false) => {
                return Err(SchedError::invalid_params("task was never woken"));
            }
            (TaskState::Sleeping, true) => {
                return Err(SchedError::invalid_params("task was already woken"));
            }
            (TaskState::New, true) | (TaskState::Sleeping, false) => {}
        }

        let src = rq.cpu;
        let target = self.select_task_rq(&rq, id);
        if target != src {
            drop(rq);
            if self.move_task(src, target, id) == Migration::Moved {
                trace!(task = %id, from = src, to = target, "wakeup placed on another cpu");
            }
            rq = self.lock_task(id)?;
            rq.update_clock(now);
            if rq.tasks.get(&id).is_some_and(Task::is_queued) {
                return Ok(false);
            }
        }

        let ctx = self.ctx(rq.cpu);
        let Some(task) = rq.tasks.get_mut(&id) else {
            return Err(self.missing(id));
        };
        task.state = TaskState::Runnable;
        let class = task.class();
        let flags = if new {
            EnqueueFlags::NEW
        } else {
            EnqueueFlags::WAKEUP
        };
        class.enqueue(&ctx, &mut rq, id, flags);
        class.check_preempt(&ctx, &mut rq, id);
        class.task_woken(&ctx, &mut rq, id);
        trace!(task = %id, cpu = rq.cpu, %class, "task woken");
        self.finish(rq);
        Ok(true)
    }

    /// Wakeup placement: stay, unless the running real-time task would keep
    /// the woken one waiting and a better CPU exists.
    fn select_task_rq(&self, rq: &Runqueue, id: TaskId) -> usize {
        let ctx = self.ctx(rq.cpu);
        let (Some(task), Some(curr)) = (rq.tasks.get(&id), rq.curr_task()) else {
            return rq.cpu;
        };
        if !ctx.migratable(task) || !curr.is_queued() {
            return rq.cpu;
        }
        let target = match task.class() {
            SchedClass::Deadline => {
                let stuck = curr.class() == SchedClass::Deadline
                    && (!ctx.migratable(curr) || !task.dl.preempts(&curr.dl));
                if stuck {
                    deadline::find_later_cpu(&ctx, task, None)
                } else {
                    None
                }
            }
            SchedClass::Rt => {
                let stuck = matches!(curr.class(), SchedClass::Deadline | SchedClass::Rt)
                    && (!ctx.migratable(curr) || curr.prio <= task.prio);
                if stuck {
                    rt::find_lowest_cpu(&ctx, task, None)
                } else {
                    None
                }
            }
            SchedClass::Fair | SchedClass::Idle => None,
        };
        target.unwrap_or(rq.cpu)
    }

    /// Block a task. A running task keeps its CPU until the next [`schedule`](Self::schedule).
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::TaskNotFound`] / [`SchedError::TaskDead`] for unknown tasks.
    pub fn block(&self, id: TaskId, now: u64) -> SchedResult<()> {
        let mut rq = self.lock_task(id)?;
        rq.update_clock(now);
        let ctx = self.ctx(rq.cpu);
        let Some(task) = rq.tasks.get(&id) else {
            return Err(self.missing(id));
        };
        if !task.is_queued() {
            return Ok(());
        }
        let class = task.class();
        let running = rq.is_curr(id);
        if running {
            class.update_curr(&ctx, &mut rq);
        }
        class.dequeue(&ctx, &mut rq, id, DequeueFlags::SLEEP);
        if let Some(task) = rq.tasks.get_mut(&id) {
            task.state = TaskState::Sleeping;
        }
        if running {
            rq.resched_curr();
        }
        trace!(task = %id, cpu = rq.cpu, "task blocked");
        self.finish(rq);
        Ok(())
    }

    /// Remove a task for good, returning its bandwidth.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::TaskNotFound`] / [`SchedError::TaskDead`] for unknown tasks.
    pub fn exit(&self, id: TaskId, now: u64) -> SchedResult<()> {
        let mut rq = self.lock_task(id)?;
        rq.update_clock(now);
        let ctx = self.ctx(rq.cpu);
        let Some(task) = rq.tasks.get(&id) else {
            return Err(self.missing(id));
        };
        let (class, queued) = (task.class(), task.is_queued());
        let running = rq.is_curr(id);
        if running && queued {
            class.update_curr(&ctx, &mut rq);
        }
        if queued {
            class.dequeue(&ctx, &mut rq, id, DequeueFlags::SLEEP);
        }
        let Some(mut task) = rq.tasks.remove(&id) else {
            return Err(self.missing(id));
        };
        deadline::cancel_timer(&ctx, &mut task);

        let bw = own_bw(&task);
        if bw > 0 {
            if !rq.dl.bw.sub_this(bw) {
                warn_once!(cpu = rq.cpu, task = %id, "assigned bandwidth underflow on exit");
                self.counters.inc_invariant_clamp();
            }
            if !ctx.domain.dl_release(bw) {
                warn_once!(partition = ctx.domain.id(), "admitted bandwidth underflow on exit");
                self.counters.inc_invariant_clamp();
            }
        }
        self.locator.write().remove(&id);
        if running {
            rq.curr = None;
            rq.resched_curr();
        }
        debug!(task = %id, cpu = rq.cpu, runtime_ns = task.sum_exec_runtime, "task exited");
        self.finish(rq);
        Ok(())
    }

    /// Change a task's policy and parameters.
    ///
    /// Deadline bandwidth is re-admitted atomically: on rejection nothing changes.
    ///
    /// # Errors
    ///
    /// - [`SchedError::InvalidParams`] for bad priorities or deadline parameters
    /// - [`SchedError::AffinityExcludesPartition`] when switching to deadline
    ///   with an affinity narrower than the partition
    /// - [`SchedError::AdmissionRejected`] when the new bandwidth does not fit
    /// - [`SchedError::TaskNotFound`] / [`SchedError::TaskDead`] for unknown tasks
    pub fn set_scheduler(&self, id: TaskId, attr: SchedAttr, now: u64) -> SchedResult<()> {
        attr.validate_priority()?;
        let dl = if attr.policy == Policy::Deadline {
            Some(attr.dl.validate(&self.config)?)
        } else {
            None
        };

        let mut rq = self.lock_task(id)?;
        rq.update_clock(now);
        let ctx = self.ctx(rq.cpu);
        let Some(task) = rq.tasks.get(&id) else {
            return Err(self.missing(id));
        };
        if dl.is_some() && !ctx.domain.span().is_subset_of(task.affinity) {
            return Err(SchedError::AffinityExcludesPartition);
        }

        let old_bw = own_bw(task);
        let new_bw = dl.map_or(0, |params| params.bandwidth());
        let admitted = match (old_bw, new_bw) {
            (0, 0) => Ok(()),
            (0, new) => ctx.domain.dl_reserve(new),
            (_, 0) => Ok(()),
            (old, new) => ctx.domain.dl_update(old, new),
        };
        if let Err(err) = admitted {
            self.counters.inc_admission_reject();
            debug!(task = %id, old_bw, new_bw, "deadline admission rejected");
            return Err(err);
        }
        if old_bw > 0 && new_bw == 0 && !ctx.domain.dl_release(old_bw) {
            warn_once!(partition = ctx.domain.id(), "admitted bandwidth underflow on policy change");
            self.counters.inc_invariant_clamp();
        }

        let rr_slice = self.config.rr_timeslice_ns;
        change_task(&ctx, &mut rq, id, EnqueueFlags::empty(), |task| {
            task.policy = attr.policy;
            task.rt_priority = attr.rt_priority;
            task.nice = attr.nice;
            task.normal_prio = attr.normal_prio();
            match dl {
                Some(params) => {
                    deadline::cancel_timer(&ctx, task);
                    task.dl.set_params(params);
                }
                None if !task.dl.is_boosted() => {
                    deadline::cancel_timer(&ctx, task);
                    task.dl.clear_params();
                }
                None => {}
            }
            task.rt.time_slice = if attr.policy == Policy::RoundRobin {
                rr_slice
            } else {
                0
            };
            task.prio = task.effective_prio();
        });
        if old_bw != new_bw {
            if !rq.dl.bw.sub_this(old_bw) {
                warn_once!(cpu = rq.cpu, task = %id, "assigned bandwidth underflow on policy change");
                self.counters.inc_invariant_clamp();
            }
            rq.dl.bw.add_this(new_bw);
        }
        debug!(task = %id, policy = %attr.policy, "scheduling policy changed");
        self.finish(rq);
        Ok(())
    }

    /// Restrict a task to `mask`, migrating it if its CPU is no longer allowed.
    ///
    /// # Errors
    ///
    /// - [`SchedError::EmptyAffinity`] when the mask selects no CPU of the
    ///   task's partition
    /// - [`SchedError::AffinityExcludesPartition`] for deadline tasks whose
    ///   mask does not span their partition
    /// - [`SchedError::TaskNotFound`] / [`SchedError::TaskDead`] for unknown tasks
    pub fn set_affinity(&self, id: TaskId, mask: CpuMask, now: u64) -> SchedResult<()> {
        let mask = mask & CpuMask::first_n(self.config.nr_cpus);
        if mask.is_empty() {
            return Err(SchedError::EmptyAffinity);
        }
        let mut rq = self.lock_task(id)?;
        rq.update_clock(now);
        let ctx = self.ctx(rq.cpu);
        let Some(task) = rq.tasks.get(&id) else {
            return Err(self.missing(id));
        };
        let span = ctx.domain.span();
        if task.policy == Policy::Deadline && !span.is_subset_of(mask) {
            return Err(SchedError::AffinityExcludesPartition);
        }
        let allowed = mask & span;
        let Some(fallback) = allowed.first() else {
            return Err(SchedError::EmptyAffinity);
        };

        change_task(&ctx, &mut rq, id, EnqueueFlags::empty(), |task| {
            task.affinity = mask;
        });
        let src = rq.cpu;
        self.finish(rq);
        if allowed.contains(src) {
            return Ok(());
        }

        let backoff = crossbeam::utils::Backoff::new();
        for _ in 0..self.config.balance.max_push_tries.max(1) {
            match self.move_task(src, fallback, id) {
                Migration::Moved => {
                    debug!(task = %id, from = src, to = fallback, "affinity change migrated task");
                    return Ok(());
                }
                Migration::Stale => return Ok(()),
                Migration::Contended => backoff.snooze(),
            }
        }

        // The next schedule on `src` moves it.
        self.counters.inc_balance_abandoned();
        self.runqueue(src)?.lock().mark_misplaced(id);
        debug!(task = %id, cpu = src, "affinity migration deferred");
        Ok(())
    }

    /// Priority inheritance: run `id` at `donor`'s priority, or drop the boost
    /// when `donor` is `None`.
    ///
    /// A deadline donor lends its parameters; the boosted entity is never
    /// throttled while it holds them.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidParams`] when a task donates to itself and
    /// [`SchedError::TaskNotFound`] / [`SchedError::TaskDead`] for unknown tasks.
    pub fn rt_mutex_setprio(&self, id: TaskId, donor: Option<TaskId>, now: u64) -> SchedResult<()> {
        let donor_state = match donor {
            Some(donor_id) if donor_id == id => {
                return Err(SchedError::invalid_params("a task cannot donate to itself"));
            }
            Some(donor_id) => {
                let rq = self.lock_task(donor_id)?;
                let donor_task = rq.tasks.get(&donor_id).ok_or_else(|| self.missing(donor_id))?;
                Some((donor_task.prio, donor_task.dl.effective_params(), donor_task.dl.deadline))
            }
            None => None,
        };

        let mut rq = self.lock_task(id)?;
        rq.update_clock(now);
        let ctx = self.ctx(rq.cpu);
        let Some(task) = rq.tasks.get(&id) else {
            return Err(self.missing(id));
        };
        let old_prio = task.prio;
        let new_prio = donor_state.map_or(task.normal_prio, |(prio, _, _)| prio.min(task.normal_prio));

        let mut flags = EnqueueFlags::empty();
        let mut lend = None;
        if let Some((donor_prio, params, donor_deadline)) = donor_state
            && is_dl_prio(new_prio)
            && is_dl_prio(donor_prio)
        {
            let donor_preempts = donor_deadline < task.dl.deadline;
            if !is_dl_prio(task.normal_prio) || donor_preempts {
                lend = Some(params);
                flags |= EnqueueFlags::REPLENISH;
            }
        } else if is_rt_prio(new_prio) && old_prio < new_prio {
            flags |= EnqueueFlags::HEAD;
        }
        if new_prio == old_prio && lend.is_none() && !task.dl.is_boosted() {
            if let Some(task) = rq.tasks.get_mut(&id) {
                task.pi_donor = donor;
                task.pi_prio = donor_state.map(|(prio, _, _)| prio);
            }
            drop(rq);
            return Ok(());
        }

        change_task(&ctx, &mut rq, id, flags, |task| {
            task.pi_donor = donor;
            task.pi_prio = donor_state.map(|(prio, _, _)| prio);
            match lend {
                Some(params) => {
                    task.dl.pi = Some(params);
                    task.dl.flags.insert(DlFlags::BOOSTED);
                }
                None => {
                    task.dl.pi = None;
                    task.dl.flags.remove(DlFlags::BOOSTED);
                    if task.policy != Policy::Deadline && !is_dl_prio(new_prio) {
                        deadline::cancel_timer(&ctx, task);
                        task.dl.clear_params();
                    }
                }
            }
            task.prio = task.effective_prio();
        });
        debug!(task = %id, ?donor, old_prio, new_prio, "inherited priority changed");
        self.finish(rq);
        Ok(())
    }

    /// Install new RT group bandwidth for a partition.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidConfig`] for invalid settings and
    /// [`SchedError::InvalidParams`] for an unknown partition.
    pub fn set_rt_bandwidth(&self, partition: usize, rt: RtBandwidthConfig, now: u64) -> SchedResult<()> {
        rt.validate()?;
        let domain = self
            .domains
            .get(partition)
            .ok_or_else(|| SchedError::invalid_params(format!("unknown partition {partition}")))?;
        domain.rt_bw.set_config(rt);
        if let Some(handle) = domain.rt_bw.stop_timer() {
            let _pending = self.timers.cancel(handle);
        }

        for cpu in domain.span() {
            let mut rq = self.runqueue(cpu)?.lock();
            rq.update_clock(now);
            let ctx = self.ctx(cpu);
            if rt.runtime_ns.is_none() && rq.rt.throttled {
                rq.rt.throttled = false;
                self.counters.inc_rt_unthrottle();
                rq.resched_curr();
            }
            if rq.rt.nr_running() > 0 || rq.rt.throttled {
                rt::start_period_timer(&ctx, rq.clock);
            }
            self.finish(rq);
        }
        info!(partition, runtime_ns = ?rt.runtime_ns, period_ns = rt.period_ns, "rt bandwidth updated");
        Ok(())
    }

    /// Change a partition's deadline bandwidth ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidConfig`] for invalid settings,
    /// [`SchedError::InvalidParams`] for an unknown partition and
    /// [`SchedError::AdmissionRejected`] when already admitted bandwidth
    /// would exceed the new ceiling.
    pub fn set_dl_bandwidth(&self, partition: usize, limit: BandwidthLimit) -> SchedResult<()> {
        limit.validate("dl_bandwidth")?;
        let domain = self
            .domains
            .get(partition)
            .ok_or_else(|| SchedError::invalid_params(format!("unknown partition {partition}")))?;
        domain.dl_bw.lock().set_ceiling(domain.weight(), limit.ratio())?;
        info!(partition, runtime_ns = ?limit.runtime_ns, period_ns = limit.period_ns, "deadline bandwidth updated");
        Ok(())
    }

    /// Pick the next task for `cpu` and make it current.
    ///
    /// Before picking, work is pulled from sibling CPUs when the previous
    /// task's class ran dry locally; after picking, queued pushes run.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidCpu`] for an unknown CPU.
    pub fn schedule(&self, cpu: usize, now: u64) -> SchedResult<Option<TaskId>> {
        let rq_lock = self.runqueue(cpu)?;
        let ctx = self.ctx(cpu);

        let pulls = {
            let mut rq = rq_lock.lock();
            rq.update_clock(now);
            let prev = rq
                .curr_task()
                .map(|task| (task.class(), task.prio, task.is_queued()));
            let mut pulls = BalanceWork::empty();
            if let Some((class, prio, queued)) = prev {
                if queued {
                    class.update_curr(&ctx, &mut rq);
                }
                match class {
                    SchedClass::Deadline if rq.dl.nr_running() == 0 => {
                        pulls |= BalanceWork::PULL_DL;
                    }
                    SchedClass::Rt if rq.rt.highest_prio().curr > prio => {
                        pulls |= BalanceWork::PULL_RT;
                    }
                    _ => {}
                }
            }
            if rq.nothing_runnable() {
                pulls |= BalanceWork::PULL_DL | BalanceWork::PULL_RT;
            }
            rq.publish(ctx.domain);
            pulls | rq.take_balance_work()
        };
        if !pulls.is_empty() {
            self.run_balance_work(cpu, pulls);
        }

        let mut rq = rq_lock.lock();
        rq.update_clock(now);
        let prev = rq.curr;
        if let Some(prev_id) = prev
            && let Some(class) = rq.tasks.get(&prev_id).map(Task::class)
        {
            class.put_prev(&ctx, &mut rq, prev_id);
        }
        let next = CLASS_ORDER
            .iter()
            .find_map(|class| class.pick_next(&rq).map(|id| (*class, id)));
        rq.curr = next.map(|(_, id)| id);
        if let Some((class, id)) = next {
            class.set_next(&mut rq, id);
        }
        if rq.curr != prev {
            rq.nr_switches += 1;
            self.counters.inc_context_switch();
            trace!(cpu, prev = ?prev, next = ?rq.curr, "context switch");
        }
        rq.need_resched = false;
        let curr = rq.curr;
        self.finish(rq);
        Ok(curr)
    }

    /// Periodic tick on `cpu`: charge the running task and run its class tick.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidCpu`] for an unknown CPU.
    pub fn scheduler_tick(&self, cpu: usize, now: u64) -> SchedResult<()> {
        let mut rq = self.runqueue(cpu)?.lock();
        rq.update_clock(now);
        let ctx = self.ctx(cpu);
        if let Some(id) = rq.curr
            && let Some(class) = rq.tasks.get(&id).filter(|t| t.is_queued()).map(Task::class)
        {
            class.task_tick(&ctx, &mut rq, id);
        }
        if rq.dl.has_pushable() {
            rq.queue_balance(BalanceWork::PUSH_DL);
        }
        if rq.rt.has_pushable() {
            rq.queue_balance(BalanceWork::PUSH_RT);
        }
        self.finish(rq);
        Ok(())
    }

    /// The running task of `cpu` gives up the CPU within its class.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidCpu`] for an unknown CPU.
    pub fn yield_current(&self, cpu: usize, now: u64) -> SchedResult<()> {
        let mut rq = self.runqueue(cpu)?.lock();
        rq.update_clock(now);
        let ctx = self.ctx(cpu);
        if let Some(class) = rq.curr_task().filter(|t| t.is_queued()).map(Task::class) {
            class.yield_task(&ctx, &mut rq);
            rq.resched_curr();
        }
        self.finish(rq);
        Ok(())
    }

    /// Deliver every timer due at `now`. Returns how many expiries were handled.
    pub fn run_timers(&self, now: u64) -> usize {
        let due = self.timers.expire(now);
        let count = due.len();
        for (_, event) in due {
            let _applied = self.fire_timer(event, now);
        }
        count
    }

    /// Deliver one timer expiry. Returns `false` when it was stale.
    pub fn fire_timer(&self, event: TimerEvent, now: u64) -> bool {
        match event {
            TimerEvent::DlReplenish { task, generation } => {
                let Ok(mut rq) = self.lock_task(task) else {
                    self.counters.inc_timer_noop();
                    trace!(task = %task, "replenishment for a task that is gone");
                    return false;
                };
                rq.update_clock(now);
                let ctx = self.ctx(rq.cpu);
                let applied = deadline::replenish_timer(&ctx, &mut rq, task, generation);
                if !applied {
                    self.counters.inc_timer_noop();
                    trace!(task = %task, generation, "stale replenishment timer");
                }
                self.finish(rq);
                applied
            }
            TimerEvent::RtPeriod {
                partition,
                generation,
            } => self.rt_period_timer(partition, generation, now),
        }
    }

    fn rt_period_timer(&self, partition: usize, generation: u64, now: u64) -> bool {
        let Some(domain) = self.domains.get(partition) else {
            self.counters.inc_timer_noop();
            return false;
        };
        let Some(overrun) = domain.rt_bw.begin_expiry(generation, now) else {
            self.counters.inc_timer_noop();
            trace!(partition, generation, "stale rt period timer");
            return false;
        };

        let mut idle = true;
        for cpu in domain.span() {
            let Ok(rq_lock) = self.runqueue(cpu) else {
                continue;
            };
            let mut rq = rq_lock.lock();
            rq.update_clock(now);
            let queued = rq.rt.nr_running() > 0;
            let tick = domain.rt_bw.period_tick(cpu, overrun, queued, rq.rt.throttled);
            if tick.unthrottle && rq.rt.throttled {
                rq.rt.throttled = false;
                self.counters.inc_rt_unthrottle();
                debug!(cpu, "rt group unthrottled");
                if queued {
                    rq.resched_curr();
                }
            }
            idle &= tick.idle;
            self.finish(rq);
        }

        if let Some((expires, next_generation)) = domain.rt_bw.finish_expiry(idle) {
            let handle = self.timers.arm(
                expires,
                TimerEvent::RtPeriod {
                    partition,
                    generation: next_generation,
                },
            );
            domain.rt_bw.set_timer_handle(next_generation, handle);
        }
        true
    }

    /// Expiry time of the earliest pending timer.
    #[must_use]
    pub fn next_timer(&self) -> Option<u64> {
        self.timers.next_expiry()
    }

    /// Handle every IPI queued for `cpu`. Returns how many were handled.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidCpu`] for an unknown CPU.
    pub fn process_ipis(&self, cpu: usize) -> SchedResult<usize> {
        let _rq = self.runqueue(cpu)?;
        let mut handled = 0;
        while let Some(ipi) = self.ipis.try_recv(cpu) {
            self.handle_ipi(cpu, ipi);
            handled += 1;
        }
        Ok(handled)
    }

    /// Deliver IPIs on every CPU until no mailbox holds any.
    pub fn drain_ipis(&self) -> usize {
        let mut total = 0;
        loop {
            let mut handled = 0;
            for cpu in 0..self.config.nr_cpus {
                while let Some(ipi) = self.ipis.try_recv(cpu) {
                    self.handle_ipi(cpu, ipi);
                    handled += 1;
                }
            }
            if handled == 0 {
                return total;
            }
            total += handled;
        }
    }

    /// IPIs waiting in `cpu`'s mailbox.
    #[must_use]
    pub fn pending_ipis(&self, cpu: usize) -> usize {
        self.ipis.pending(cpu)
    }

    /// Send an IPI to `cpu`, as another CPU of the machine would.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidCpu`] for an unknown CPU.
    pub fn send_ipi(&self, cpu: usize, ipi: Ipi) -> SchedResult<()> {
        if self.ipis.send(cpu, ipi) {
            Ok(())
        } else {
            Err(SchedError::InvalidCpu(cpu))
        }
    }

    /// Running task of `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidCpu`] for an unknown CPU.
    pub fn current(&self, cpu: usize) -> SchedResult<Option<TaskId>> {
        Ok(self.runqueue(cpu)?.lock().curr)
    }

    /// Whether `cpu` must call [`schedule`](Self::schedule).
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidCpu`] for an unknown CPU.
    pub fn need_resched(&self, cpu: usize) -> SchedResult<bool> {
        Ok(self.runqueue(cpu)?.lock().need_resched)
    }

    /// Tasks queued on `cpu` across every class, throttled ones included.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidCpu`] for an unknown CPU.
    pub fn nr_running(&self, cpu: usize) -> SchedResult<usize> {
        Ok(self.runqueue(cpu)?.lock().nr_running())
    }

    /// Context switches performed on `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidCpu`] for an unknown CPU.
    pub fn nr_switches(&self, cpu: usize) -> SchedResult<u64> {
        Ok(self.runqueue(cpu)?.lock().nr_switches)
    }

    /// Read-only copy of a task's scheduling state.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::TaskNotFound`] / [`SchedError::TaskDead`] for unknown tasks.
    pub fn task(&self, id: TaskId) -> SchedResult<TaskSnapshot> {
        let rq = self.lock_task(id)?;
        let task = rq.tasks.get(&id).ok_or_else(|| self.missing(id))?;
        Ok(task.snapshot(rq.is_curr(id)))
    }

    /// Admission pool of a partition.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidParams`] for an unknown partition.
    pub fn dl_bandwidth(&self, partition: usize) -> SchedResult<DlBandwidthPool> {
        self.domains
            .get(partition)
            .map(|domain| domain.dl_bw.lock().clone())
            .ok_or_else(|| SchedError::invalid_params(format!("unknown partition {partition}")))
    }

    /// Bandwidth counters of `cpu`'s deadline runqueue.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidCpu`] for an unknown CPU.
    pub fn rq_bandwidth(&self, cpu: usize) -> SchedResult<RqBandwidth> {
        Ok(self.runqueue(cpu)?.lock().dl.bandwidth())
    }

    /// Whether `cpu`'s RT group is throttled.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidCpu`] for an unknown CPU.
    pub fn rt_throttled(&self, cpu: usize) -> SchedResult<bool> {
        Ok(self.runqueue(cpu)?.lock().rt.is_throttled())
    }

    /// RT runtime slot of `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidCpu`] for an unknown CPU.
    pub fn rt_runtime(&self, cpu: usize) -> SchedResult<RtRuntime> {
        let _rq = self.runqueue(cpu)?;
        self.domain_of(cpu)
            .rt_bw
            .runtime_of(cpu)
            .ok_or(SchedError::InvalidCpu(cpu))
    }

    /// Whether a partition's admitted deadline bandwidth would still fit on
    /// `cpus` CPUs.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidParams`] for an unknown partition.
    pub fn can_shrink_partition(&self, partition: usize, cpus: usize) -> SchedResult<bool> {
        Ok(self.dl_bandwidth(partition)?.fits_on(cpus))
    }

    /// Event counters since construction.
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Counters accumulated since the last drain, zeroing them.
    ///
    /// Meant for a monitor sampling the scheduler at a fixed interval.
    #[must_use]
    pub fn take_counters(&self) -> CounterSnapshot {
        let snapshot = self.counters.snapshot_and_reset();
        trace!(
            switches = snapshot.context_switches,
            abandon_pct = snapshot.balance_abandon_percent(),
            "counters drained"
        );
        snapshot
    }

    /// Zero every event counter.
    pub fn reset_counters(&self) {
        self.counters.reset();
    }

    /// Shared handle to the live event counters.
    #[must_use]
    pub fn counters_handle(&self) -> Arc<SchedCounters> {
        Arc::clone(&self.counters)
    }

    /// Partition holding `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidCpu`] for an unknown CPU.
    pub fn partition_of(&self, cpu: usize) -> SchedResult<usize> {
        self.cpu_domain
            .get(cpu)
            .copied()
            .ok_or(SchedError::InvalidCpu(cpu))
    }

    /// Partition by index.
    #[must_use]
    pub fn domain(&self, partition: usize) -> Option<&RootDomain> {
        self.domains.get(partition)
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Verify the structural invariants of every runqueue and partition.
    ///
    /// Locks every runqueue in ascending CPU order for the duration.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvariantViolation`] describing the first
    /// violation found.
    pub fn check_invariants(&self) -> SchedResult<()> {
        let guards: Vec<MutexGuard<'_, Runqueue>> = self.rqs.iter().map(|rq| rq.lock()).collect();
        let locator = self.locator.read();
        let mut nr_tasks = 0;

        for rq in &guards {
            let cpu = rq.cpu;
            let mut running_bw = 0u64;
            let mut this_bw = 0u64;
            for (id, task) in &rq.tasks {
                nr_tasks += 1;
                if task.cpu != cpu || locator.get(id) != Some(&cpu) {
                    return Err(SchedError::invariant(format!("{id} is misplaced on cpu {cpu}")));
                }
                let bw = own_bw(task);
                this_bw = this_bw.saturating_add(bw);
                if task.is_queued() {
                    running_bw = running_bw.saturating_add(bw);
                }
                if task.class() != SchedClass::Deadline {
                    continue;
                }
                let in_tree = task.dl.tree_key.is_some();
                if task.dl.is_throttled() && in_tree {
                    return Err(SchedError::invariant(format!("throttled {id} is still queued")));
                }
                if in_tree && !task.dl.is_boosted() && task.dl.runtime <= 0 {
                    return Err(SchedError::invariant(format!(
                        "{id} is queued with runtime {}",
                        task.dl.runtime
                    )));
                }
                if task.is_queued() && !task.dl.is_throttled() && !in_tree {
                    return Err(SchedError::invariant(format!("runnable {id} is not queued")));
                }
            }
            if !rq.rt.is_consistent() {
                return Err(SchedError::invariant(format!("rt bitmap out of sync on cpu {cpu}")));
            }
            let bw = rq.dl.bandwidth();
            if bw.running_bw() != running_bw {
                return Err(SchedError::invariant(format!(
                    "running_bw {} != {running_bw} on cpu {cpu}",
                    bw.running_bw()
                )));
            }
            if bw.this_bw() != this_bw {
                return Err(SchedError::invariant(format!(
                    "this_bw {} != {this_bw} on cpu {cpu}",
                    bw.this_bw()
                )));
            }
        }
        if nr_tasks != locator.len() {
            return Err(SchedError::invariant("task locator is out of sync"));
        }

        for domain in &*self.domains {
            let assigned = domain
                .span()
                .iter()
                .filter_map(|cpu| guards.get(cpu))
                .fold(0u64, |sum, rq| sum.saturating_add(rq.dl.bandwidth().this_bw()));
            let pool = domain.dl_bw.lock();
            if assigned != pool.total_bw() {
                return Err(SchedError::invariant(format!(
                    "partition {} admitted {} but runqueues hold {assigned}",
                    domain.id(),
                    pool.total_bw()
                )));
            }
            if !pool.fits_on(domain.weight()) {
                return Err(SchedError::invariant(format!(
                    "partition {} exceeds its bandwidth ceiling",
                    domain.id()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::BW_UNIT;

    const MS: u64 = 1_000_000;

    fn scheduler(cpus: usize) -> Result<Scheduler, SchedError> {
        Scheduler::new(
            SchedConfig::builder()
                .nr_cpus(cpus)
                .rt_bandwidth(RtBandwidthConfig::unlimited())
                .build()?,
        )
    }

    #[test]
    fn test_scheduler_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Scheduler>();
    }

    #[test]
    fn test_unknown_and_dead_tasks() -> Result<(), Box<dyn std::error::Error>> {
        let sched = scheduler(1)?;
        let id = sched.spawn(SpawnParams::new(SchedAttr::other(0)), 0)?;
        sched.exit(id, 0)?;
        assert_eq!(sched.task(id).err(), Some(SchedError::TaskDead(id)));
        let ghost = TaskId::new(999);
        assert_eq!(sched.wake_up(ghost, 0).err(), Some(SchedError::TaskNotFound(ghost)));
        Ok(())
    }

    #[test]
    fn test_spawn_validates_placement() -> Result<(), Box<dyn std::error::Error>> {
        let sched = scheduler(2)?;
        let fifo = SchedAttr::fifo(10);
        assert_eq!(
            sched.spawn(SpawnParams::new(fifo).on_cpu(7), 0).err(),
            Some(SchedError::InvalidCpu(7))
        );
        assert_eq!(
            sched.spawn(SpawnParams::new(fifo).with_affinity(CpuMask::single(9)), 0).err(),
            Some(SchedError::EmptyAffinity)
        );
        let dl = SchedAttr::deadline(MS, 10 * MS, 10 * MS);
        assert_eq!(
            sched.spawn(SpawnParams::new(dl).with_affinity(CpuMask::single(0)), 0).err(),
            Some(SchedError::AffinityExcludesPartition)
        );
        let id = sched.spawn(SpawnParams::new(fifo).with_affinity(CpuMask::single(1)).on_cpu(0), 0)?;
        assert_eq!(sched.task(id)?.cpu, 1);
        Ok(())
    }

    #[test]
    fn test_set_scheduler_moves_bandwidth() -> Result<(), Box<dyn std::error::Error>> {
        let sched = scheduler(1)?;
        let id = sched.spawn(SpawnParams::new(SchedAttr::fifo(10)), 0)?;
        sched.wake_up_new_task(id, 0)?;
        sched.set_scheduler(id, SchedAttr::deadline(10 * MS, 100 * MS, 100 * MS), MS)?;
        let snap = sched.task(id)?;
        assert_eq!(snap.class, SchedClass::Deadline);
        assert_eq!(sched.dl_bandwidth(0)?.total_bw(), BW_UNIT / 10);
        sched.check_invariants()?;

        sched.set_scheduler(id, SchedAttr::other(0), 2 * MS)?;
        assert_eq!(sched.task(id)?.class, SchedClass::Fair);
        assert_eq!(sched.dl_bandwidth(0)?.total_bw(), 0);
        assert_eq!(sched.rq_bandwidth(0)?, RqBandwidth::default());
        sched.check_invariants()?;
        Ok(())
    }

    #[test]
    fn test_rejected_policy_change_leaves_task_untouched() -> Result<(), Box<dyn std::error::Error>> {
        let config = SchedConfig::builder()
            .nr_cpus(1)
            .dl_bandwidth(BandwidthLimit::fraction(1, 2))
            .build()?;
        let sched = Scheduler::new(config)?;
        let id = sched.spawn(SpawnParams::new(SchedAttr::fifo(5)), 0)?;
        let err = sched.set_scheduler(id, SchedAttr::deadline(60 * MS, 100 * MS, 100 * MS), 0);
        assert!(matches!(err, Err(SchedError::AdmissionRejected { .. })));
        assert_eq!(sched.task(id)?.policy, Policy::Fifo);
        assert_eq!(sched.counters().admission_rejects, 1);
        Ok(())
    }

    #[test]
    fn test_affinity_change_migrates_sleeping_task() -> Result<(), Box<dyn std::error::Error>> {
        let sched = scheduler(3)?;
        let id = sched.spawn(SpawnParams::new(SchedAttr::fifo(10)).on_cpu(0), 0)?;
        sched.set_affinity(id, CpuMask::single(2), 0)?;
        assert_eq!(sched.task(id)?.cpu, 2);
        assert_eq!(sched.set_affinity(id, CpuMask::EMPTY, 0).err(), Some(SchedError::EmptyAffinity));
        sched.check_invariants()?;
        Ok(())
    }

    #[test]
    fn test_affinity_change_gives_up_on_busy_destination() -> Result<(), Box<dyn std::error::Error>> {
        let sched = scheduler(2)?;
        let id = sched.spawn(SpawnParams::new(SchedAttr::round_robin(20)).on_cpu(0), 0)?;
        sched.wake_up_new_task(id, 0)?;
        assert_eq!(sched.schedule(0, 0)?, Some(id));

        let held = sched.rqs.get(1).ok_or("no cpu 1")?.lock();
        sched.set_affinity(id, CpuMask::single(1), MS)?;
        assert_eq!(sched.task(id)?.cpu, 0);
        assert!(sched.need_resched(0)?);
        assert_eq!(sched.counters().balance_abandoned, 1);
        drop(held);

        assert_eq!(sched.schedule(0, 2 * MS)?, None);
        assert_eq!(sched.task(id)?.cpu, 1);
        assert_eq!(sched.schedule(1, 2 * MS)?, Some(id));
        sched.check_invariants()?;
        Ok(())
    }

    #[test]
    fn test_counters_drain_and_reset() -> Result<(), Box<dyn std::error::Error>> {
        let sched = scheduler(1)?;
        let id = sched.spawn(SpawnParams::new(SchedAttr::fifo(10)), 0)?;
        sched.wake_up_new_task(id, 0)?;
        sched.schedule(0, 0)?;

        let drained = sched.take_counters();
        assert_eq!(drained.context_switches, 1);
        assert_eq!(sched.counters(), CounterSnapshot::default());

        sched.block(id, MS)?;
        sched.schedule(0, MS)?;
        assert_eq!(sched.counters().context_switches, 1);
        sched.reset_counters();
        assert_eq!(sched.counters(), CounterSnapshot::default());
        Ok(())
    }

    #[test]
    fn test_block_keeps_cpu_until_schedule() -> Result<(), Box<dyn std::error::Error>> {
        let sched = scheduler(1)?;
        let id = sched.spawn(SpawnParams::new(SchedAttr::round_robin(20)), 0)?;
        sched.wake_up_new_task(id, 0)?;
        assert_eq!(sched.schedule(0, 0)?, Some(id));
        sched.block(id, 5 * MS)?;
        assert!(sched.need_resched(0)?);
        assert_eq!(sched.current(0)?, Some(id));
        assert_eq!(sched.schedule(0, 5 * MS)?, None);
        assert_eq!(sched.task(id)?.state, TaskState::Sleeping);
        assert!(sched.wake_up(id, 6 * MS)?);
        assert!(!sched.wake_up(id, 6 * MS)?);
        Ok(())
    }

    #[test]
    fn test_shrink_check() -> Result<(), Box<dyn std::error::Error>> {
        let sched = scheduler(2)?;
        let attr = SchedAttr::deadline(60 * MS, 100 * MS, 100 * MS);
        let _a = sched.spawn(SpawnParams::new(attr), 0)?;
        assert!(sched.can_shrink_partition(0, 1)?);
        let _b = sched.spawn(SpawnParams::new(attr), 0)?;
        assert!(!sched.can_shrink_partition(0, 1)?);
        assert!(sched.can_shrink_partition(0, 2)?);
        Ok(())
    }
}
