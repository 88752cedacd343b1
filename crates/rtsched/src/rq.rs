//! Per-CPU runqueue.
//!
//! A [`Runqueue`] owns every task assigned to its CPU together with the
//! per-class queues. It is always accessed through its CPU's mutex; the
//! partition indexes (`cpupri`, `cpudl`, overload masks) are refreshed from
//! it by [`Runqueue::publish`] before that lock is released.

use bitflags::bitflags;
use std::collections::HashMap;

use crate::class::SchedClass;
use crate::cpupri::{self, CPUPRI_HIGHER, CPUPRI_IDLE, CPUPRI_NORMAL};
use crate::deadline::rq::DlRunqueue;
use crate::domain::RootDomain;
use crate::fair::FairQueue;
use crate::rt::rq::RtRunqueue;
use crate::task::Task;
use crate::types::{MAX_PRIO, TaskId};

bitflags! {
    /// Balancing queued while the runqueue lock was held, run after release.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct BalanceWork: u8 {
        const PUSH_DL = 1 << 0;
        const PUSH_RT = 1 << 1;
        const PULL_DL = 1 << 2;
        const PULL_RT = 1 << 3;
        /// Tasks whose affinity no longer covers this CPU.
        const MIGRATE = 1 << 4;
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Published {
    cpupri: Option<usize>,
    earliest_dl: Option<u64>,
}

/// Runqueue of one CPU.
#[derive(Debug)]
pub(crate) struct Runqueue {
    pub(crate) cpu: usize,
    pub(crate) clock: u64,
    pub(crate) curr: Option<TaskId>,
    pub(crate) tasks: HashMap<TaskId, Task>,
    pub(crate) dl: DlRunqueue,
    pub(crate) rt: RtRunqueue,
    pub(crate) fair: Box<dyn FairQueue>,
    pub(crate) need_resched: bool,
    pub(crate) nr_switches: u64,
    pub(crate) misplaced: Vec<TaskId>,
    balance: BalanceWork,
    published: Published,
}

impl Runqueue {
    pub(crate) fn new(cpu: usize, fair: Box<dyn FairQueue>) -> Self {
        Self {
            cpu,
            clock: 0,
            curr: None,
            tasks: HashMap::new(),
            dl: DlRunqueue::default(),
            rt: RtRunqueue::default(),
            fair,
            need_resched: false,
            nr_switches: 0,
            misplaced: Vec::new(),
            balance: BalanceWork::empty(),
            published: Published {
                cpupri: Some(CPUPRI_IDLE),
                earliest_dl: None,
            },
        }
    }

    /// The clock never runs backwards; stale timestamps are ignored.
    pub(crate) fn update_clock(&mut self, now: u64) {
        self.clock = self.clock.max(now);
    }

    pub(crate) fn curr_task(&self) -> Option<&Task> {
        self.curr.and_then(|id| self.tasks.get(&id))
    }

    pub(crate) fn curr_class(&self) -> Option<SchedClass> {
        self.curr_task().map(Task::class)
    }

    /// Effective priority of the running task, `MAX_PRIO` when idle.
    pub(crate) fn curr_prio(&self) -> i32 {
        self.curr_task().map_or(MAX_PRIO, |task| task.prio)
    }

    pub(crate) fn is_curr(&self, id: TaskId) -> bool {
        self.curr == Some(id)
    }

    pub(crate) fn resched_curr(&mut self) {
        self.need_resched = true;
    }

    pub(crate) fn queue_balance(&mut self, work: BalanceWork) {
        self.balance |= work;
    }

    /// Leave `id` for the balancer to move off this CPU.
    pub(crate) fn mark_misplaced(&mut self, id: TaskId) {
        if !self.misplaced.contains(&id) {
            self.misplaced.push(id);
        }
        self.queue_balance(BalanceWork::MIGRATE);
        self.resched_curr();
    }

    pub(crate) fn take_balance_work(&mut self) -> BalanceWork {
        std::mem::take(&mut self.balance)
    }

    /// Queued tasks of every class, throttled RT tasks included.
    pub(crate) fn nr_running(&self) -> usize {
        self.dl.nr_running() + self.rt.nr_running() + self.fair.nr_running()
    }

    /// Whether `pick` would find nothing to run.
    pub(crate) fn nothing_runnable(&self) -> bool {
        self.dl.nr_running() == 0
            && (self.rt.nr_running() == 0 || self.rt.throttled)
            && self.fair.nr_running() == 0
    }

    fn cpupri_level(&self) -> usize {
        let curr_class = self.curr_class();
        if self.dl.nr_running() > 0 || curr_class == Some(SchedClass::Deadline) {
            return CPUPRI_HIGHER;
        }
        if let Some(prio) = self.rt.first_level().filter(|_| !self.rt.throttled) {
            return cpupri::convert(prio);
        }
        if self.fair.nr_running() > 0 || curr_class.is_some() {
            CPUPRI_NORMAL
        } else {
            CPUPRI_IDLE
        }
    }

    /// Level a push target must be strictly below.
    pub(crate) fn published_level(&self) -> usize {
        self.published.cpupri.unwrap_or(CPUPRI_IDLE)
    }

    /// Push this CPU's state into the partition indexes.
    pub(crate) fn publish(&mut self, domain: &RootDomain) {
        let level = self.cpupri_level();
        if self.published.cpupri != Some(level) {
            domain.cpupri.lock().set(self.cpu, level);
            self.published.cpupri = Some(level);
        }

        let earliest = self.dl.earliest().curr;
        if self.published.earliest_dl != earliest {
            let mut cpudl = domain.cpudl.lock();
            match earliest {
                Some(deadline) => cpudl.set(self.cpu, deadline),
                None => cpudl.clear(self.cpu),
            }
            self.published.earliest_dl = earliest;
        }

        let dl_overloaded = self.dl.has_pushable();
        if self.dl.overloaded != dl_overloaded {
            domain.set_dl_overload(self.cpu, dl_overloaded);
            self.dl.overloaded = dl_overloaded;
        }
        let rt_overloaded = self.rt.has_pushable();
        if self.rt.overloaded != rt_overloaded {
            domain.set_rt_overload(self.cpu, rt_overloaded);
            self.rt.overloaded = rt_overloaded;
        }
    }
}
