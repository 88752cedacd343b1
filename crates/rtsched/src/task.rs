//! Tasks, their scheduling attributes and read-only snapshots.

use serde::{Deserialize, Serialize};

use crate::bandwidth::DlParams;
use crate::class::SchedClass;
use crate::deadline::entity::DlEntity;
use crate::error::{SchedError, SchedResult};
use crate::types::{
    CpuMask, DL_PRIO, MAX_NICE, MAX_USER_RT_PRIO, MIN_NICE, Policy, TaskId, nice_to_prio,
    rt_priority_to_prio,
};

/// Requested scheduling policy and parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedAttr {
    /// Policy.
    pub policy: Policy,
    /// Real-time priority `1..=99` for FIFO/RR, 0 otherwise.
    pub rt_priority: u32,
    /// Nice value for the fair class.
    pub nice: i32,
    /// Deadline parameters, used by [`Policy::Deadline`] only.
    pub dl: DlParams,
}

impl SchedAttr {
    /// Deadline policy with `runtime <= deadline <= period`.
    #[must_use]
    pub const fn deadline(runtime_ns: u64, deadline_ns: u64, period_ns: u64) -> Self {
        Self {
            policy: Policy::Deadline,
            rt_priority: 0,
            nice: 0,
            dl: DlParams::new(runtime_ns, deadline_ns, period_ns),
        }
    }

    /// FIFO at `rt_priority` (`1..=99`, higher is more important).
    #[must_use]
    pub const fn fifo(rt_priority: u32) -> Self {
        Self {
            policy: Policy::Fifo,
            rt_priority,
            nice: 0,
            dl: DlParams::new(0, 0, 0),
        }
    }

    /// Round-robin at `rt_priority`.
    #[must_use]
    pub const fn round_robin(rt_priority: u32) -> Self {
        Self {
            policy: Policy::RoundRobin,
            rt_priority,
            nice: 0,
            dl: DlParams::new(0, 0, 0),
        }
    }

    /// Fair class at `nice`.
    #[must_use]
    pub const fn other(nice: i32) -> Self {
        Self {
            policy: Policy::Other,
            rt_priority: 0,
            nice,
            dl: DlParams::new(0, 0, 0),
        }
    }

    /// Check the policy-independent fields.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidParams`] for an RT priority outside
    /// `1..=99` on FIFO/RR, a non-zero RT priority elsewhere, or a nice value
    /// outside `-20..=19`.
    pub fn validate_priority(&self) -> SchedResult<()> {
        match self.policy {
            Policy::Fifo | Policy::RoundRobin => {
                if self.rt_priority == 0 || self.rt_priority > MAX_USER_RT_PRIO {
                    return Err(SchedError::invalid_params(format!(
                        "rt_priority {} outside 1..={MAX_USER_RT_PRIO}",
                        self.rt_priority
                    )));
                }
            }
            Policy::Deadline | Policy::Other => {
                if self.rt_priority != 0 {
                    return Err(SchedError::invalid_params(
                        "rt_priority is only meaningful for FIFO and RR",
                    ));
                }
            }
        }
        if !(MIN_NICE..=MAX_NICE).contains(&self.nice) {
            return Err(SchedError::invalid_params(format!(
                "nice {} outside {MIN_NICE}..={MAX_NICE}",
                self.nice
            )));
        }
        Ok(())
    }

    /// Priority implied by the attributes, ignoring inheritance.
    #[must_use]
    pub fn normal_prio(&self) -> i32 {
        match self.policy {
            Policy::Deadline => DL_PRIO,
            Policy::Fifo | Policy::RoundRobin => rt_priority_to_prio(self.rt_priority),
            Policy::Other => nice_to_prio(self.nice),
        }
    }
}

/// Arguments of [`Scheduler::spawn`](crate::Scheduler::spawn).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnParams {
    /// Scheduling attributes.
    pub attr: SchedAttr,
    /// Allowed CPUs. Empty means every CPU.
    pub affinity: CpuMask,
    /// Preferred initial CPU.
    pub cpu: Option<usize>,
}

impl SpawnParams {
    /// Spawn with `attr` on any CPU.
    #[must_use]
    pub const fn new(attr: SchedAttr) -> Self {
        Self {
            attr,
            affinity: CpuMask::EMPTY,
            cpu: None,
        }
    }

    /// Restrict the task to `affinity`.
    #[must_use]
    pub const fn with_affinity(mut self, affinity: CpuMask) -> Self {
        self.affinity = affinity;
        self
    }

    /// Prefer `cpu` for the first placement.
    #[must_use]
    pub const fn on_cpu(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Created, never woken.
    New,
    /// On a runqueue (possibly running, possibly throttled).
    Runnable,
    /// Blocked.
    Sleeping,
}

/// Fixed-priority bookkeeping of a task.
#[derive(Debug, Clone, Default)]
pub(crate) struct RtEntity {
    pub(crate) time_slice: u64,
    pub(crate) queued_prio: Option<i32>,
    pub(crate) push_key: Option<(i32, u64)>,
}

/// A schedulable task. Owned by exactly one runqueue.
#[derive(Debug, Clone)]
pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) policy: Policy,
    pub(crate) rt_priority: u32,
    pub(crate) nice: i32,
    pub(crate) normal_prio: i32,
    pub(crate) prio: i32,
    pub(crate) affinity: CpuMask,
    pub(crate) cpu: usize,
    pub(crate) state: TaskState,
    pub(crate) dl: DlEntity,
    pub(crate) rt: RtEntity,
    pub(crate) pi_donor: Option<TaskId>,
    pub(crate) pi_prio: Option<i32>,
    pub(crate) exec_start: u64,
    pub(crate) sum_exec_runtime: u64,
}

impl Task {
    pub(crate) fn new(id: TaskId, attr: &SchedAttr, dl: Option<DlParams>, affinity: CpuMask, cpu: usize) -> Self {
        let prio = attr.normal_prio();
        Self {
            id,
            policy: attr.policy,
            rt_priority: attr.rt_priority,
            nice: attr.nice,
            normal_prio: prio,
            prio,
            affinity,
            cpu,
            state: TaskState::New,
            dl: dl.map(DlEntity::with_params).unwrap_or_default(),
            rt: RtEntity::default(),
            pi_donor: None,
            pi_prio: None,
            exec_start: 0,
            sum_exec_runtime: 0,
        }
    }

    pub(crate) fn class(&self) -> SchedClass {
        SchedClass::of_prio(self.prio)
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.state == TaskState::Runnable
    }

    /// Priority with inheritance applied.
    pub(crate) fn effective_prio(&self) -> i32 {
        self.pi_prio.map_or(self.normal_prio, |donor| donor.min(self.normal_prio))
    }

    pub(crate) fn snapshot(&self, running: bool) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            policy: self.policy,
            class: self.class(),
            prio: self.prio,
            normal_prio: self.normal_prio,
            cpu: self.cpu,
            state: self.state,
            running,
            affinity: self.affinity,
            sum_exec_runtime: self.sum_exec_runtime,
            rr_time_slice: (self.policy == Policy::RoundRobin).then_some(self.rt.time_slice),
            dl: (self.class() == SchedClass::Deadline || self.policy == Policy::Deadline).then(|| {
                DlSnapshot {
                    runtime: self.dl.runtime(),
                    deadline: self.dl.deadline(),
                    params: self.dl.effective_params(),
                    bandwidth: self.dl.bandwidth(),
                    throttled: self.dl.is_throttled(),
                    boosted: self.dl.is_boosted(),
                    yielded: self.dl.is_yielded(),
                }
            }),
        }
    }
}

/// Deadline state seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlSnapshot {
    /// Remaining budget.
    pub runtime: i64,
    /// Absolute deadline.
    pub deadline: u64,
    /// Parameters in force (donor's while boosted).
    pub params: DlParams,
    /// Own reserved bandwidth.
    pub bandwidth: u64,
    /// Waiting for replenishment.
    pub throttled: bool,
    /// Running on donated parameters.
    pub boosted: bool,
    /// Yielded the current period.
    pub yielded: bool,
}

/// Read-only copy of a task's scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Identifier.
    pub id: TaskId,
    /// Policy.
    pub policy: Policy,
    /// Class derived from the effective priority.
    pub class: SchedClass,
    /// Effective priority.
    pub prio: i32,
    /// Priority without inheritance.
    pub normal_prio: i32,
    /// CPU owning the task.
    pub cpu: usize,
    /// Lifecycle state.
    pub state: TaskState,
    /// Whether the task is its CPU's current task.
    pub running: bool,
    /// Allowed CPUs.
    pub affinity: CpuMask,
    /// Total execution time charged.
    pub sum_exec_runtime: u64,
    /// Remaining round-robin slice.
    pub rr_time_slice: Option<u64>,
    /// Deadline state for deadline-class tasks.
    pub dl: Option<DlSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_priorities() {
        assert_eq!(SchedAttr::deadline(1, 2, 3).normal_prio(), DL_PRIO);
        assert_eq!(SchedAttr::fifo(99).normal_prio(), 0);
        assert_eq!(SchedAttr::round_robin(10).normal_prio(), 89);
        assert_eq!(SchedAttr::other(-5).normal_prio(), 115);
    }

    #[test]
    fn test_attr_priority_validation() {
        assert!(SchedAttr::fifo(0).validate_priority().is_err());
        assert!(SchedAttr::fifo(100).validate_priority().is_err());
        assert!(SchedAttr::round_robin(1).validate_priority().is_ok());
        assert!(SchedAttr::other(20).validate_priority().is_err());
        let mut attr = SchedAttr::other(0);
        attr.rt_priority = 5;
        assert!(attr.validate_priority().is_err());
    }

    #[test]
    fn test_snapshot_reports_class() {
        let attr = SchedAttr::deadline(1_000_000, 10_000_000, 10_000_000);
        let task = Task::new(TaskId::new(1), &attr, Some(attr.dl), CpuMask::first_n(2), 0);
        let snap = task.snapshot(false);
        assert_eq!(snap.class, SchedClass::Deadline);
        assert_eq!(snap.state, TaskState::New);
        assert!(snap.dl.is_some_and(|dl| dl.bandwidth > 0));
        assert_eq!(snap.rr_time_slice, None);
    }
}
