//! Partition-wide index of each CPU's highest runnable priority.
//!
//! Every CPU sits at exactly one level. Levels grow with importance:
//!
//! | Level      | Meaning                                  |
//! |------------|------------------------------------------|
//! | `0`        | idle                                     |
//! | `1`        | only fair-class work                     |
//! | `2..=101`  | fixed priority `99..=0`                  |
//! | `102`      | deadline work present                    |
//!
//! [`CpuPri::find`] returns the CPUs at the lowest level that is still below
//! a task's own level, which is where a push should go.

use crate::types::{CpuMask, MAX_CPUS, MAX_RT_PRIO, is_dl_prio, is_rt_prio};

/// Level of an idle CPU.
pub const CPUPRI_IDLE: usize = 0;
/// Level of a CPU running only fair work.
pub const CPUPRI_NORMAL: usize = 1;
/// Level of a CPU with deadline work.
pub const CPUPRI_HIGHER: usize = 102;
/// Number of levels.
pub const CPUPRI_NR_PRIORITIES: usize = 103;

/// Level for a task priority.
#[must_use]
pub fn convert(prio: i32) -> usize {
    if is_dl_prio(prio) {
        CPUPRI_HIGHER
    } else if is_rt_prio(prio) {
        usize::try_from(MAX_RT_PRIO + 1 - prio).unwrap_or(CPUPRI_NORMAL)
    } else {
        CPUPRI_NORMAL
    }
}

/// Highest-priority index for one partition.
#[derive(Debug, Clone)]
pub struct CpuPri {
    levels: Vec<CpuMask>,
    cpu_level: [Option<usize>; MAX_CPUS],
}

impl Default for CpuPri {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuPri {
    /// Empty index with no CPU registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            levels: vec![CpuMask::EMPTY; CPUPRI_NR_PRIORITIES],
            cpu_level: [None; MAX_CPUS],
        }
    }

    /// Index with every CPU of `span` idle.
    #[must_use]
    pub fn with_span(span: CpuMask) -> Self {
        let mut cpupri = Self::new();
        for cpu in span {
            cpupri.set(cpu, CPUPRI_IDLE);
        }
        cpupri
    }

    /// Move `cpu` to `level`.
    pub fn set(&mut self, cpu: usize, level: usize) {
        if cpu >= MAX_CPUS || level >= CPUPRI_NR_PRIORITIES {
            return;
        }
        if self.cpu_level[cpu] == Some(level) {
            return;
        }
        if let Some(old) = self.cpu_level[cpu]
            && let Some(mask) = self.levels.get_mut(old)
        {
            mask.remove(cpu);
        }
        if let Some(mask) = self.levels.get_mut(level) {
            mask.insert(cpu);
        }
        self.cpu_level[cpu] = Some(level);
    }

    /// Current level of `cpu`.
    #[must_use]
    pub fn level(&self, cpu: usize) -> Option<usize> {
        self.cpu_level.get(cpu).copied().flatten()
    }

    /// CPUs in `allowed` at the lowest level strictly below `prio`'s level.
    #[must_use]
    pub fn find(&self, prio: i32, allowed: CpuMask) -> Option<CpuMask> {
        let task_level = convert(prio);
        self.levels
            .iter()
            .take(task_level)
            .map(|mask| *mask & allowed)
            .find(|mask| !mask.is_empty())
    }
}
