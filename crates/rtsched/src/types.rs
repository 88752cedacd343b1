//! Identifiers, CPU masks and the priority scale shared by every class.
//!
//! Priorities follow a single integer scale where a lower value always wins:
//!
//! | Range        | Meaning                                   |
//! |--------------|-------------------------------------------|
//! | `-1`         | deadline class                            |
//! | `0..=99`     | fixed priority (`0` is the highest)       |
//! | `100..=139`  | fair class (nice `-20..=19`)              |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

/// Upper bound on the number of CPUs a scheduler instance can manage.
pub const MAX_CPUS: usize = 64;

/// Effective priority of every deadline task.
pub const DL_PRIO: i32 = -1;

/// Number of fixed-priority levels (`0..MAX_RT_PRIO`).
pub const MAX_RT_PRIO: i32 = 100;

/// Highest user-visible real-time priority.
pub const MAX_USER_RT_PRIO: u32 = 99;

/// One past the lowest fair priority.
pub const MAX_PRIO: i32 = 140;

/// Priority of a nice-0 fair task.
pub const DEFAULT_PRIO: i32 = 120;

/// Lowest nice value (highest fair priority).
pub const MIN_NICE: i32 = -20;

/// Highest nice value (lowest fair priority).
pub const MAX_NICE: i32 = 19;

/// Map a user real-time priority (`1..=99`, higher is more important) onto the
/// kernel scale (`0..=98`, lower is more important).
#[must_use]
pub fn rt_priority_to_prio(rt_priority: u32) -> i32 {
    let clamped = i32::try_from(rt_priority.min(MAX_USER_RT_PRIO)).unwrap_or(0);
    MAX_RT_PRIO - 1 - clamped
}

/// Map a nice value onto the fair priority band.
#[must_use]
pub fn nice_to_prio(nice: i32) -> i32 {
    DEFAULT_PRIO + nice.clamp(MIN_NICE, MAX_NICE)
}

/// Returns `true` for the deadline priority.
#[must_use]
pub const fn is_dl_prio(prio: i32) -> bool {
    prio < 0
}

/// Returns `true` for a fixed-priority level.
#[must_use]
pub const fn is_rt_prio(prio: i32) -> bool {
    prio >= 0 && prio < MAX_RT_PRIO
}

/// Opaque task identifier handed out by the scheduler.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identifier value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

/// Set of CPU indices, one bit per CPU.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuMask(u64);

impl CpuMask {
    /// The empty mask.
    pub const EMPTY: Self = Self(0);

    /// Build a mask from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Mask holding CPUs `0..n`.
    #[must_use]
    pub const fn first_n(n: usize) -> Self {
        if n >= MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << n) - 1)
        }
    }

    /// Mask holding a single CPU. Out-of-range indices give the empty mask.
    #[must_use]
    pub const fn single(cpu: usize) -> Self {
        if cpu >= MAX_CPUS {
            Self::EMPTY
        } else {
            Self(1u64 << cpu)
        }
    }

    /// Whether `cpu` is in the mask.
    #[must_use]
    pub const fn contains(self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.0 & (1u64 << cpu) != 0
    }

    /// Add `cpu` to the mask.
    pub fn insert(&mut self, cpu: usize) {
        self.0 |= Self::single(cpu).0;
    }

    /// Remove `cpu` from the mask.
    pub fn remove(&mut self, cpu: usize) {
        self.0 &= !Self::single(cpu).0;
    }

    /// Whether no CPU is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of CPUs in the mask.
    #[must_use]
    pub const fn weight(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Lowest CPU in the mask.
    #[must_use]
    pub const fn first(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Lowest CPU strictly greater than `after`, or the first CPU when `after` is `None`.
    #[must_use]
    pub fn next_after(self, after: Option<usize>) -> Option<usize> {
        match after {
            None => self.first(),
            Some(cpu) if cpu + 1 >= MAX_CPUS => None,
            Some(cpu) => Self(self.0 & !((1u64 << (cpu + 1)) - 1)).first(),
        }
    }

    /// Whether every CPU of `self` is also in `other`.
    #[must_use]
    pub const fn is_subset_of(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Whether the masks share at least one CPU.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Iterate CPUs in ascending order.
    #[must_use]
    pub const fn iter(self) -> CpuMaskIter {
        CpuMaskIter { bits: self.0 }
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl BitAnd for CpuMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for CpuMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Not for CpuMask {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl FromIterator<usize> for CpuMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = Self::EMPTY;
        for cpu in iter {
            mask.insert(cpu);
        }
        mask
    }
}

impl IntoIterator for CpuMask {
    type Item = usize;
    type IntoIter = CpuMaskIter;

    fn into_iter(self) -> CpuMaskIter {
        self.iter()
    }
}

/// Ascending iterator over the CPUs of a [`CpuMask`].
#[derive(Debug, Clone)]
pub struct CpuMaskIter {
    bits: u64,
}

impl Iterator for CpuMaskIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.bits == 0 {
            return None;
        }
        let cpu = self.bits.trailing_zeros() as usize;
        self.bits &= self.bits - 1;
        Some(cpu)
    }
}

/// Scheduling policy requested for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Policy {
    /// EDF with CBS enforcement.
    Deadline,
    /// Fixed priority, run until block or preemption.
    Fifo,
    /// Fixed priority with a round-robin time slice.
    RoundRobin,
    /// Fair-share class.
    Other,
}

impl Policy {
    /// Whether the policy belongs to the fixed-priority class.
    #[must_use]
    pub const fn is_rt(self) -> bool {
        matches!(self, Self::Fifo | Self::RoundRobin)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deadline => write!(f, "SCHED_DEADLINE"),
            Self::Fifo => write!(f, "SCHED_FIFO"),
            Self::RoundRobin => write!(f, "SCHED_RR"),
            Self::Other => write!(f, "SCHED_OTHER"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_scale() {
        assert_eq!(rt_priority_to_prio(99), 0);
        assert_eq!(rt_priority_to_prio(1), 98);
        assert_eq!(nice_to_prio(0), DEFAULT_PRIO);
        assert_eq!(nice_to_prio(-20), 100);
        assert_eq!(nice_to_prio(40), 139);
        assert!(is_dl_prio(DL_PRIO));
        assert!(is_rt_prio(0));
        assert!(!is_rt_prio(100));
    }

    #[test]
    fn test_cpu_mask_operations() {
        let mut mask = CpuMask::first_n(4);
        assert_eq!(mask.weight(), 4);
        mask.remove(1);
        assert!(!mask.contains(1));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 2, 3]);
        assert_eq!(mask.next_after(Some(0)), Some(2));
        assert_eq!(mask.next_after(Some(3)), None);
        assert_eq!(mask.next_after(None), Some(0));
        assert!(CpuMask::single(2).is_subset_of(mask));
        assert!(!CpuMask::single(1).intersects(mask));
        assert_eq!(CpuMask::first_n(64).weight(), 64);
        assert_eq!(CpuMask::single(64), CpuMask::EMPTY);
    }

    #[test]
    fn test_cpu_mask_serde_is_transparent() -> Result<(), serde_json::Error> {
        let mask: CpuMask = [0usize, 5].into_iter().collect();
        let json = serde_json::to_string(&mask)?;
        assert_eq!(json, "33");
        let back: CpuMask = serde_json::from_str(&json)?;
        assert_eq!(back, mask);
        Ok(())
    }
}
