//! Utilization observer hook.

use std::fmt;

use crate::class::SchedClass;

/// One-way sink for runtime accounting, typically a frequency governor.
///
/// Called with the runqueue lock held; implementations must not block or
/// call back into the scheduler.
pub trait UtilObserver: Send + Sync + fmt::Debug {
    /// `delta_ns` of execution was charged to `class` on `cpu`.
    fn runtime_consumed(&self, cpu: usize, class: SchedClass, delta_ns: u64, running_bw: u64);
}

/// Observer that ignores every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl UtilObserver for NoopObserver {
    fn runtime_consumed(&self, _cpu: usize, _class: SchedClass, _delta_ns: u64, _running_bw: u64) {}
}
