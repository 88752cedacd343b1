//! Commonly used scheduler types.
//!
//! ```
//! use rtsched::prelude::*;
//! ```

pub use crate::config::{BandwidthLimit, RtBandwidthConfig, SchedConfig};
pub use crate::error::{SchedError, SchedResult};
pub use crate::task::{SchedAttr, SpawnParams, TaskSnapshot, TaskState};
pub use crate::timer::TimerEvent;
pub use crate::types::{CpuMask, Policy, TaskId};
pub use crate::{CounterSnapshot, Ipi, SchedClass, Scheduler};
