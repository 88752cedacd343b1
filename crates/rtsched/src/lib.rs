//! SMP real-time scheduling core.
//!
//! `rtsched` models the real-time half of a multiprocessor kernel
//! scheduler as a library. It provides:
//!
//! - **Deadline class**: EDF ordering with a Constant Bandwidth Server,
//!   admission control per partition and replenishment timers
//! - **RT class**: FIFO and round-robin fixed priorities with per-partition
//!   group throttling and runtime borrowing between CPUs
//! - **Balancing**: push and pull migration driven by the `cpupri` and
//!   `cpudl` indexes, plus an IPI-driven push sweep
//! - **Dispatcher**: strict class order deadline > RT > fair > idle
//!
//! # Time and concurrency
//!
//! Nothing here reads a clock. Every entry point takes the caller's
//! monotonic timestamp in nanoseconds, and timers are delivered by the
//! embedder through [`Scheduler::run_timers`] or [`Scheduler::fire_timer`].
//!
//! Each CPU's runqueue sits behind its own lock. A second runqueue is only
//! ever taken with a bounded try-lock, so different CPUs can be driven from
//! different threads without deadlock.
//!
//! # Example
//!
//! ```
//! use rtsched::prelude::*;
//!
//! # fn main() -> Result<(), SchedError> {
//! let config = SchedConfig::builder().nr_cpus(2).build()?;
//! let sched = Scheduler::new(config)?;
//!
//! let audio = sched.spawn(SpawnParams::new(SchedAttr::fifo(80)).on_cpu(0), 0)?;
//! sched.wake_up_new_task(audio, 0)?;
//! assert_eq!(sched.schedule(0, 0)?, Some(audio));
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![deny(clippy::unwrap_used)]
#![deny(static_mut_refs)]
#![deny(unused_must_use)]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod macros;

pub mod balance;
pub mod bandwidth;
pub mod class;
pub mod config;
pub(crate) mod core;
pub mod cpudl;
pub mod cpupri;
pub mod deadline;
pub mod domain;
pub mod error;
pub mod fair;
pub mod observer;
pub(crate) mod rq;
pub mod rt;
pub mod task;
pub mod timer;
pub mod types;

pub mod prelude;

pub use balance::ipi::Ipi;
pub use bandwidth::{BW_UNIT, DlBandwidthPool, DlParams, RqBandwidth};
pub use class::SchedClass;
pub use config::{BalanceConfig, BandwidthLimit, RtBandwidthConfig, SchedConfig, SchedConfigBuilder};
pub use crate::core::Scheduler;
pub use error::{SchedError, SchedResult};
pub use observer::{NoopObserver, UtilObserver};
pub use rt::bandwidth::RtRuntime;
pub use rtsched_atomic::{CounterSnapshot, SchedCounters};
pub use task::{DlSnapshot, SchedAttr, SpawnParams, TaskSnapshot, TaskState};
pub use timer::{SoftTimerQueue, TimerEvent, TimerFacility, TimerHandle};
pub use types::{CpuMask, MAX_CPUS, Policy, TaskId};
