//! Prelude for rtsched-atomic.
//!
//! # Example
//!
//! ```rust
//! use rtsched_atomic::prelude::*;
//!
//! let counters = SchedCounters::new();
//! counters.inc_context_switch();
//! ```

pub use crate::counters::{CounterSnapshot, SchedCounters};
