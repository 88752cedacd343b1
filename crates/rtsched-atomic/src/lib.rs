//! # rtsched-atomic
//!
//! Lock-free event counters for the `rtsched` real-time scheduling core.
//!
//! Every scheduler entry point runs with one or two runqueue locks held. The
//! counters in this crate can be bumped from inside those critical sections
//! without taking any further lock, and read from any thread at any time.
//!
//! ## Guarantees
//!
//! - **No heap allocations**
//! - **No blocking operations** - every method is a single relaxed atomic
//! - **Eventually consistent snapshots** - there is no cross-counter atomicity
//!
//! ## Usage
//!
//! ```rust
//! use rtsched_atomic::SchedCounters;
//!
//! let counters = SchedCounters::new();
//!
//! // Inside the scheduler
//! counters.inc_dl_throttle();
//! counters.inc_push_migration();
//!
//! // From a monitoring thread
//! let snapshot = counters.snapshot();
//! assert_eq!(snapshot.dl_throttles, 1);
//! ```

#![no_std]
#![deny(
    unsafe_op_in_unsafe_fn,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic_in_result_fn,
    clippy::panic,
    missing_docs,
    missing_debug_implementations
)]
#![warn(clippy::pedantic)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod counters;

pub mod prelude;

pub use counters::{CounterSnapshot, SchedCounters};
