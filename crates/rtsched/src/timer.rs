//! High-resolution timer boundary.
//!
//! The scheduler never sleeps: it arms one-shot timers through a
//! [`TimerFacility`] and the embedder delivers expiries by calling
//! [`Scheduler::run_timers`](crate::Scheduler::run_timers). Expiries are plain
//! [`TimerEvent`] messages carrying a generation, so a handler can tell a
//! stale expiry from a live one after re-checking state under the runqueue lock.

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

use crate::types::TaskId;

/// Message delivered when a timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerEvent {
    /// CBS replenishment of a throttled deadline entity.
    DlReplenish {
        /// Throttled task.
        task: TaskId,
        /// Timer generation recorded in the entity when armed.
        generation: u64,
    },
    /// Period boundary of a partition's RT group bandwidth.
    RtPeriod {
        /// Partition index.
        partition: usize,
        /// Timer generation recorded in the partition when armed.
        generation: u64,
    },
}

/// Handle returned by [`TimerFacility::arm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Wrap a raw handle value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw handle value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// One-shot timer facility.
///
/// Implementations must be callable while runqueue locks are held and must
/// never call back into the scheduler from `arm` or `cancel`.
pub trait TimerFacility: Send + Sync + fmt::Debug {
    /// Arm a timer that expires at `expires_ns`.
    fn arm(&self, expires_ns: u64, event: TimerEvent) -> TimerHandle;

    /// Cancel a pending timer. Returns `false` if it already fired or was cancelled.
    fn cancel(&self, handle: TimerHandle) -> bool;

    /// Remove and return every event due at or before `now_ns`, earliest first.
    fn expire(&self, now_ns: u64) -> Vec<(u64, TimerEvent)>;

    /// Expiry time of the earliest pending timer.
    fn next_expiry(&self) -> Option<u64>;
}

#[derive(Debug, Default)]
struct SoftTimerState {
    heap: BinaryHeap<Reverse<(u64, u64)>>,
    pending: HashMap<u64, TimerEvent>,
    next_handle: u64,
}

impl SoftTimerState {
    fn drop_cancelled_head(&mut self) {
        while let Some(Reverse((_, handle))) = self.heap.peek() {
            if self.pending.contains_key(handle) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// Software timer queue: a min-heap keyed by expiry with lazy cancellation.
#[derive(Debug, Default)]
pub struct SoftTimerQueue {
    state: Mutex<SoftTimerState>,
}

impl SoftTimerQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of armed, uncancelled timers.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl TimerFacility for SoftTimerQueue {
    fn arm(&self, expires_ns: u64, event: TimerEvent) -> TimerHandle {
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.heap.push(Reverse((expires_ns, handle)));
        state.pending.insert(handle, event);
        TimerHandle(handle)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let mut state = self.state.lock();
        let removed = state.pending.remove(&handle.0).is_some();
        state.drop_cancelled_head();
        removed
    }

    fn expire(&self, now_ns: u64) -> Vec<(u64, TimerEvent)> {
        let mut state = self.state.lock();
        let mut due = Vec::new();
        while let Some(Reverse((expires, handle))) = state.heap.peek().copied() {
            if expires > now_ns {
                break;
            }
            state.heap.pop();
            if let Some(event) = state.pending.remove(&handle) {
                due.push((expires, event));
            }
        }
        state.drop_cancelled_head();
        due
    }

    fn next_expiry(&self) -> Option<u64> {
        let mut state = self.state.lock();
        state.drop_cancelled_head();
        state.heap.peek().map(|Reverse((expires, _))| *expires)
    }
}
