//! Deadline entity and the CBS rules that govern it.
//!
//! An entity is created NEW, becomes active on its first enqueue, alternates
//! between active and throttled while it runs, and is cleared when the task
//! leaves the deadline class. All methods here are pure state transitions on
//! the entity; queueing, timers and accounting live in the runqueue code.

use bitflags::bitflags;

use crate::bandwidth::{BW_SHIFT, DlParams};
use crate::timer::TimerHandle;

bitflags! {
    /// Deadline entity state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DlFlags: u8 {
        /// Parameters set but no CBS period started yet.
        const NEW = 1 << 0;
        /// Running on donated parameters (priority inheritance).
        const BOOSTED = 1 << 1;
        /// Budget exhausted; waiting for the replenishment timer.
        const THROTTLED = 1 << 2;
        /// Gave up the rest of the current period.
        const YIELDED = 1 << 3;
    }
}

/// How a wakeup refreshed the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupRefresh {
    /// Current deadline and budget were still usable.
    Unchanged,
    /// A fresh CBS period was started at the wakeup time.
    NewPeriod,
    /// Budget was scaled to the remaining laxity (constrained tasks).
    Revised,
}

/// Outcome of a replenishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replenish {
    /// The deadline moved forward by whole periods.
    Postponed,
    /// A first period was set up for a NEW entity.
    Started,
    /// Whole periods were not enough; a new period was started at `now`.
    Lagged,
}

/// Per-task deadline scheduling state.
#[derive(Debug, Clone, Default)]
pub struct DlEntity {
    pub(crate) runtime: i64,
    pub(crate) deadline: u64,
    pub(crate) dl_runtime: u64,
    pub(crate) dl_deadline: u64,
    pub(crate) dl_period: u64,
    pub(crate) dl_bw: u64,
    pub(crate) dl_density: u64,
    pub(crate) flags: DlFlags,
    pub(crate) pi: Option<DlParams>,
    pub(crate) timer_generation: u64,
    pub(crate) timer: Option<TimerHandle>,
    pub(crate) tree_key: Option<(u64, u64)>,
    pub(crate) push_key: Option<(u64, u64)>,
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl DlEntity {
    /// Entity carrying validated parameters, flagged NEW.
    #[must_use]
    pub fn with_params(params: DlParams) -> Self {
        let mut entity = Self::default();
        entity.set_params(params);
        entity
    }

    /// Install validated parameters and flag the entity NEW.
    ///
    /// A pending throttle is dropped: the next enqueue starts a fresh period.
    /// Callers cancel any armed replenishment timer first.
    pub fn set_params(&mut self, params: DlParams) {
        self.dl_runtime = params.runtime_ns;
        self.dl_deadline = params.deadline_ns;
        self.dl_period = params.effective_period();
        self.dl_bw = params.bandwidth();
        self.dl_density = params.density();
        self.flags.remove(DlFlags::THROTTLED | DlFlags::YIELDED);
        self.flags.insert(DlFlags::NEW);
    }

    /// Forget every parameter. The timer generation survives so stale
    /// expiries stay recognisable.
    pub fn clear_params(&mut self) {
        let generation = self.timer_generation.wrapping_add(1);
        *self = Self {
            timer_generation: generation,
            ..Self::default()
        };
    }

    /// The task's own parameters.
    #[must_use]
    pub const fn own_params(&self) -> DlParams {
        DlParams::new(self.dl_runtime, self.dl_deadline, self.dl_period)
    }

    /// Parameters in force: the donor's while boosted, otherwise the task's own.
    #[must_use]
    pub fn effective_params(&self) -> DlParams {
        match self.pi {
            Some(pi) if self.is_boosted() => pi,
            _ => self.own_params(),
        }
    }

    /// Remaining budget in the current period.
    #[must_use]
    pub const fn runtime(&self) -> i64 {
        self.runtime
    }

    /// Absolute deadline of the current period.
    #[must_use]
    pub const fn deadline(&self) -> u64 {
        self.deadline
    }

    /// Reserved bandwidth.
    #[must_use]
    pub const fn bandwidth(&self) -> u64 {
        self.dl_bw
    }

    /// State flags.
    #[must_use]
    pub const fn flags(&self) -> DlFlags {
        self.flags
    }

    /// Whether the entity waits for replenishment.
    #[must_use]
    pub const fn is_throttled(&self) -> bool {
        self.flags.contains(DlFlags::THROTTLED)
    }

    /// Whether the entity runs on donated parameters.
    #[must_use]
    pub const fn is_boosted(&self) -> bool {
        self.flags.contains(DlFlags::BOOSTED)
    }

    /// Whether the entity yielded its current period.
    #[must_use]
    pub const fn is_yielded(&self) -> bool {
        self.flags.contains(DlFlags::YIELDED)
    }

    /// Whether no CBS period was started yet.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        self.flags.contains(DlFlags::NEW)
    }

    /// Whether the task's own deadline is shorter than its period.
    #[must_use]
    pub const fn is_constrained(&self) -> bool {
        self.dl_deadline < self.dl_period
    }

    /// Start of the next period, where a throttled entity gets its budget back.
    #[must_use]
    pub const fn next_period(&self) -> u64 {
        self.deadline
            .saturating_sub(self.dl_deadline)
            .saturating_add(self.dl_period)
    }

    /// Whether `self` should run before `other` under EDF.
    #[must_use]
    pub const fn preempts(&self, other: &Self) -> bool {
        self.is_boosted() || self.deadline < other.deadline
    }

    /// Whether using the remaining budget before the current deadline would
    /// exceed the reserved density: `runtime / (deadline - now) > dl_runtime / dl_deadline`.
    ///
    /// Operands are shifted right by `shift` before the saturating cross
    /// multiplication.
    #[must_use]
    pub fn overflows(&self, now: u64, shift: u32) -> bool {
        let params = self.effective_params();
        let runtime = u64::try_from(self.runtime.max(0)).unwrap_or(0);
        let left = (params.deadline_ns >> shift).saturating_mul(runtime >> shift);
        let right = (self.deadline.saturating_sub(now) >> shift)
            .saturating_mul(params.runtime_ns >> shift);
        right < left
    }

    /// Begin a fresh CBS period at `now` with a full budget.
    pub fn start_new_period(&mut self, now: u64) {
        let params = self.effective_params();
        self.deadline = now.saturating_add(params.deadline_ns);
        self.runtime = to_i64(params.runtime_ns);
    }

    /// First activation: start a period and drop the NEW flag.
    pub fn setup_new(&mut self, now: u64) {
        self.start_new_period(now);
        self.flags.remove(DlFlags::NEW);
    }

    /// Refresh deadline and budget for a task waking at `now`.
    pub fn update_on_wakeup(&mut self, now: u64, shift: u32) -> WakeupRefresh {
        let deadline_passed = self.deadline < now;
        if !deadline_passed && !self.overflows(now, shift) {
            return WakeupRefresh::Unchanged;
        }
        if self.is_constrained() && !deadline_passed && !self.is_boosted() {
            let laxity = u128::from(self.deadline - now);
            let revised = (u128::from(self.dl_density) * laxity) >> BW_SHIFT;
            self.runtime = i64::try_from(revised).unwrap_or(i64::MAX);
            return WakeupRefresh::Revised;
        }
        self.start_new_period(now);
        WakeupRefresh::NewPeriod
    }

    /// Give the entity its budget back.
    ///
    /// A yielded entity forfeits leftover budget first. The deadline then
    /// moves forward by whole periods until the budget is positive; if that
    /// still leaves the deadline behind `now` a new period starts at `now`.
    /// Clears the throttled and yielded flags.
    pub fn replenish(&mut self, now: u64) -> Replenish {
        let params = self.effective_params();
        let outcome = if self.is_new() || self.deadline == 0 || params.runtime_ns == 0 {
            self.setup_new(now);
            Replenish::Started
        } else {
            if self.is_yielded() && self.runtime > 0 {
                self.runtime = 0;
            }
            if self.runtime <= 0 {
                let step = to_i64(params.runtime_ns);
                let periods = self.runtime.unsigned_abs() / params.runtime_ns + 1;
                self.runtime = self
                    .runtime
                    .saturating_add(step.saturating_mul(to_i64(periods)));
                self.deadline = self
                    .deadline
                    .saturating_add(params.effective_period().saturating_mul(periods));
            }
            if self.deadline < now {
                self.start_new_period(now);
                Replenish::Lagged
            } else {
                Replenish::Postponed
            }
        };
        self.flags.remove(DlFlags::THROTTLED | DlFlags::YIELDED);
        outcome
    }

    /// Constrained tasks waking between their deadline and the next period
    /// start must not run until the period begins.
    #[must_use]
    pub const fn needs_constrained_throttle(&self, now: u64) -> bool {
        !self.is_boosted()
            && self.is_constrained()
            && self.deadline < now
            && now < self.next_period()
    }

    /// Charge `delta` of execution. Returns `true` when the entity must be throttled.
    pub fn charge(&mut self, delta: u64) -> bool {
        self.runtime = self.runtime.saturating_sub(to_i64(delta));
        self.runtime <= 0 || self.is_yielded()
    }

    /// Mark throttled with the budget clamped at zero or below.
    pub fn throttle(&mut self) {
        if self.runtime > 0 && !self.is_yielded() {
            self.runtime = 0;
        }
        self.flags.insert(DlFlags::THROTTLED);
    }

    /// Begin tracking a new timer and return its generation.
    pub fn next_timer_generation(&mut self) -> u64 {
        self.timer_generation = self.timer_generation.wrapping_add(1);
        self.timer_generation
    }
}
