//! Deadline bandwidth accounting.
//!
//! Bandwidths are `runtime / period` ratios in `BW_SHIFT` fixed point, so a
//! task reserving a whole CPU has bandwidth [`BW_UNIT`]. Capacities use the
//! `SCHED_CAPACITY_SCALE` convention of 1024 per CPU.
//!
//! Two levels are tracked:
//!
//! - [`DlBandwidthPool`], one per partition, holding the admitted total that
//!   admission control checks against the ceiling;
//! - [`RqBandwidth`], one per runqueue, holding the bandwidth of tasks assigned
//!   to that CPU (`this_bw`) and of those currently active on it (`running_bw`).

use serde::{Deserialize, Serialize};

use crate::config::SchedConfig;
use crate::error::{SchedError, SchedResult};

/// Fixed-point shift of bandwidth ratios.
pub const BW_SHIFT: u32 = 20;

/// Bandwidth of a task that reserves one full CPU.
pub const BW_UNIT: u64 = 1 << BW_SHIFT;

/// Shift of the per-CPU capacity scale.
pub const SCHED_CAPACITY_SHIFT: u32 = 10;

/// Capacity of one CPU.
pub const SCHED_CAPACITY_SCALE: u64 = 1 << SCHED_CAPACITY_SHIFT;

/// `(runtime << BW_SHIFT) / period`, saturating. A zero period yields 0.
#[must_use]
pub fn to_ratio(period: u64, runtime: u64) -> u64 {
    if period == 0 {
        return 0;
    }
    let ratio = (u128::from(runtime) << BW_SHIFT) / u128::from(period);
    u64::try_from(ratio).unwrap_or(u64::MAX)
}

/// Scale `value` by a capacity expressed in `SCHED_CAPACITY_SCALE` units.
#[must_use]
pub fn cap_scale(value: u64, capacity: u64) -> u64 {
    let scaled = (u128::from(value) * u128::from(capacity)) >> SCHED_CAPACITY_SHIFT;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// Capacity of `cpus` CPUs.
#[must_use]
pub fn capacity_of(cpus: usize) -> u64 {
    SCHED_CAPACITY_SCALE.saturating_mul(u64::try_from(cpus).unwrap_or(u64::MAX))
}

/// Deadline reservation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DlParams {
    /// Budget per period.
    pub runtime_ns: u64,
    /// Relative deadline.
    pub deadline_ns: u64,
    /// Period. Zero means "same as the deadline".
    pub period_ns: u64,
}

impl DlParams {
    /// Build parameters from raw values.
    #[must_use]
    pub const fn new(runtime_ns: u64, deadline_ns: u64, period_ns: u64) -> Self {
        Self {
            runtime_ns,
            deadline_ns,
            period_ns,
        }
    }

    /// Implicit-deadline parameters (`deadline == period`).
    #[must_use]
    pub const fn implicit(runtime_ns: u64, period_ns: u64) -> Self {
        Self::new(runtime_ns, period_ns, period_ns)
    }

    /// Period with the zero shorthand resolved.
    #[must_use]
    pub const fn effective_period(&self) -> u64 {
        if self.period_ns == 0 {
            self.deadline_ns
        } else {
            self.period_ns
        }
    }

    /// Reserved bandwidth, `runtime / period`.
    #[must_use]
    pub fn bandwidth(&self) -> u64 {
        to_ratio(self.effective_period(), self.runtime_ns)
    }

    /// Density, `runtime / deadline`.
    #[must_use]
    pub fn density(&self) -> u64 {
        to_ratio(self.deadline_ns, self.runtime_ns)
    }

    /// Whether the relative deadline is shorter than the period.
    #[must_use]
    pub const fn is_constrained(&self) -> bool {
        self.deadline_ns < self.effective_period()
    }

    /// Validate against the configured limits and resolve the period shorthand.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidParams`] when the runtime is below the CBS
    /// resolution, the deadline is zero, the ordering
    /// `runtime <= deadline <= period` is broken, the period is outside the
    /// configured range, or a value uses the sign bit.
    pub fn validate(&self, config: &SchedConfig) -> SchedResult<Self> {
        const MSB: u64 = 1 << 63;

        if self.deadline_ns == 0 {
            return Err(SchedError::invalid_params("deadline must be non-zero"));
        }
        if self.runtime_ns < (1u64 << config.dl_scale_shift) {
            return Err(SchedError::invalid_params(format!(
                "runtime {} ns is below the {} ns resolution",
                self.runtime_ns,
                1u64 << config.dl_scale_shift
            )));
        }
        if self.deadline_ns & MSB != 0 || self.period_ns & MSB != 0 {
            return Err(SchedError::invalid_params(
                "deadline and period must not use the top bit",
            ));
        }
        let period = self.effective_period();
        if period < self.deadline_ns || self.deadline_ns < self.runtime_ns {
            return Err(SchedError::invalid_params(
                "parameters must satisfy runtime <= deadline <= period",
            ));
        }
        if period < config.dl_period_min_ns || period > config.dl_period_max_ns {
            return Err(SchedError::invalid_params(format!(
                "period {period} ns is outside {}..={} ns",
                config.dl_period_min_ns, config.dl_period_max_ns
            )));
        }
        Ok(Self::new(self.runtime_ns, self.deadline_ns, period))
    }
}

/// Admission pool shared by the CPUs of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlBandwidthPool {
    bw: Option<u64>,
    total_bw: u64,
}

impl DlBandwidthPool {
    /// Pool with a per-CPU ceiling (`None` is unlimited).
    #[must_use]
    pub const fn new(bw: Option<u64>) -> Self {
        Self { bw, total_bw: 0 }
    }

    /// Per-CPU ceiling.
    #[must_use]
    pub const fn ceiling(&self) -> Option<u64> {
        self.bw
    }

    /// Bandwidth admitted so far.
    #[must_use]
    pub const fn total_bw(&self) -> u64 {
        self.total_bw
    }

    /// Ceiling for `cpus` CPUs.
    #[must_use]
    pub fn capacity(&self, cpus: usize) -> Option<u64> {
        self.bw.map(|bw| cap_scale(bw, capacity_of(cpus)))
    }

    /// Free bandwidth for `cpus` CPUs; `u64::MAX` when unlimited.
    #[must_use]
    pub fn available(&self, cpus: usize) -> u64 {
        self.capacity(cpus)
            .map_or(u64::MAX, |cap| cap.saturating_sub(self.total_bw))
    }

    /// Whether swapping `old_bw` for `new_bw` would exceed the ceiling.
    #[must_use]
    pub fn overflows(&self, cpus: usize, old_bw: u64, new_bw: u64) -> bool {
        match self.capacity(cpus) {
            None => false,
            Some(cap) => {
                let after = self.total_bw.saturating_sub(old_bw).saturating_add(new_bw);
                cap < after
            }
        }
    }

    /// Admit a new reservation.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::AdmissionRejected`] without changing the pool
    /// when `bw` does not fit.
    pub fn reserve(&mut self, cpus: usize, bw: u64) -> SchedResult<()> {
        self.update(cpus, 0, bw)
    }

    /// Replace an admitted reservation with a new bandwidth.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::AdmissionRejected`] without changing the pool
    /// when the new total does not fit.
    pub fn update(&mut self, cpus: usize, old_bw: u64, new_bw: u64) -> SchedResult<()> {
        if self.overflows(cpus, old_bw, new_bw) {
            let available = self.available(cpus).saturating_add(old_bw);
            return Err(SchedError::admission_rejected(new_bw, available));
        }
        self.total_bw = self.total_bw.saturating_sub(old_bw).saturating_add(new_bw);
        Ok(())
    }

    /// Return a reservation. Returns `false` when the pool had to be clamped.
    #[must_use]
    pub fn release(&mut self, bw: u64) -> bool {
        if let Some(rest) = self.total_bw.checked_sub(bw) {
            self.total_bw = rest;
            true
        } else {
            self.total_bw = 0;
            false
        }
    }

    /// Whether the admitted bandwidth still fits on `cpus` CPUs.
    #[must_use]
    pub fn fits_on(&self, cpus: usize) -> bool {
        !self.overflows(cpus, 0, 0)
    }

    /// Change the ceiling; refused when already admitted bandwidth would not fit.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::AdmissionRejected`] when `total_bw` exceeds the
    /// new ceiling on `cpus` CPUs.
    pub fn set_ceiling(&mut self, cpus: usize, bw: Option<u64>) -> SchedResult<()> {
        let candidate = Self {
            bw,
            total_bw: self.total_bw,
        };
        if !candidate.fits_on(cpus) {
            return Err(SchedError::admission_rejected(
                self.total_bw,
                candidate.capacity(cpus).unwrap_or(u64::MAX),
            ));
        }
        self.bw = bw;
        Ok(())
    }
}

/// Per-runqueue bandwidth counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RqBandwidth {
    running_bw: u64,
    this_bw: u64,
}

impl RqBandwidth {
    /// Bandwidth of tasks active on this runqueue.
    #[must_use]
    pub const fn running_bw(&self) -> u64 {
        self.running_bw
    }

    /// Bandwidth of tasks assigned to this runqueue.
    #[must_use]
    pub const fn this_bw(&self) -> u64 {
        self.this_bw
    }

    /// Account an activating task.
    pub fn add_running(&mut self, bw: u64) {
        self.running_bw = self.running_bw.saturating_add(bw);
    }

    /// Remove an activating task. Returns `false` when clamped at zero.
    #[must_use]
    pub fn sub_running(&mut self, bw: u64) -> bool {
        sub_clamped(&mut self.running_bw, bw)
    }

    /// Account a task assigned to this runqueue.
    pub fn add_this(&mut self, bw: u64) {
        self.this_bw = self.this_bw.saturating_add(bw);
    }

    /// Remove an assigned task. Returns `false` when clamped at zero.
    #[must_use]
    pub fn sub_this(&mut self, bw: u64) -> bool {
        sub_clamped(&mut self.this_bw, bw)
    }
}

fn sub_clamped(counter: &mut u64, bw: u64) -> bool {
    if let Some(rest) = counter.checked_sub(bw) {
        *counter = rest;
        true
    } else {
        *counter = 0;
        false
    }
}
