//! Scheduler configuration.
//!
//! Every tunable that shapes admission, enforcement or balancing lives here so
//! an embedder can load it from JSON (or any serde format) and validate it
//! once before constructing a [`Scheduler`](crate::Scheduler).

use serde::{Deserialize, Serialize};

use crate::bandwidth::to_ratio;
use crate::error::{SchedError, SchedResult};
use crate::types::{CpuMask, MAX_CPUS};

/// Nanoseconds per millisecond.
pub const NSEC_PER_MSEC: u64 = 1_000_000;

/// Nanoseconds per microsecond.
pub const NSEC_PER_USEC: u64 = 1_000;

/// Deadline bandwidth ceiling, expressed as runtime per period.
///
/// `runtime_ns = None` removes the ceiling entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthLimit {
    /// Runtime share of every period, or `None` for unlimited.
    pub runtime_ns: Option<u64>,
    /// Reference period.
    pub period_ns: u64,
}

impl Default for BandwidthLimit {
    fn default() -> Self {
        Self {
            runtime_ns: Some(950 * NSEC_PER_MSEC),
            period_ns: 1_000 * NSEC_PER_MSEC,
        }
    }
}

impl BandwidthLimit {
    /// No ceiling.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            runtime_ns: None,
            period_ns: 1_000 * NSEC_PER_MSEC,
        }
    }

    /// Ceiling equal to `numerator / denominator` of every CPU.
    #[must_use]
    pub const fn fraction(numerator: u64, denominator: u64) -> Self {
        Self {
            runtime_ns: Some(numerator),
            period_ns: denominator,
        }
    }

    /// Per-CPU ceiling as a `BW_SHIFT` fixed-point ratio, `None` when unlimited.
    #[must_use]
    pub fn ratio(&self) -> Option<u64> {
        self.runtime_ns.map(|runtime| to_ratio(self.period_ns, runtime))
    }

    pub(crate) fn validate(&self, what: &str) -> SchedResult<()> {
        if self.period_ns == 0 {
            return Err(SchedError::invalid_config(format!(
                "{what}.period_ns must be greater than 0"
            )));
        }
        if let Some(runtime) = self.runtime_ns
            && runtime > self.period_ns
        {
            return Err(SchedError::invalid_config(format!(
                "{what}.runtime_ns must not exceed period_ns"
            )));
        }
        Ok(())
    }
}

/// Group bandwidth for the fixed-priority class.
///
/// Every CPU of a partition may run real-time work for at most `runtime_ns`
/// per `period_ns` before its RT group is throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtBandwidthConfig {
    /// Runtime per period, or `None` to disable throttling.
    pub runtime_ns: Option<u64>,
    /// Throttling period.
    pub period_ns: u64,
}

impl Default for RtBandwidthConfig {
    fn default() -> Self {
        Self {
            runtime_ns: Some(950 * NSEC_PER_MSEC),
            period_ns: 1_000 * NSEC_PER_MSEC,
        }
    }
}

impl RtBandwidthConfig {
    /// Throttling disabled.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            runtime_ns: None,
            period_ns: 1_000 * NSEC_PER_MSEC,
        }
    }

    /// Validate the group bandwidth settings.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidConfig`] for a zero period or a runtime
    /// longer than the period.
    pub fn validate(&self) -> SchedResult<()> {
        BandwidthLimit {
            runtime_ns: self.runtime_ns,
            period_ns: self.period_ns,
        }
        .validate("rt_bandwidth")
    }
}

/// Cross-CPU balancing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceConfig {
    /// Attempts at taking a second runqueue lock before giving up.
    pub lock_retries: u32,
    /// Target searches per push before the push is abandoned.
    pub max_push_tries: u32,
    /// Replace RT pulls with an IPI asking overloaded CPUs to push.
    pub rt_push_ipi: bool,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            lock_retries: 16,
            max_push_tries: 3,
            rt_push_ipi: true,
        }
    }
}

/// Top-level scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedConfig {
    /// Number of CPUs managed (`1..=64`).
    pub nr_cpus: usize,
    /// Disjoint CPU partitions. Empty means one partition spanning every CPU.
    pub partitions: Vec<CpuMask>,
    /// Deadline bandwidth ceiling per CPU.
    pub dl_bandwidth: BandwidthLimit,
    /// Fixed-priority group bandwidth.
    pub rt_bandwidth: RtBandwidthConfig,
    /// Balancer knobs.
    pub balance: BalanceConfig,
    /// Round-robin time slice.
    pub rr_timeslice_ns: u64,
    /// Right shift applied before CBS cross-multiplication.
    pub dl_scale_shift: u32,
    /// Shortest deadline period accepted.
    pub dl_period_min_ns: u64,
    /// Longest deadline period accepted.
    pub dl_period_max_ns: u64,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            nr_cpus: 4,
            partitions: Vec::new(),
            dl_bandwidth: BandwidthLimit::default(),
            rt_bandwidth: RtBandwidthConfig::default(),
            balance: BalanceConfig::default(),
            rr_timeslice_ns: 100 * NSEC_PER_MSEC,
            dl_scale_shift: 10,
            dl_period_min_ns: 100 * NSEC_PER_USEC,
            dl_period_max_ns: (1u64 << 22) * NSEC_PER_USEC,
        }
    }
}

impl SchedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::InvalidConfig`] describing the first invalid field.
    pub fn validate(&self) -> SchedResult<()> {
        if self.nr_cpus == 0 || self.nr_cpus > MAX_CPUS {
            return Err(SchedError::invalid_config(format!(
                "nr_cpus must be within 1..={MAX_CPUS}"
            )));
        }

        let all = CpuMask::first_n(self.nr_cpus);
        let mut covered = CpuMask::EMPTY;
        for (idx, part) in self.partitions.iter().enumerate() {
            if part.is_empty() {
                return Err(SchedError::invalid_config(format!(
                    "partition {idx} is empty"
                )));
            }
            if !part.is_subset_of(all) {
                return Err(SchedError::invalid_config(format!(
                    "partition {idx} names CPUs beyond nr_cpus"
                )));
            }
            if part.intersects(covered) {
                return Err(SchedError::invalid_config(format!(
                    "partition {idx} overlaps an earlier partition"
                )));
            }
            covered = covered | *part;
        }
        if !self.partitions.is_empty() && covered != all {
            return Err(SchedError::invalid_config(
                "partitions must cover every CPU",
            ));
        }

        self.dl_bandwidth.validate("dl_bandwidth")?;
        self.rt_bandwidth.validate()?;

        if self.balance.lock_retries == 0 {
            return Err(SchedError::invalid_config(
                "balance.lock_retries must be greater than 0",
            ));
        }
        if self.balance.max_push_tries == 0 {
            return Err(SchedError::invalid_config(
                "balance.max_push_tries must be greater than 0",
            ));
        }
        if self.rr_timeslice_ns == 0 {
            return Err(SchedError::invalid_config(
                "rr_timeslice_ns must be greater than 0",
            ));
        }
        if self.dl_scale_shift >= 32 {
            return Err(SchedError::invalid_config(
                "dl_scale_shift must be below 32",
            ));
        }
        if self.dl_period_min_ns == 0 || self.dl_period_min_ns > self.dl_period_max_ns {
            return Err(SchedError::invalid_config(
                "dl_period_min_ns must be non-zero and not above dl_period_max_ns",
            ));
        }
        Ok(())
    }

    /// Partition spans, with the implicit single partition expanded.
    #[must_use]
    pub fn partition_masks(&self) -> Vec<CpuMask> {
        if self.partitions.is_empty() {
            vec![CpuMask::first_n(self.nr_cpus)]
        } else {
            self.partitions.clone()
        }
    }

    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> SchedConfigBuilder {
        SchedConfigBuilder::default()
    }
}

/// Builder for `SchedConfig`.
#[derive(Debug, Default)]
pub struct SchedConfigBuilder {
    config: SchedConfig,
}

impl SchedConfigBuilder {
    /// Set the number of CPUs.
    #[must_use]
    pub fn nr_cpus(mut self, nr_cpus: usize) -> Self {
        self.config.nr_cpus = nr_cpus;
        self
    }

    /// Append a partition.
    #[must_use]
    pub fn partition(mut self, span: CpuMask) -> Self {
        self.config.partitions.push(span);
        self
    }

    /// Set the deadline bandwidth ceiling.
    #[must_use]
    pub fn dl_bandwidth(mut self, limit: BandwidthLimit) -> Self {
        self.config.dl_bandwidth = limit;
        self
    }

    /// Set the fixed-priority group bandwidth.
    #[must_use]
    pub fn rt_bandwidth(mut self, rt: RtBandwidthConfig) -> Self {
        self.config.rt_bandwidth = rt;
        self
    }

    /// Set the number of second-lock attempts.
    #[must_use]
    pub fn lock_retries(mut self, retries: u32) -> Self {
        self.config.balance.lock_retries = retries;
        self
    }

    /// Set the push retry limit.
    #[must_use]
    pub fn max_push_tries(mut self, tries: u32) -> Self {
        self.config.balance.max_push_tries = tries;
        self
    }

    /// Enable or disable IPI-driven RT pulls.
    #[must_use]
    pub fn rt_push_ipi(mut self, enabled: bool) -> Self {
        self.config.balance.rt_push_ipi = enabled;
        self
    }

    /// Set the round-robin slice.
    #[must_use]
    pub fn rr_timeslice_ns(mut self, ns: u64) -> Self {
        self.config.rr_timeslice_ns = ns;
        self
    }

    /// Set the CBS comparison shift.
    #[must_use]
    pub fn dl_scale_shift(mut self, shift: u32) -> Self {
        self.config.dl_scale_shift = shift;
        self
    }

    /// Set the accepted deadline period range.
    #[must_use]
    pub fn dl_period_range_ns(mut self, min: u64, max: u64) -> Self {
        self.config.dl_period_min_ns = min;
        self.config.dl_period_max_ns = max;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> SchedResult<SchedConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SchedConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        assert!(SchedConfig::builder().nr_cpus(0).build().is_err());
        assert!(SchedConfig::builder().nr_cpus(65).build().is_err());
        assert!(SchedConfig::builder().lock_retries(0).build().is_err());
        assert!(SchedConfig::builder().rr_timeslice_ns(0).build().is_err());
        assert!(
            SchedConfig::builder()
                .dl_bandwidth(BandwidthLimit::fraction(2, 1))
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_partitions_must_be_disjoint_and_covering() {
        let overlapping = SchedConfig::builder()
            .nr_cpus(4)
            .partition(CpuMask::from_bits(0b0011))
            .partition(CpuMask::from_bits(0b0110))
            .build();
        assert!(matches!(overlapping, Err(SchedError::InvalidConfig(_))));

        let gap = SchedConfig::builder()
            .nr_cpus(4)
            .partition(CpuMask::from_bits(0b0011))
            .build();
        assert!(gap.is_err());

        let ok = SchedConfig::builder()
            .nr_cpus(4)
            .partition(CpuMask::from_bits(0b0011))
            .partition(CpuMask::from_bits(0b1100))
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_partition_masks_default_spans_all() {
        let config = SchedConfig {
            nr_cpus: 3,
            ..SchedConfig::default()
        };
        assert_eq!(config.partition_masks(), vec![CpuMask::first_n(3)]);
    }

    #[test]
    fn test_json_round_trip() -> Result<(), serde_json::Error> {
        let config = SchedConfig {
            nr_cpus: 2,
            dl_bandwidth: BandwidthLimit::unlimited(),
            ..SchedConfig::default()
        };
        let json = serde_json::to_string(&config)?;
        let back: SchedConfig = serde_json::from_str(&json)?;
        assert_eq!(back, config);

        let partial: SchedConfig = serde_json::from_str(r#"{"nr_cpus": 8}"#)?;
        assert_eq!(partial.nr_cpus, 8);
        assert_eq!(partial.rr_timeslice_ns, 100 * NSEC_PER_MSEC);
        Ok(())
    }
}
