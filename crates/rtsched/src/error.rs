//! Error types for the scheduler crate.
//!
//! Every fallible public operation returns [`SchedResult`]. Errors carry a
//! stable numeric [`code`](SchedError::code) so embedders can map them onto
//! their own errno-style surface.

use thiserror::Error;

use crate::types::TaskId;

/// Errors returned by scheduler operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedError {
    /// A deadline reservation does not fit in the partition's bandwidth pool.
    #[error("Admission rejected: requested bandwidth {requested} exceeds available {available}")]
    AdmissionRejected {
        /// Requested bandwidth (`BW_SHIFT` fixed point).
        requested: u64,
        /// Bandwidth still free in the pool at the time of the request.
        available: u64,
    },

    /// Scheduling attributes failed validation.
    #[error("Invalid scheduling parameters: {0}")]
    InvalidParams(String),

    /// Scheduler configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// CPU index outside `0..nr_cpus`.
    #[error("Invalid CPU index: {0}")]
    InvalidCpu(usize),

    /// No task with this identifier was ever created.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// The affinity mask selects no CPU managed by this scheduler.
    #[error("Affinity mask selects no available CPU")]
    EmptyAffinity,

    /// Deadline tasks must be allowed on every CPU of their partition.
    #[error("Deadline task affinity must span its whole partition")]
    AffinityExcludesPartition,

    /// The task already exited.
    #[error("Task {0} has exited")]
    TaskDead(TaskId),

    /// A structural invariant did not hold.
    #[error("Scheduler invariant violated: {0}")]
    InvariantViolation(String),
}

impl SchedError {
    /// Create an admission rejection.
    #[must_use]
    pub fn admission_rejected(requested: u64, available: u64) -> Self {
        Self::AdmissionRejected {
            requested,
            available,
        }
    }

    /// Create an invalid parameters error.
    #[must_use]
    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::InvalidParams(reason.into())
    }

    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Create an invariant violation error.
    #[must_use]
    pub fn invariant(reason: impl Into<String>) -> Self {
        Self::InvariantViolation(reason.into())
    }

    /// Stable numeric code for this error.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::AdmissionRejected { .. } => 1,
            Self::InvalidParams(_) => 2,
            Self::InvalidConfig(_) => 3,
            Self::InvalidCpu(_) => 4,
            Self::TaskNotFound(_) => 5,
            Self::EmptyAffinity => 6,
            Self::AffinityExcludesPartition => 7,
            Self::TaskDead(_) => 8,
            Self::InvariantViolation(_) => 9,
        }
    }

    /// Whether the caller can retry with different arguments.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AdmissionRejected { .. }
                | Self::InvalidParams(_)
                | Self::EmptyAffinity
                | Self::AffinityExcludesPartition
        )
    }
}

/// A specialized `Result` type for scheduler operations.
pub type SchedResult<T = ()> = std::result::Result<T, SchedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedError::admission_rejected(629_145, 419_430);
        let text = err.to_string();
        assert!(text.contains("629145"));
        assert!(text.contains("419430"));

        let err = SchedError::TaskNotFound(TaskId::new(7));
        assert!(err.to_string().contains("task:7"));
    }

    #[test]
    fn test_error_codes_are_unique() {
        let errors = [
            SchedError::admission_rejected(1, 0),
            SchedError::invalid_params("x"),
            SchedError::invalid_config("x"),
            SchedError::InvalidCpu(9),
            SchedError::TaskNotFound(TaskId::new(1)),
            SchedError::EmptyAffinity,
            SchedError::AffinityExcludesPartition,
            SchedError::TaskDead(TaskId::new(1)),
            SchedError::invariant("x"),
        ];
        let mut codes: Vec<u8> = errors.iter().map(SchedError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_error_recoverability() {
        assert!(SchedError::admission_rejected(1, 0).is_recoverable());
        assert!(SchedError::EmptyAffinity.is_recoverable());
        assert!(!SchedError::InvalidCpu(3).is_recoverable());
        assert!(!SchedError::TaskDead(TaskId::new(2)).is_recoverable());
    }
}
