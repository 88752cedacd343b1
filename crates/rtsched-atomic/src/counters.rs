//! Atomic event counters for the scheduling core.
//!
//! This module provides [`SchedCounters`], a set of atomic counters bumped by
//! the scheduler while it holds runqueue locks.
//!
//! # Lock Safety
//!
//! All methods on [`SchedCounters`] are safe to call under a spinning lock:
//! - `Ordering::Relaxed` only; counters never publish other memory
//! - No heap allocations
//! - Bounded execution time (single atomic instruction)

use core::sync::atomic::{AtomicU64, Ordering};

/// Counter snapshot returned by [`SchedCounters::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    /// Number of times a CPU switched to a different task
    pub context_switches: u64,
    /// Number of deadline entities throttled after exhausting their runtime
    pub dl_throttles: u64,
    /// Number of CBS replenishments (inline or from the timer)
    pub dl_replenishments: u64,
    /// Timer callbacks that found state changed and did nothing
    pub timer_noops: u64,
    /// Deadline reservations refused by admission control
    pub admission_rejects: u64,
    /// Times a CPU's RT group was throttled
    pub rt_throttles: u64,
    /// Times a throttled RT group was released by the period timer
    pub rt_unthrottles: u64,
    /// Nanoseconds of RT runtime borrowed from sibling CPUs
    pub rt_runtime_borrowed_ns: u64,
    /// Tasks migrated by a push
    pub push_migrations: u64,
    /// Tasks migrated by a pull
    pub pull_migrations: u64,
    /// Balance attempts given up because of lock contention or changed state
    pub balance_abandoned: u64,
    /// RT push IPIs sent
    pub push_ipis: u64,
    /// Invariant violations that were clamped to a safe value
    pub invariant_clamps: u64,
}

/// Atomic event counters for the scheduling core.
///
/// # Thread Safety
///
/// All counters use `AtomicU64` with `Ordering::Relaxed`. Values are
/// eventually consistent; a snapshot taken while other CPUs are scheduling
/// may mix values from slightly different instants.
///
/// # Example
///
/// ```rust
/// use rtsched_atomic::SchedCounters;
///
/// let counters = SchedCounters::new();
/// counters.inc_admission_reject();
/// counters.add_rt_runtime_borrowed(250_000);
///
/// let snapshot = counters.snapshot();
/// assert_eq!(snapshot.admission_rejects, 1);
/// assert_eq!(snapshot.rt_runtime_borrowed_ns, 250_000);
/// ```
#[derive(Debug)]
pub struct SchedCounters {
    context_switches: AtomicU64,
    dl_throttles: AtomicU64,
    dl_replenishments: AtomicU64,
    timer_noops: AtomicU64,
    admission_rejects: AtomicU64,
    rt_throttles: AtomicU64,
    rt_unthrottles: AtomicU64,
    rt_runtime_borrowed_ns: AtomicU64,
    push_migrations: AtomicU64,
    pull_migrations: AtomicU64,
    balance_abandoned: AtomicU64,
    push_ipis: AtomicU64,
    invariant_clamps: AtomicU64,
}

impl Default for SchedCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedCounters {
    /// Create a new `SchedCounters` with all counters initialized to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            context_switches: AtomicU64::new(0),
            dl_throttles: AtomicU64::new(0),
            dl_replenishments: AtomicU64::new(0),
            timer_noops: AtomicU64::new(0),
            admission_rejects: AtomicU64::new(0),
            rt_throttles: AtomicU64::new(0),
            rt_unthrottles: AtomicU64::new(0),
            rt_runtime_borrowed_ns: AtomicU64::new(0),
            push_migrations: AtomicU64::new(0),
            pull_migrations: AtomicU64::new(0),
            balance_abandoned: AtomicU64::new(0),
            push_ipis: AtomicU64::new(0),
            invariant_clamps: AtomicU64::new(0),
        }
    }

    /// Increment the context switch counter.
    #[inline]
    pub fn inc_context_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the deadline throttle counter.
    ///
    /// Call this when a deadline entity runs out of runtime (or yields) and
    /// leaves the runqueue until its next period.
    #[inline]
    pub fn inc_dl_throttle(&self) {
        self.dl_throttles.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the CBS replenishment counter.
    #[inline]
    pub fn inc_dl_replenishment(&self) {
        self.dl_replenishments.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the timer no-op counter.
    ///
    /// A timer that fires after the entity migrated, changed policy or was
    /// already replenished is an expected race, not an error.
    #[inline]
    pub fn inc_timer_noop(&self) {
        self.timer_noops.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the admission rejection counter.
    #[inline]
    pub fn inc_admission_reject(&self) {
        self.admission_rejects.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the RT group throttle counter.
    #[inline]
    pub fn inc_rt_throttle(&self) {
        self.rt_throttles.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the RT group unthrottle counter.
    #[inline]
    pub fn inc_rt_unthrottle(&self) {
        self.rt_unthrottles.fetch_add(1, Ordering::Relaxed);
    }

    /// Add to the borrowed RT runtime total.
    #[inline]
    pub fn add_rt_runtime_borrowed(&self, ns: u64) {
        self.rt_runtime_borrowed_ns.fetch_add(ns, Ordering::Relaxed);
    }

    /// Increment the push migration counter.
    #[inline]
    pub fn inc_push_migration(&self) {
        self.push_migrations.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the pull migration counter.
    #[inline]
    pub fn inc_pull_migration(&self) {
        self.pull_migrations.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the abandoned balance attempt counter.
    #[inline]
    pub fn inc_balance_abandoned(&self) {
        self.balance_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the push IPI counter.
    #[inline]
    pub fn inc_push_ipi(&self) {
        self.push_ipis.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the invariant clamp counter.
    #[inline]
    pub fn inc_invariant_clamp(&self) {
        self.invariant_clamps.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all counter values.
    ///
    /// This reads all counters without resetting them.
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            context_switches: self.context_switches.load(Ordering::Relaxed),
            dl_throttles: self.dl_throttles.load(Ordering::Relaxed),
            dl_replenishments: self.dl_replenishments.load(Ordering::Relaxed),
            timer_noops: self.timer_noops.load(Ordering::Relaxed),
            admission_rejects: self.admission_rejects.load(Ordering::Relaxed),
            rt_throttles: self.rt_throttles.load(Ordering::Relaxed),
            rt_unthrottles: self.rt_unthrottles.load(Ordering::Relaxed),
            rt_runtime_borrowed_ns: self.rt_runtime_borrowed_ns.load(Ordering::Relaxed),
            push_migrations: self.push_migrations.load(Ordering::Relaxed),
            pull_migrations: self.pull_migrations.load(Ordering::Relaxed),
            balance_abandoned: self.balance_abandoned.load(Ordering::Relaxed),
            push_ipis: self.push_ipis.load(Ordering::Relaxed),
            invariant_clamps: self.invariant_clamps.load(Ordering::Relaxed),
        }
    }

    /// Get a snapshot and reset all counters to zero.
    #[inline]
    #[must_use]
    pub fn snapshot_and_reset(&self) -> CounterSnapshot {
        CounterSnapshot {
            context_switches: self.context_switches.swap(0, Ordering::Relaxed),
            dl_throttles: self.dl_throttles.swap(0, Ordering::Relaxed),
            dl_replenishments: self.dl_replenishments.swap(0, Ordering::Relaxed),
            timer_noops: self.timer_noops.swap(0, Ordering::Relaxed),
            admission_rejects: self.admission_rejects.swap(0, Ordering::Relaxed),
            rt_throttles: self.rt_throttles.swap(0, Ordering::Relaxed),
            rt_unthrottles: self.rt_unthrottles.swap(0, Ordering::Relaxed),
            rt_runtime_borrowed_ns: self.rt_runtime_borrowed_ns.swap(0, Ordering::Relaxed),
            push_migrations: self.push_migrations.swap(0, Ordering::Relaxed),
            pull_migrations: self.pull_migrations.swap(0, Ordering::Relaxed),
            balance_abandoned: self.balance_abandoned.swap(0, Ordering::Relaxed),
            push_ipis: self.push_ipis.swap(0, Ordering::Relaxed),
            invariant_clamps: self.invariant_clamps.swap(0, Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    #[inline]
    pub fn reset(&self) {
        for counter in [
            &self.context_switches,
            &self.dl_throttles,
            &self.dl_replenishments,
            &self.timer_noops,
            &self.admission_rejects,
            &self.rt_throttles,
            &self.rt_unthrottles,
            &self.rt_runtime_borrowed_ns,
            &self.push_migrations,
            &self.pull_migrations,
            &self.balance_abandoned,
            &self.push_ipis,
            &self.invariant_clamps,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Total tasks migrated by push and pull.
    #[inline]
    #[must_use]
    pub fn migrations(&self) -> u64 {
        self.push_migrations
            .load(Ordering::Relaxed)
            .saturating_add(self.pull_migrations.load(Ordering::Relaxed))
    }

    /// Get the current deadline throttle count.
    #[inline]
    #[must_use]
    pub fn dl_throttles(&self) -> u64 {
        self.dl_throttles.load(Ordering::Relaxed)
    }

    /// Get the current invariant clamp count.
    #[inline]
    #[must_use]
    pub fn invariant_clamps(&self) -> u64 {
        self.invariant_clamps.load(Ordering::Relaxed)
    }
}

impl CounterSnapshot {
    /// Percentage of balance attempts that were abandoned.
    ///
    /// Returns 0.0 if no balance attempt has been recorded.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_precision_loss, reason = "percentage for display only")]
    pub fn balance_abandon_percent(&self) -> f32 {
        let migrated = self.push_migrations.saturating_add(self.pull_migrations);
        let total = migrated.saturating_add(self.balance_abandoned);
        if total == 0 {
            return 0.0;
        }
        (self.balance_abandoned as f32 / total as f32) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_counters_are_zero() {
        let counters = SchedCounters::new();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn test_inc_dl_throttle() {
        let counters = SchedCounters::new();
        counters.inc_dl_throttle();
        counters.inc_dl_throttle();
        assert_eq!(counters.dl_throttles(), 2);
    }

    #[test]
    fn test_migrations_sums_push_and_pull() {
        let counters = SchedCounters::new();
        counters.inc_push_migration();
        counters.inc_pull_migration();
        counters.inc_pull_migration();
        assert_eq!(counters.migrations(), 3);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let counters = SchedCounters::new();
        counters.inc_context_switch();
        counters.inc_timer_noop();
        counters.add_rt_runtime_borrowed(1_000);

        let snapshot = counters.snapshot_and_reset();
        assert_eq!(snapshot.context_switches, 1);
        assert_eq!(snapshot.timer_noops, 1);
        assert_eq!(snapshot.rt_runtime_borrowed_ns, 1_000);

        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn test_balance_abandon_percent() {
        let counters = SchedCounters::new();
        assert_eq!(counters.snapshot().balance_abandon_percent(), 0.0);

        counters.inc_push_migration();
        counters.inc_balance_abandoned();

        let pct = counters.snapshot().balance_abandon_percent();
        assert!((pct - 50.0).abs() < f32::EPSILON);
    }
}
