//! Property-based tests for rtsched-atomic using quickcheck.

use rtsched_atomic::{CounterSnapshot, SchedCounters};
use quickcheck_macros::quickcheck;

#[quickcheck]
fn prop_counter_increment_is_exact(incs: u8) -> bool {
    let counters = SchedCounters::new();

    for _ in 0..incs {
        counters.inc_dl_replenishment();
    }

    counters.snapshot().dl_replenishments == u64::from(incs)
}

#[quickcheck]
fn prop_borrowed_runtime_accumulates(base: u32, add: u32) -> bool {
    let counters = SchedCounters::new();
    counters.add_rt_runtime_borrowed(u64::from(base));
    counters.add_rt_runtime_borrowed(u64::from(add));

    counters.snapshot().rt_runtime_borrowed_ns == u64::from(base) + u64::from(add)
}

#[quickcheck]
fn prop_snapshot_and_reset_clears_counters(pushes: u8, pulls: u8) -> bool {
    let counters = SchedCounters::new();
    for _ in 0..pushes {
        counters.inc_push_migration();
    }
    for _ in 0..pulls {
        counters.inc_pull_migration();
    }

    let first = counters.snapshot_and_reset();
    let second = counters.snapshot();

    first.push_migrations == u64::from(pushes)
        && first.pull_migrations == u64::from(pulls)
        && second == CounterSnapshot::default()
}

#[quickcheck]
fn prop_abandon_percent_bounded(migrated: u64, abandoned: u64) -> bool {
    let snapshot = CounterSnapshot {
        push_migrations: migrated,
        balance_abandoned: abandoned,
        ..CounterSnapshot::default()
    };
    let pct = snapshot.balance_abandon_percent();
    (0.0..=100.0).contains(&pct)
}

#[quickcheck]
fn prop_counters_are_independent(throttles: u8, rejects: u8, clamps: u8) -> bool {
    let counters = SchedCounters::new();
    for _ in 0..throttles {
        counters.inc_dl_throttle();
    }
    for _ in 0..rejects {
        counters.inc_admission_reject();
    }
    for _ in 0..clamps {
        counters.inc_invariant_clamp();
    }

    let snapshot = counters.snapshot();
    snapshot.dl_throttles == u64::from(throttles)
        && snapshot.admission_rejects == u64::from(rejects)
        && snapshot.invariant_clamps == u64::from(clamps)
        && snapshot.push_migrations == 0
}
