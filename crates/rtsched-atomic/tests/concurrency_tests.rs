//! Counters bumped from many CPUs at once must never lose increments.

use std::thread;

use rtsched_atomic::SchedCounters;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const CPUS: u64 = 8;

fn on_each_cpu(counters: &SchedCounters, cpus: u64, work: impl Fn(&SchedCounters, u64) + Sync) -> TestResult {
    let work = &work;
    thread::scope(|scope| {
        let workers: Vec<_> = (0..cpus).map(|cpu| scope.spawn(move || work(counters, cpu))).collect();
        workers
            .into_iter()
            .try_for_each(|worker| worker.join().map_err(|panic| format!("counter worker panicked: {panic:?}")))
    })?;
    Ok(())
}

#[test]
fn test_context_switches_from_every_cpu_add_up() -> TestResult {
    let counters = SchedCounters::new();
    on_each_cpu(&counters, CPUS, |counters, _| {
        (0..10_000).for_each(|_| counters.inc_context_switch());
    })?;

    assert_eq!(counters.snapshot().context_switches, CPUS * 10_000);
    Ok(())
}

#[test]
fn test_push_and_pull_migrations_split_by_cpu() -> TestResult {
    let counters = SchedCounters::new();
    let rounds = 5_000;
    on_each_cpu(&counters, 4, |counters, cpu| {
        for round in 0..rounds {
            match cpu % 2 {
                0 => counters.inc_push_migration(),
                _ => counters.inc_pull_migration(),
            }
            if round % 10 == 0 {
                counters.inc_balance_abandoned();
            }
        }
    })?;

    let snap = counters.snapshot();
    assert_eq!(counters.migrations(), 4 * rounds);
    assert_eq!(snap.push_migrations, 2 * rounds);
    assert_eq!(snap.pull_migrations, 2 * rounds);
    assert_eq!(snap.balance_abandoned, 4 * rounds / 10);
    Ok(())
}

#[test]
fn test_reset_while_throttling_loses_nothing() -> TestResult {
    let counters = SchedCounters::new();
    let throttles_per_cpu = 5_000;

    let drained = thread::scope(|scope| {
        let writers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    (0..throttles_per_cpu).for_each(|_| counters.inc_dl_throttle());
                })
            })
            .collect();
        let reader = scope.spawn(|| {
            (0..200).fold(0u64, |sum, _| {
                thread::yield_now();
                sum + counters.snapshot_and_reset().dl_throttles
            })
        });
        for writer in writers {
            writer.join().map_err(|panic| format!("throttle writer panicked: {panic:?}"))?;
        }
        reader.join().map_err(|panic| format!("snapshot reader panicked: {panic:?}"))
    })?;

    assert_eq!(drained + counters.snapshot().dl_throttles, 4 * throttles_per_cpu);
    Ok(())
}
