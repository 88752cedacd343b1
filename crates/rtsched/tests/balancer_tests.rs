//! Push/pull balancing across CPUs of a partition.

use rtsched::prelude::*;

const MS: u64 = 1_000_000;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn scheduler(cpus: usize, push_ipi: bool) -> Result<Scheduler, SchedError> {
    let config = SchedConfig::builder()
        .nr_cpus(cpus)
        .rt_bandwidth(RtBandwidthConfig::unlimited())
        .rt_push_ipi(push_ipi)
        .build()?;
    Scheduler::new(config)
}

fn pinned(cpu: usize) -> CpuMask {
    CpuMask::single(cpu)
}

#[test]
fn test_equal_priority_task_is_pushed_to_idle_cpu() -> TestResult {
    let sched = scheduler(2, true)?;
    let a = sched.spawn(SpawnParams::new(SchedAttr::fifo(50)).on_cpu(0), 0)?;
    let b = sched.spawn(SpawnParams::new(SchedAttr::fifo(50)).on_cpu(0), 0)?;
    sched.wake_up_new_task(a, 0)?;
    sched.wake_up_new_task(b, 0)?;
    assert_eq!(sched.task(b)?.cpu, 0);

    assert_eq!(sched.schedule(0, 0)?, Some(a));
    assert_eq!(sched.task(b)?.cpu, 1);
    assert!(sched.need_resched(1)?);
    assert_eq!(sched.schedule(1, 0)?, Some(b));
    assert_eq!(sched.counters().push_migrations, 1);
    sched.check_invariants()?;
    Ok(())
}

#[test]
fn test_wakeup_picks_lower_priority_cpu() -> TestResult {
    let sched = scheduler(3, true)?;
    let busy = sched.spawn(SpawnParams::new(SchedAttr::fifo(90)).on_cpu(0), 0)?;
    sched.wake_up_new_task(busy, 0)?;
    sched.schedule(0, 0)?;
    let other = sched.spawn(SpawnParams::new(SchedAttr::fifo(20)).with_affinity(pinned(1)), 0)?;
    sched.wake_up_new_task(other, 0)?;
    sched.schedule(1, 0)?;

    let woken = sched.spawn(SpawnParams::new(SchedAttr::fifo(40)).on_cpu(0), 0)?;
    sched.wake_up_new_task(woken, MS)?;
    assert_eq!(sched.task(woken)?.cpu, 2);
    assert_eq!(sched.schedule(2, MS)?, Some(woken));
    sched.check_invariants()?;
    Ok(())
}

/// CPU 0 runs `high` with `low` queued behind it; CPU 1 runs a pinned task
/// that is about to block.
fn overloaded_pair(sched: &Scheduler) -> Result<(TaskId, TaskId, TaskId), SchedError> {
    let blocker = sched.spawn(SpawnParams::new(SchedAttr::fifo(90)).with_affinity(pinned(1)), 0)?;
    sched.wake_up_new_task(blocker, 0)?;
    sched.schedule(1, 0)?;

    let high = sched.spawn(SpawnParams::new(SchedAttr::fifo(50)).on_cpu(0), 0)?;
    sched.wake_up_new_task(high, 0)?;
    sched.schedule(0, 0)?;
    let low = sched.spawn(SpawnParams::new(SchedAttr::fifo(40)).on_cpu(0), 0)?;
    sched.wake_up_new_task(low, 0)?;
    sched.schedule(0, 0)?;
    Ok((blocker, high, low))
}

#[test]
fn test_idle_cpu_pulls_queued_rt_task() -> TestResult {
    let sched = scheduler(2, false)?;
    let (blocker, high, low) = overloaded_pair(&sched)?;
    assert_eq!(sched.task(low)?.cpu, 0);
    assert_eq!(sched.current(0)?, Some(high));

    sched.block(blocker, MS)?;
    assert_eq!(sched.schedule(1, MS)?, Some(low));
    assert_eq!(sched.task(low)?.cpu, 1);
    assert_eq!(sched.counters().pull_migrations, 1);
    assert_eq!(sched.pending_ipis(0), 0);
    sched.check_invariants()?;
    Ok(())
}

#[test]
fn test_push_ipi_replaces_pull() -> TestResult {
    let sched = scheduler(2, true)?;
    let (blocker, _high, low) = overloaded_pair(&sched)?;

    sched.block(blocker, MS)?;
    assert_eq!(sched.schedule(1, MS)?, None);
    assert_eq!(sched.pending_ipis(0), 1);
    assert_eq!(sched.task(low)?.cpu, 0);

    assert!(sched.drain_ipis() >= 1);
    assert_eq!(sched.task(low)?.cpu, 1);
    assert!(sched.need_resched(1)?);
    assert_eq!(sched.schedule(1, MS)?, Some(low));

    let counters = sched.counters();
    assert_eq!(counters.push_ipis, 1);
    assert_eq!(counters.push_migrations, 1);
    assert_eq!(counters.pull_migrations, 0);
    sched.check_invariants()?;
    Ok(())
}

#[test]
fn test_process_ipis_rejects_unknown_cpu() -> TestResult {
    let sched = scheduler(2, true)?;
    assert_eq!(sched.process_ipis(5).err(), Some(SchedError::InvalidCpu(5)));
    assert_eq!(
        sched.send_ipi(5, Ipi::PushRt { partition: 0 }).err(),
        Some(SchedError::InvalidCpu(5))
    );
    sched.send_ipi(1, Ipi::PushRt { partition: 0 })?;
    assert_eq!(sched.process_ipis(1)?, 1);
    Ok(())
}

#[test]
fn test_deadline_task_pushed_to_cpu_without_deadline_work() -> TestResult {
    let sched = scheduler(2, true)?;
    let first = sched.spawn(SpawnParams::new(SchedAttr::deadline(5 * MS, 20 * MS, 20 * MS)).on_cpu(0), 0)?;
    let second = sched.spawn(SpawnParams::new(SchedAttr::deadline(5 * MS, 30 * MS, 30 * MS)).on_cpu(0), 0)?;
    sched.wake_up_new_task(first, 0)?;
    sched.wake_up_new_task(second, 0)?;

    assert_eq!(sched.schedule(0, 0)?, Some(first));
    assert_eq!(sched.task(second)?.cpu, 1);
    assert_eq!(sched.schedule(1, 0)?, Some(second));

    let bw = sched.task(second)?.dl.ok_or("no deadline state")?.bandwidth;
    assert_eq!(sched.rq_bandwidth(1)?.running_bw(), bw);
    assert_eq!(sched.rq_bandwidth(1)?.this_bw(), bw);
    sched.check_invariants()?;
    Ok(())
}

#[test]
fn test_cpu_running_out_of_deadline_work_pulls() -> TestResult {
    let sched = scheduler(2, true)?;
    let attr = |deadline_ms: u64| SchedAttr::deadline(2 * MS, deadline_ms * MS, deadline_ms * MS);

    let short = sched.spawn(SpawnParams::new(attr(10)).on_cpu(1), 0)?;
    sched.wake_up_new_task(short, 0)?;
    assert_eq!(sched.schedule(1, 0)?, Some(short));

    let a = sched.spawn(SpawnParams::new(attr(5)).on_cpu(0), 0)?;
    let b = sched.spawn(SpawnParams::new(attr(40)).on_cpu(0), 0)?;
    sched.wake_up_new_task(a, 0)?;
    assert_eq!(sched.schedule(0, 0)?, Some(a));
    sched.wake_up_new_task(b, 0)?;
    sched.schedule(0, 0)?;
    assert_eq!(sched.task(b)?.cpu, 0);

    sched.block(short, MS)?;
    assert_eq!(sched.schedule(1, MS)?, Some(b));
    assert_eq!(sched.counters().pull_migrations, 1);
    sched.check_invariants()?;
    Ok(())
}

#[test]
fn test_affinity_change_moves_running_task() -> TestResult {
    let sched = scheduler(2, true)?;
    let id = sched.spawn(SpawnParams::new(SchedAttr::round_robin(30)).on_cpu(0), 0)?;
    sched.wake_up_new_task(id, 0)?;
    assert_eq!(sched.schedule(0, 0)?, Some(id));

    sched.set_affinity(id, pinned(1), MS)?;
    assert_eq!(sched.task(id)?.cpu, 1);
    assert!(sched.need_resched(0)?);
    assert_eq!(sched.schedule(0, MS)?, None);
    assert_eq!(sched.schedule(1, MS)?, Some(id));
    sched.check_invariants()?;
    Ok(())
}

#[test]
fn test_pinned_deadline_affinity_is_rejected() -> TestResult {
    let sched = scheduler(2, true)?;
    let id = sched.spawn(SpawnParams::new(SchedAttr::deadline(MS, 10 * MS, 10 * MS)), 0)?;
    assert_eq!(
        sched.set_affinity(id, pinned(0), 0).err(),
        Some(SchedError::AffinityExcludesPartition)
    );
    Ok(())
}
