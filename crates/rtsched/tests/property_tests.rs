//! Property-based tests for the scheduler crate.

use proptest::prelude::*;
use quickcheck_macros::quickcheck;
use rtsched::prelude::*;
use rtsched::{BW_UNIT, DlParams};

const MS: u64 = 1_000_000;

#[quickcheck]
fn cpumask_weight_counts_distinct_cpus(cpus: Vec<u8>) -> bool {
    let cpus: Vec<usize> = cpus.into_iter().map(|cpu| usize::from(cpu % 64)).collect();
    let mask: CpuMask = cpus.iter().copied().collect();
    let mut distinct = cpus.clone();
    distinct.sort_unstable();
    distinct.dedup();
    mask.weight() == distinct.len() && cpus.iter().all(|cpu| mask.contains(*cpu))
}

#[quickcheck]
fn cpumask_iter_is_ascending(bits: u64) -> bool {
    let mask = CpuMask::from_bits(bits);
    let cpus: Vec<usize> = mask.iter().collect();
    cpus.windows(2).all(|pair| pair[0] < pair[1]) && cpus.len() == mask.weight()
}

#[quickcheck]
fn bandwidth_never_exceeds_unit(runtime: u32, period: u32) -> bool {
    let period = u64::from(period).max(1);
    let runtime = u64::from(runtime) % (period + 1);
    DlParams::new(runtime, period, period).bandwidth() <= BW_UNIT
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Deadline { runtime_ms: u64, period_ms: u64 },
    Fifo(u32),
    RoundRobin(u32),
    Other,
}

impl Kind {
    fn attr(self) -> SchedAttr {
        match self {
            Self::Deadline {
                runtime_ms,
                period_ms,
            } => SchedAttr::deadline(runtime_ms * MS, period_ms * MS, period_ms * MS),
            Self::Fifo(prio) => SchedAttr::fifo(prio),
            Self::RoundRobin(prio) => SchedAttr::round_robin(prio),
            Self::Other => SchedAttr::other(0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Spawn(Kind, usize),
    Wake(usize),
    Block(usize),
    Exit(usize),
    SetScheduler(usize, Kind),
    Boost(usize, usize),
    Unboost(usize),
    Tick(usize),
    Schedule(usize),
    Advance(u64),
}

fn kind() -> impl Strategy<Value = Kind> {
    prop_oneof![
        (1u64..30, 30u64..200).prop_map(|(runtime_ms, period_ms)| Kind::Deadline {
            runtime_ms,
            period_ms
        }),
        (1u32..99).prop_map(Kind::Fifo),
        (1u32..99).prop_map(Kind::RoundRobin),
        Just(Kind::Other),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (kind(), 0usize..3).prop_map(|(kind, cpu)| Op::Spawn(kind, cpu)),
        (0usize..16).prop_map(Op::Wake),
        (0usize..16).prop_map(Op::Block),
        (0usize..16).prop_map(Op::Exit),
        (0usize..16, kind()).prop_map(|(idx, kind)| Op::SetScheduler(idx, kind)),
        (0usize..16, 0usize..16).prop_map(|(idx, donor)| Op::Boost(idx, donor)),
        (0usize..16).prop_map(Op::Unboost),
        (0usize..3).prop_map(Op::Tick),
        (0usize..3).prop_map(Op::Schedule),
        (1u64..40).prop_map(Op::Advance),
    ]
}

fn apply(sched: &Scheduler, tasks: &mut Vec<TaskId>, now: &mut u64, op: Op) -> SchedResult<()> {
    let pick = |idx: usize| (!tasks.is_empty()).then(|| tasks[idx % tasks.len()]);
    match op {
        Op::Spawn(kind, cpu) => {
            let id = sched.spawn(SpawnParams::new(kind.attr()).on_cpu(cpu), *now)?;
            sched.wake_up_new_task(id, *now)?;
            tasks.push(id);
        }
        Op::Wake(idx) => {
            if let Some(id) = pick(idx) {
                sched.wake_up(id, *now)?;
            }
        }
        Op::Block(idx) => {
            if let Some(id) = pick(idx) {
                sched.block(id, *now)?;
            }
        }
        Op::Exit(idx) => {
            if let Some(id) = pick(idx) {
                sched.exit(id, *now)?;
                tasks.retain(|task| *task != id);
            }
        }
        Op::SetScheduler(idx, kind) => {
            if let Some(id) = pick(idx) {
                sched.set_scheduler(id, kind.attr(), *now)?;
            }
        }
        Op::Boost(idx, donor) => {
            if let (Some(id), Some(donor)) = (pick(idx), pick(donor))
                && id != donor
            {
                sched.rt_mutex_setprio(id, Some(donor), *now)?;
            }
        }
        Op::Unboost(idx) => {
            if let Some(id) = pick(idx) {
                sched.rt_mutex_setprio(id, None, *now)?;
            }
        }
        Op::Tick(cpu) => sched.scheduler_tick(cpu, *now)?,
        Op::Schedule(cpu) => {
            sched.schedule(cpu, *now)?;
        }
        Op::Advance(ms) => {
            *now += ms * MS;
            sched.run_timers(*now);
            sched.drain_ipis();
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_operations_preserve_invariants(ops in prop::collection::vec(op(), 1..80)) {
        let config = SchedConfig::builder()
            .nr_cpus(3)
            .rt_bandwidth(RtBandwidthConfig { runtime_ns: Some(80 * MS), period_ns: 100 * MS })
            .build()
            .map_err(|err| TestCaseError::fail(err.to_string()))?;
        let sched = Scheduler::new(config).map_err(|err| TestCaseError::fail(err.to_string()))?;
        let mut tasks = Vec::new();
        let mut now = 0;

        for op in ops {
            match apply(&sched, &mut tasks, &mut now, op) {
                Ok(())
                | Err(SchedError::AdmissionRejected { .. } | SchedError::InvalidParams(_)) => {}
                Err(err) => return Err(TestCaseError::fail(format!("{op:?} failed: {err}"))),
            }
            sched
                .check_invariants()
                .map_err(|err| TestCaseError::fail(format!("after {op:?}: {err}")))?;
        }
    }

    #[test]
    fn admitted_bandwidth_fits_capacity(
        cpus in 1usize..5,
        requests in prop::collection::vec((1u64..50, 50u64..200), 1..40),
    ) {
        let config = SchedConfig::builder()
            .nr_cpus(cpus)
            .build()
            .map_err(|err| TestCaseError::fail(err.to_string()))?;
        let sched = Scheduler::new(config).map_err(|err| TestCaseError::fail(err.to_string()))?;
        let mut admitted = 0u64;

        for (runtime_ms, period_ms) in requests {
            let attr = SchedAttr::deadline(runtime_ms * MS, period_ms * MS, period_ms * MS);
            match sched.spawn(SpawnParams::new(attr), 0) {
                Ok(_) => admitted += DlParams::new(runtime_ms * MS, period_ms * MS, period_ms * MS).bandwidth(),
                Err(SchedError::AdmissionRejected { .. }) => {}
                Err(err) => return Err(TestCaseError::fail(err.to_string())),
            }
            let pool = sched.dl_bandwidth(0).map_err(|err| TestCaseError::fail(err.to_string()))?;
            prop_assert_eq!(pool.total_bw(), admitted);
            prop_assert!(pool.fits_on(cpus));
        }
    }

    #[test]
    fn replenishment_keeps_budget_positive(
        runtime_ms in 1u64..20,
        period_ms in 20u64..100,
        overrun_ms in 0u64..400,
    ) {
        let config = SchedConfig::builder()
            .nr_cpus(1)
            .rt_bandwidth(RtBandwidthConfig::unlimited())
            .build()
            .map_err(|err| TestCaseError::fail(err.to_string()))?;
        let sched = Scheduler::new(config).map_err(|err| TestCaseError::fail(err.to_string()))?;
        let attr = SchedAttr::deadline(runtime_ms * MS, period_ms * MS, period_ms * MS);
        let fail = |err: SchedError| TestCaseError::fail(err.to_string());

        let id = sched.spawn(SpawnParams::new(attr), 0).map_err(fail)?;
        sched.wake_up_new_task(id, 0).map_err(fail)?;
        sched.schedule(0, 0).map_err(fail)?;
        let mut now = (runtime_ms + overrun_ms) * MS;
        sched.scheduler_tick(0, now).map_err(fail)?;
        let dl = sched.task(id).map_err(fail)?.dl.ok_or_else(|| TestCaseError::fail("no deadline state"))?;
        if dl.throttled {
            now = sched.next_timer().ok_or_else(|| TestCaseError::fail("no timer armed"))?;
            sched.run_timers(now);
        }

        let dl = sched.task(id).map_err(fail)?.dl.ok_or_else(|| TestCaseError::fail("no deadline state"))?;
        prop_assert!(!dl.throttled);
        prop_assert!(dl.runtime > 0);
        prop_assert!(dl.deadline >= now);
        sched.check_invariants().map_err(fail)?;
    }

    #[test]
    fn replenished_deadline_never_decreases(
        runtime_ms in 1u64..20,
        slack_ms in 0u64..40,
        gap_ms in 0u64..60,
        rounds in 2usize..8,
    ) {
        let config = SchedConfig::builder()
            .nr_cpus(1)
            .rt_bandwidth(RtBandwidthConfig::unlimited())
            .build()
            .map_err(|err| TestCaseError::fail(err.to_string()))?;
        let sched = Scheduler::new(config).map_err(|err| TestCaseError::fail(err.to_string()))?;
        let fail = |err: SchedError| TestCaseError::fail(err.to_string());
        let deadline_ms = runtime_ms + slack_ms;
        let attr = SchedAttr::deadline(runtime_ms * MS, deadline_ms * MS, (deadline_ms + gap_ms) * MS);

        let id = sched.spawn(SpawnParams::new(attr), 0).map_err(fail)?;
        sched.wake_up_new_task(id, 0).map_err(fail)?;
        sched.schedule(0, 0).map_err(fail)?;
        let mut now = 0;
        let mut prev = sched.task(id).map_err(fail)?.dl.ok_or_else(|| TestCaseError::fail("no deadline state"))?.deadline;

        for _ in 0..rounds {
            let dl = sched.task(id).map_err(fail)?.dl.ok_or_else(|| TestCaseError::fail("no deadline state"))?;
            now += u64::try_from(dl.runtime).unwrap_or(0).max(1);
            sched.scheduler_tick(0, now).map_err(fail)?;
            let dl = sched.task(id).map_err(fail)?.dl.ok_or_else(|| TestCaseError::fail("no deadline state"))?;
            if dl.throttled {
                now = sched.next_timer().ok_or_else(|| TestCaseError::fail("no timer armed"))?;
                sched.run_timers(now);
            }
            if sched.need_resched(0).map_err(fail)? {
                sched.schedule(0, now).map_err(fail)?;
            }

            let dl = sched.task(id).map_err(fail)?.dl.ok_or_else(|| TestCaseError::fail("no deadline state"))?;
            prop_assert!(dl.deadline >= prev, "deadline went back from {} to {}", prev, dl.deadline);
            prop_assert!(!dl.throttled);
            prev = dl.deadline;
        }
        sched.check_invariants().map_err(fail)?;
    }
}
