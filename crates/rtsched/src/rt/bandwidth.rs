//! Group bandwidth throttling for the fixed-priority class.
//!
//! Each CPU of a partition owns an [`RtRuntime`] slot: the real-time time
//! executed in the current period and the runtime it may use. A CPU that runs
//! out first borrows unused runtime from its siblings; if that is not enough
//! its RT group is throttled until the period timer decays `rt_time` again.
//!
//! Lock order: `borrow_lock` → slot locks. Slot locks are leaves and may be
//! taken while a runqueue lock is held.

use parking_lot::Mutex;

use crate::config::RtBandwidthConfig;
use crate::timer::TimerHandle;
use crate::types::CpuMask;

/// Per-CPU runtime slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtRuntime {
    /// Real-time execution charged in the current period.
    pub rt_time: u64,
    /// Runtime available this period, `None` for unlimited.
    pub rt_runtime: Option<u64>,
}

/// Result of a period boundary for one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodTick {
    /// The CPU may run real-time work again.
    pub unthrottle: bool,
    /// Nothing left to account on this CPU.
    pub idle: bool,
}

#[derive(Debug, Default)]
struct PeriodTimer {
    active: bool,
    generation: u64,
    expires: u64,
    handle: Option<TimerHandle>,
}

/// RT group bandwidth of one partition.
#[derive(Debug)]
pub struct RtBandwidth {
    config: Mutex<RtBandwidthConfig>,
    borrow_lock: Mutex<()>,
    cpus: Vec<usize>,
    slots: Box<[Mutex<RtRuntime>]>,
    timer: Mutex<PeriodTimer>,
}

impl RtBandwidth {
    /// Bandwidth state for every CPU of `span`.
    #[must_use]
    pub fn new(span: CpuMask, config: RtBandwidthConfig) -> Self {
        let cpus: Vec<usize> = span.iter().collect();
        let slots = cpus
            .iter()
            .map(|_| {
                Mutex::new(RtRuntime {
                    rt_time: 0,
                    rt_runtime: config.runtime_ns,
                })
            })
            .collect();
        Self {
            config: Mutex::new(config),
            borrow_lock: Mutex::new(()),
            cpus,
            slots,
            timer: Mutex::new(PeriodTimer::default()),
        }
    }

    fn slot(&self, cpu: usize) -> Option<&Mutex<RtRuntime>> {
        let idx = self.cpus.iter().position(|c| *c == cpu)?;
        self.slots.get(idx)
    }

    /// Current settings.
    #[must_use]
    pub fn config(&self) -> RtBandwidthConfig {
        *self.config.lock()
    }

    /// Whether throttling is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.lock().runtime_ns.is_some()
    }

    /// Snapshot of `cpu`'s slot.
    #[must_use]
    pub fn runtime_of(&self, cpu: usize) -> Option<RtRuntime> {
        self.slot(cpu).map(|slot| *slot.lock())
    }

    /// Install new settings. Every slot gets the new runtime and keeps its `rt_time`.
    pub fn set_config(&self, config: RtBandwidthConfig) {
        let _borrow = self.borrow_lock.lock();
        *self.config.lock() = config;
        for slot in &*self.slots {
            slot.lock().rt_runtime = config.runtime_ns;
        }
    }

    /// Charge `delta` of real-time execution to `cpu`.
    pub fn account(&self, cpu: usize, delta: u64) {
        if !self.is_enabled() {
            return;
        }
        if let Some(slot) = self.slot(cpu) {
            let mut slot = slot.lock();
            slot.rt_time = slot.rt_time.saturating_add(delta);
        }
    }

    /// Whether `cpu` used up its runtime, borrowing from siblings first.
    ///
    /// Returns `(exceeded, borrowed_ns)`.
    #[must_use]
    pub fn runtime_exceeded(&self, cpu: usize) -> (bool, u64) {
        let period = self.config.lock().period_ns;
        let Some(slot) = self.slot(cpu) else {
            return (false, 0);
        };
        let RtRuntime {
            rt_time,
            rt_runtime,
        } = *slot.lock();
        let Some(runtime) = rt_runtime else {
            return (false, 0);
        };
        if runtime >= period || rt_time <= runtime {
            return (false, 0);
        }

        let borrowed = self.borrow_runtime(cpu, period);
        let now = *slot.lock();
        let exceeded = now.rt_runtime.is_some_and(|runtime| now.rt_time > runtime);
        (exceeded, borrowed)
    }

    fn borrow_runtime(&self, cpu: usize, period: u64) -> u64 {
        let _borrow = self.borrow_lock.lock();
        let Some(own_slot) = self.slot(cpu) else {
            return 0;
        };
        let Some(mut own) = own_slot.lock().rt_runtime else {
            return 0;
        };
        let weight = u64::try_from(self.cpus.len()).unwrap_or(1).max(1);
        let mut gained = 0u64;

        for (idx, sibling_cpu) in self.cpus.iter().enumerate() {
            if *sibling_cpu == cpu || own >= period {
                continue;
            }
            let Some(sibling) = self.slots.get(idx) else {
                continue;
            };
            let mut sibling = sibling.lock();
            let Some(theirs) = sibling.rt_runtime else {
                continue;
            };
            let spare = theirs.saturating_sub(sibling.rt_time);
            if spare == 0 {
                continue;
            }
            let diff = (spare / weight).min(period - own);
            sibling.rt_runtime = Some(theirs - diff);
            own += diff;
            gained += diff;
        }

        own_slot.lock().rt_runtime = Some(own);
        gained
    }

    /// Apply a period boundary to `cpu`: decay `rt_time` by `overrun` periods
    /// worth of runtime and hand back the configured runtime.
    #[must_use]
    pub fn period_tick(&self, cpu: usize, overrun: u64, queued: bool, throttled: bool) -> PeriodTick {
        let _borrow = self.borrow_lock.lock();
        let configured = self.config.lock().runtime_ns;
        let Some(slot) = self.slot(cpu) else {
            return PeriodTick {
                unthrottle: throttled,
                idle: true,
            };
        };
        let mut slot = slot.lock();
        slot.rt_runtime = configured;

        let runtime = configured.unwrap_or(u64::MAX);
        let mut idle = true;
        let mut unthrottle = false;
        if slot.rt_time > 0 {
            slot.rt_time = slot.rt_time.saturating_sub(overrun.saturating_mul(runtime));
            if throttled && slot.rt_time < runtime {
                unthrottle = true;
            }
            if slot.rt_time > 0 || queued {
                idle = false;
            }
        } else if queued {
            idle = false;
            unthrottle = throttled;
        } else {
            unthrottle = throttled;
        }
        if throttled && !unthrottle {
            idle = false;
        }
        PeriodTick { unthrottle, idle }
    }

    /// Reserve the period timer if it is idle. Returns `(expires, generation)`
    /// for the caller to arm.
    #[must_use]
    pub fn start_timer(&self, now: u64) -> Option<(u64, u64)> {
        let config = self.config();
        if config.runtime_ns.is_none() {
            return None;
        }
        let period = config.period_ns;
        let mut timer = self.timer.lock();
        if timer.active {
            return None;
        }
        timer.active = true;
        timer.generation = timer.generation.wrapping_add(1);
        timer.expires = now.saturating_add(period);
        Some((timer.expires, timer.generation))
    }

    /// Remember the handle of the armed timer.
    pub fn set_timer_handle(&self, generation: u64, handle: TimerHandle) {
        let mut timer = self.timer.lock();
        if timer.active && timer.generation == generation {
            timer.handle = Some(handle);
        }
    }

    /// Validate an expiry. Returns the number of elapsed periods, or `None`
    /// for a stale event.
    #[must_use]
    pub fn begin_expiry(&self, generation: u64, now: u64) -> Option<u64> {
        let period = self.config.lock().period_ns.max(1);
        let mut timer = self.timer.lock();
        if !timer.active || timer.generation != generation || now < timer.expires {
            return None;
        }
        let overrun = 1 + (now - timer.expires) / period;
        timer.expires = timer.expires.saturating_add(overrun.saturating_mul(period));
        timer.handle = None;
        Some(overrun)
    }

    /// Finish an expiry. Returns the next `(expires, generation)` to arm, or
    /// `None` once every CPU went idle.
    #[must_use]
    pub fn finish_expiry(&self, idle: bool) -> Option<(u64, u64)> {
        let mut timer = self.timer.lock();
        if idle || !self.is_enabled() {
            timer.active = false;
            return None;
        }
        timer.generation = timer.generation.wrapping_add(1);
        Some((timer.expires, timer.generation))
    }

    /// Drop the pending timer. Returns its handle for cancellation.
    #[must_use]
    pub fn stop_timer(&self) -> Option<TimerHandle> {
        let mut timer = self.timer.lock();
        timer.active = false;
        timer.generation = timer.generation.wrapping_add(1);
        timer.handle.take()
    }

    /// Whether the period timer is running.
    #[must_use]
    pub fn timer_active(&self) -> bool {
        self.timer.lock().active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn limited(runtime_ms: u64, period_ms: u64, cpus: usize) -> RtBandwidth {
        RtBandwidth::new(
            CpuMask::first_n(cpus),
            RtBandwidthConfig {
                runtime_ns: Some(runtime_ms * MS),
                period_ns: period_ms * MS,
            },
        )
    }

    #[test]
    fn test_exceeded_without_siblings() {
        let rt = limited(50, 100, 1);
        rt.account(0, 40 * MS);
        assert_eq!(rt.runtime_exceeded(0), (false, 0));
        rt.account(0, 20 * MS);
        assert_eq!(rt.runtime_exceeded(0), (true, 0));
    }

    #[test]
    fn test_borrow_from_idle_sibling() {
        let rt = limited(50, 100, 2);
        rt.account(0, 60 * MS);
        let (exceeded, borrowed) = rt.runtime_exceeded(0);
        assert!(!exceeded);
        assert_eq!(borrowed, 25 * MS);
        assert_eq!(rt.runtime_of(0).and_then(|s| s.rt_runtime), Some(75 * MS));
        assert_eq!(rt.runtime_of(1).and_then(|s| s.rt_runtime), Some(25 * MS));
    }

    #[test]
    fn test_borrow_is_capped_at_period() {
        let rt = limited(90, 100, 4);
        rt.account(0, 95 * MS);
        let (exceeded, borrowed) = rt.runtime_exceeded(0);
        assert!(!exceeded);
        assert_eq!(borrowed, 10 * MS);
        assert_eq!(rt.runtime_of(0).and_then(|s| s.rt_runtime), Some(100 * MS));
    }

    #[test]
    fn test_period_tick_decays_and_resets_borrowing() {
        let rt = limited(50, 100, 2);
        rt.account(0, 80 * MS);
        assert!(rt.runtime_exceeded(0).0);
        let tick = rt.period_tick(0, 1, true, true);
        assert!(tick.unthrottle);
        assert!(!tick.idle);
        assert_eq!(
            rt.runtime_of(0),
            Some(RtRuntime {
                rt_time: 30 * MS,
                rt_runtime: Some(50 * MS)
            })
        );
        let sibling = rt.period_tick(1, 1, false, false);
        assert!(sibling.idle);
        assert_eq!(rt.runtime_of(1).and_then(|s| s.rt_runtime), Some(50 * MS));
    }

    #[test]
    fn test_unlimited_never_exceeds() {
        let rt = RtBandwidth::new(CpuMask::first_n(1), RtBandwidthConfig::unlimited());
        rt.account(0, u64::MAX);
        assert_eq!(rt.runtime_exceeded(0), (false, 0));
        assert!(rt.start_timer(0).is_none());
    }

    #[test]
    fn test_timer_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
        let rt = limited(50, 100, 1);
        let (expires, generation) = rt.start_timer(10 * MS).ok_or("timer should start")?;
        assert_eq!(expires, 110 * MS);
        assert!(rt.start_timer(20 * MS).is_none());
        assert!(rt.begin_expiry(generation + 1, expires).is_none());
        assert_eq!(rt.begin_expiry(generation, 320 * MS), Some(3));
        let (next, next_gen) = rt.finish_expiry(false).ok_or("timer should re-arm")?;
        assert_eq!(next, 410 * MS);
        assert_ne!(next_gen, generation);
        assert!(rt.finish_expiry(true).is_none());
        assert!(!rt.timer_active());
        Ok(())
    }
}
