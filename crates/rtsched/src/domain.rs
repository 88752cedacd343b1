//! Partitions ("root domains").
//!
//! A partition is a set of CPUs that share a balancing scope, a deadline
//! bandwidth pool and RT group bandwidth. Tasks only migrate inside their
//! partition. All state here is made of leaf locks and atomics: it may be
//! touched while a runqueue lock is held and never takes one itself.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::bandwidth::DlBandwidthPool;
use crate::config::SchedConfig;
use crate::cpudl::CpuDl;
use crate::cpupri::CpuPri;
use crate::error::SchedResult;
use crate::rt::bandwidth::RtBandwidth;
use crate::types::CpuMask;

#[derive(Debug, Default)]
struct RtoCursor {
    cpu: Option<usize>,
    loop_gen: u64,
}

/// One partition of the machine.
#[derive(Debug)]
pub struct RootDomain {
    id: usize,
    span: CpuMask,
    dlo_mask: AtomicU64,
    dlo_count: AtomicUsize,
    rto_mask: AtomicU64,
    rto_count: AtomicUsize,
    pub(crate) dl_bw: Mutex<DlBandwidthPool>,
    pub(crate) cpudl: Mutex<CpuDl>,
    pub(crate) cpupri: Mutex<CpuPri>,
    pub(crate) rt_bw: RtBandwidth,
    rto: Mutex<RtoCursor>,
    rto_loop_start: AtomicBool,
    rto_loop_next: AtomicU64,
}

impl RootDomain {
    /// Build partition `id` spanning `span`.
    #[must_use]
    pub fn new(id: usize, span: CpuMask, config: &SchedConfig) -> Self {
        Self {
            id,
            span,
            dlo_mask: AtomicU64::new(0),
            dlo_count: AtomicUsize::new(0),
            rto_mask: AtomicU64::new(0),
            rto_count: AtomicUsize::new(0),
            dl_bw: Mutex::new(DlBandwidthPool::new(config.dl_bandwidth.ratio())),
            cpudl: Mutex::new(CpuDl::new(span)),
            cpupri: Mutex::new(CpuPri::with_span(span)),
            rt_bw: RtBandwidth::new(span, config.rt_bandwidth),
            rto: Mutex::new(RtoCursor::default()),
            rto_loop_start: AtomicBool::new(false),
            rto_loop_next: AtomicU64::new(0),
        }
    }

    /// Partition index.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// CPUs of the partition.
    #[must_use]
    pub const fn span(&self) -> CpuMask {
        self.span
    }

    /// Number of CPUs in the partition.
    #[must_use]
    pub const fn weight(&self) -> usize {
        self.span.weight()
    }

    /// CPUs with pushable deadline tasks.
    #[must_use]
    pub fn dlo_mask(&self) -> CpuMask {
        CpuMask::from_bits(self.dlo_mask.load(Ordering::Acquire))
    }

    /// Number of CPUs with pushable deadline tasks.
    #[must_use]
    pub fn dlo_count(&self) -> usize {
        self.dlo_count.load(Ordering::Acquire)
    }

    /// CPUs with pushable fixed-priority tasks.
    #[must_use]
    pub fn rto_mask(&self) -> CpuMask {
        CpuMask::from_bits(self.rto_mask.load(Ordering::Acquire))
    }

    /// Number of CPUs with pushable fixed-priority tasks.
    #[must_use]
    pub fn rto_count(&self) -> usize {
        self.rto_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_dl_overload(&self, cpu: usize, overloaded: bool) {
        update_overload(&self.dlo_mask, &self.dlo_count, cpu, overloaded);
    }

    pub(crate) fn set_rt_overload(&self, cpu: usize, overloaded: bool) {
        update_overload(&self.rto_mask, &self.rto_count, cpu, overloaded);
    }

    /// Admit a reservation of `bw` in this partition.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::AdmissionRejected`](crate::SchedError::AdmissionRejected)
    /// when the pool is full.
    pub fn dl_reserve(&self, bw: u64) -> SchedResult<()> {
        self.dl_bw.lock().reserve(self.weight(), bw)
    }

    /// Swap an admitted reservation for a new one.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::AdmissionRejected`](crate::SchedError::AdmissionRejected)
    /// when the new total does not fit.
    pub fn dl_update(&self, old_bw: u64, new_bw: u64) -> SchedResult<()> {
        self.dl_bw.lock().update(self.weight(), old_bw, new_bw)
    }

    /// Return a reservation. `false` means the pool underflowed and was clamped.
    #[must_use]
    pub fn dl_release(&self, bw: u64) -> bool {
        self.dl_bw.lock().release(bw)
    }

    /// Bandwidth admitted in this partition.
    #[must_use]
    pub fn dl_total_bw(&self) -> u64 {
        self.dl_bw.lock().total_bw()
    }

    /// Ask one overloaded CPU to start an RT push sweep.
    ///
    /// Returns the CPU that should receive the push IPI, or `None` if a sweep
    /// is already running (it will make another pass) or nothing is overloaded.
    pub(crate) fn tell_cpu_to_push(&self) -> Option<usize> {
        self.rto_loop_next.fetch_add(1, Ordering::Release);
        if self
            .rto_loop_start
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        let cpu = {
            let mut rto = self.rto.lock();
            if rto.cpu.is_none() {
                rto.loop_gen = self.rto_loop_next.load(Ordering::Acquire);
                self.rto_next_cpu(&mut rto)
            } else {
                None
            }
        };
        self.rto_loop_start.store(false, Ordering::Release);
        cpu
    }

    /// Advance the sweep after a CPU handled its push IPI.
    pub(crate) fn rto_push_next(&self) -> Option<usize> {
        let mut rto = self.rto.lock();
        self.rto_next_cpu(&mut rto)
    }

    fn rto_next_cpu(&self, rto: &mut RtoCursor) -> Option<usize> {
        loop {
            rto.cpu = self.rto_mask().next_after(rto.cpu);
            if rto.cpu.is_some() {
                return rto.cpu;
            }
            let next = self.rto_loop_next.load(Ordering::Acquire);
            if rto.loop_gen == next {
                return None;
            }
            rto.loop_gen = next;
        }
    }
}

fn update_overload(mask: &AtomicU64, count: &AtomicUsize, cpu: usize, overloaded: bool) {
    let bit = CpuMask::single(cpu).bits();
    if overloaded {
        if mask.fetch_or(bit, Ordering::AcqRel) & bit == 0 {
            count.fetch_add(1, Ordering::AcqRel);
        }
    } else if mask.fetch_and(!bit, Ordering::AcqRel) & bit != 0 {
        count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(cpus: usize) -> RootDomain {
        let config = SchedConfig {
            nr_cpus: cpus,
            ..SchedConfig::default()
        };
        RootDomain::new(0, CpuMask::first_n(cpus), &config)
    }

    #[test]
    fn test_overload_mask_and_count() {
        let rd = domain(4);
        rd.set_rt_overload(1, true);
        rd.set_rt_overload(1, true);
        rd.set_rt_overload(3, true);
        assert_eq!(rd.rto_count(), 2);
        assert_eq!(rd.rto_mask(), CpuMask::from_bits(0b1010));
        rd.set_rt_overload(1, false);
        rd.set_rt_overload(2, false);
        assert_eq!(rd.rto_count(), 1);
        rd.set_dl_overload(0, true);
        assert_eq!(rd.dlo_mask(), CpuMask::single(0));
        assert_eq!(rd.dlo_count(), 1);
    }

    #[test]
    fn test_request_during_sweep_adds_a_pass() {
        let rd = domain(4);
        rd.set_rt_overload(1, true);
        rd.set_rt_overload(2, true);

        assert_eq!(rd.tell_cpu_to_push(), Some(1));
        // A request while the sweep runs only bumps the generation.
        assert_eq!(rd.tell_cpu_to_push(), None);
        assert_eq!(rd.rto_push_next(), Some(2));
        // Second pass because of the extra request.
        assert_eq!(rd.rto_push_next(), Some(1));
        assert_eq!(rd.rto_push_next(), Some(2));
        assert_eq!(rd.rto_push_next(), None);
        assert_eq!(rd.tell_cpu_to_push(), Some(1));
    }

    #[test]
    fn test_single_request_makes_one_pass() {
        let rd = domain(3);
        rd.set_rt_overload(0, true);
        rd.set_rt_overload(2, true);
        assert_eq!(rd.tell_cpu_to_push(), Some(0));
        assert_eq!(rd.rto_push_next(), Some(2));
        assert_eq!(rd.rto_push_next(), None);
    }

    #[test]
    fn test_sweep_with_nothing_overloaded() {
        let rd = domain(2);
        assert_eq!(rd.tell_cpu_to_push(), None);
        assert_eq!(rd.rto_push_next(), None);
    }

    #[test]
    fn test_dl_pool_uses_partition_weight() {
        let rd = domain(2);
        let bw = crate::bandwidth::BW_UNIT * 9 / 10;
        assert!(rd.dl_reserve(bw).is_ok());
        assert!(rd.dl_reserve(bw).is_ok());
        assert!(rd.dl_reserve(bw).is_err());
        assert!(rd.dl_release(bw));
        assert_eq!(rd.dl_total_bw(), bw);
    }
}
