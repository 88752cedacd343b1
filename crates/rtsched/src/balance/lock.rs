//! Two-runqueue locking for migrations.
//!
//! Both locks are taken in ascending CPU order and only with `try_lock`, so
//! a balancer never sleeps on a runqueue while holding another one. Between
//! attempts nothing is held.

use crossbeam::utils::Backoff;
use parking_lot::{Mutex, MutexGuard};

use crate::rq::Runqueue;

/// Two runqueues locked together.
pub(crate) struct RqPair<'a> {
    low: MutexGuard<'a, Runqueue>,
    high: MutexGuard<'a, Runqueue>,
}

impl<'a> RqPair<'a> {
    /// Lock the runqueues of `a` and `b`, making at most `retries` attempts.
    ///
    /// Returns `None` when `a == b`, a CPU is out of range, or the locks
    /// stayed contended.
    pub(crate) fn try_lock(rqs: &'a [Mutex<Runqueue>], a: usize, b: usize, retries: u32) -> Option<Self> {
        if a == b {
            return None;
        }
        let (low_rq, high_rq) = (rqs.get(a.min(b))?, rqs.get(a.max(b))?);
        let backoff = Backoff::new();
        for _ in 0..retries {
            if let Some(low) = low_rq.try_lock() {
                if let Some(high) = high_rq.try_lock() {
                    return Some(Self { low, high });
                }
                drop(low);
            }
            backoff.snooze();
        }
        None
    }

    /// Split into `(runqueue of cpu, the other runqueue)`.
    pub(crate) fn split(&mut self, cpu: usize) -> (&mut Runqueue, &mut Runqueue) {
        if self.low.cpu == cpu {
            (&mut *self.low, &mut *self.high)
        } else {
            (&mut *self.high, &mut *self.low)
        }
    }
}

impl std::fmt::Debug for RqPair<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RqPair")
            .field("low", &self.low.cpu)
            .field("high", &self.high.cpu)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fair::FifoFairQueue;

    fn rqs(n: usize) -> Vec<Mutex<Runqueue>> {
        (0..n)
            .map(|cpu| Mutex::new(Runqueue::new(cpu, Box::new(FifoFairQueue::default()))))
            .collect()
    }

    #[test]
    fn test_split_orients_by_cpu() -> Result<(), Box<dyn std::error::Error>> {
        let rqs = rqs(3);
        let mut pair = RqPair::try_lock(&rqs, 2, 0, 4).ok_or("pair not locked")?;
        let (src, dst) = pair.split(2);
        assert_eq!((src.cpu, dst.cpu), (2, 0));
        let (src, dst) = pair.split(0);
        assert_eq!((src.cpu, dst.cpu), (0, 2));
        Ok(())
    }

    #[test]
    fn test_contended_lock_gives_up() {
        let rqs = rqs(2);
        let _held = rqs[1].lock();
        assert!(RqPair::try_lock(&rqs, 0, 1, 3).is_none());
        assert!(rqs[0].try_lock().is_some());
    }

    #[test]
    fn test_same_cpu_is_rejected() {
        let rqs = rqs(2);
        assert!(RqPair::try_lock(&rqs, 1, 1, 3).is_none());
        assert!(RqPair::try_lock(&rqs, 1, 5, 3).is_none());
    }
}
