//! Partition-wide index of each CPU's earliest deadline.
//!
//! CPUs with deadline work live in a max-heap keyed by their earliest
//! deadline, so the CPU whose work is *latest* is at the root. CPUs without
//! deadline work are kept in a separate free mask.

use crate::types::{CpuMask, MAX_CPUS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapItem {
    dl: u64,
    cpu: usize,
}

/// Earliest-deadline index for one partition.
#[derive(Debug, Clone)]
pub struct CpuDl {
    heap: Vec<HeapItem>,
    index: [Option<usize>; MAX_CPUS],
    free_cpus: CpuMask,
}

impl CpuDl {
    /// Index with every CPU of `span` free.
    #[must_use]
    pub fn new(span: CpuMask) -> Self {
        Self {
            heap: Vec::with_capacity(span.weight()),
            index: [None; MAX_CPUS],
            free_cpus: span,
        }
    }

    /// CPUs without deadline work.
    #[must_use]
    pub const fn free_cpus(&self) -> CpuMask {
        self.free_cpus
    }

    /// CPU with the latest earliest-deadline, and that deadline.
    #[must_use]
    pub fn maximum(&self) -> Option<(usize, u64)> {
        self.heap.first().map(|item| (item.cpu, item.dl))
    }

    /// Earliest deadline recorded for `cpu`.
    #[must_use]
    pub fn deadline_of(&self, cpu: usize) -> Option<u64> {
        let idx = self.index.get(cpu).copied().flatten()?;
        self.heap.get(idx).map(|item| item.dl)
    }

    /// Record `dl` as the earliest deadline on `cpu`.
    pub fn set(&mut self, cpu: usize, dl: u64) {
        if cpu >= MAX_CPUS {
            return;
        }
        match self.index[cpu] {
            Some(idx) => {
                let old = self.heap[idx].dl;
                self.heap[idx].dl = dl;
                if dl > old {
                    self.sift_up(idx);
                } else {
                    self.sift_down(idx);
                }
            }
            None => {
                let idx = self.heap.len();
                self.heap.push(HeapItem { dl, cpu });
                self.index[cpu] = Some(idx);
                self.sift_up(idx);
            }
        }
        self.free_cpus.remove(cpu);
    }

    /// `cpu` no longer has deadline work.
    pub fn clear(&mut self, cpu: usize) {
        if cpu >= MAX_CPUS {
            return;
        }
        if let Some(idx) = self.index[cpu].take() {
            let last = self.heap.len() - 1;
            self.heap.swap(idx, last);
            self.heap.pop();
            if idx < self.heap.len() {
                let moved = self.heap[idx].cpu;
                self.index[moved] = Some(idx);
                self.sift_down(idx);
                self.sift_up(idx);
            }
        }
        self.free_cpus.insert(cpu);
    }

    /// CPUs in `allowed` where a task with absolute deadline `dl` would run
    /// earliest: any free CPU, else the heap root if `dl` beats its deadline.
    #[must_use]
    pub fn find(&self, dl: u64, allowed: CpuMask) -> Option<CpuMask> {
        let free = self.free_cpus & allowed;
        if !free.is_empty() {
            return Some(free);
        }
        let (cpu, max_dl) = self.maximum()?;
        (allowed.contains(cpu) && dl < max_dl).then(|| CpuMask::single(cpu))
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[parent].dl >= self.heap[idx].dl {
                break;
            }
            self.swap_nodes(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut largest = idx;
            if left < self.heap.len() && self.heap[left].dl > self.heap[largest].dl {
                largest = left;
            }
            if right < self.heap.len() && self.heap[right].dl > self.heap[largest].dl {
                largest = right;
            }
            if largest == idx {
                break;
            }
            self.swap_nodes(idx, largest);
            idx = largest;
        }
    }

    fn swap_nodes(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        let (cpu_a, cpu_b) = (self.heap[a].cpu, self.heap[b].cpu);
        self.index[cpu_a] = Some(a);
        self.index[cpu_b] = Some(b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_cpus_win() {
        let mut cpudl = CpuDl::new(CpuMask::first_n(3));
        cpudl.set(0, 100);
        assert_eq!(cpudl.find(500, CpuMask::first_n(3)), Some(CpuMask::from_bits(0b110)));
        assert_eq!(cpudl.free_cpus(), CpuMask::from_bits(0b110));
    }

    #[test]
    fn test_maximum_tracks_latest_deadline() {
        let mut cpudl = CpuDl::new(CpuMask::first_n(4));
        cpudl.set(0, 300);
        cpudl.set(1, 100);
        cpudl.set(2, 500);
        cpudl.set(3, 200);
        assert_eq!(cpudl.maximum(), Some((2, 500)));

        cpudl.set(2, 50);
        assert_eq!(cpudl.maximum(), Some((0, 300)));

        cpudl.clear(0);
        assert_eq!(cpudl.maximum(), Some((3, 200)));
        assert_eq!(cpudl.deadline_of(1), Some(100));
        assert_eq!(cpudl.deadline_of(0), None);
    }

    #[test]
    fn test_find_requires_earlier_deadline() {
        let mut cpudl = CpuDl::new(CpuMask::first_n(2));
        cpudl.set(0, 100);
        cpudl.set(1, 400);
        assert_eq!(cpudl.find(200, CpuMask::first_n(2)), Some(CpuMask::single(1)));
        assert_eq!(cpudl.find(500, CpuMask::first_n(2)), None);
        assert_eq!(cpudl.find(200, CpuMask::single(0)), None);
    }

    #[test]
    fn test_heap_survives_churn() {
        let mut cpudl = CpuDl::new(CpuMask::first_n(8));
        for round in 0..50u64 {
            for cpu in 0..8usize {
                let dl = (round * 7 + cpu as u64 * 13) % 97;
                if (round + cpu as u64) % 3 == 0 {
                    cpudl.clear(cpu);
                } else {
                    cpudl.set(cpu, dl);
                }
            }
            let expected = (0..8).filter_map(|cpu| cpudl.deadline_of(cpu)).max();
            assert_eq!(cpudl.maximum().map(|(_, dl)| dl), expected);
        }
    }
}
