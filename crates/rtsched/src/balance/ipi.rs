//! Inter-processor messages.
//!
//! Each CPU has an unbounded mailbox. Senders never block; the embedder
//! delivers messages by calling [`Scheduler::process_ipis`](crate::Scheduler::process_ipis)
//! on the target CPU.

use crossbeam::channel::{Receiver, Sender, unbounded};

/// Message sent to a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ipi {
    /// Push pushable RT tasks, then forward the sweep to the next overloaded CPU.
    PushRt {
        /// Partition the sweep belongs to.
        partition: usize,
    },
}

#[derive(Debug)]
pub(crate) struct IpiMailboxes {
    senders: Vec<Sender<Ipi>>,
    receivers: Vec<Receiver<Ipi>>,
}

impl IpiMailboxes {
    pub(crate) fn new(nr_cpus: usize) -> Self {
        let (senders, receivers) = (0..nr_cpus).map(|_| unbounded()).unzip();
        Self { senders, receivers }
    }

    /// Queue `ipi` for `cpu`. Returns `false` for an unknown CPU.
    pub(crate) fn send(&self, cpu: usize, ipi: Ipi) -> bool {
        self.senders
            .get(cpu)
            .is_some_and(|sender| sender.send(ipi).is_ok())
    }

    pub(crate) fn try_recv(&self, cpu: usize) -> Option<Ipi> {
        self.receivers.get(cpu)?.try_recv().ok()
    }

    pub(crate) fn pending(&self, cpu: usize) -> usize {
        self.receivers.get(cpu).map_or(0, Receiver::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailboxes_are_per_cpu() {
        let boxes = IpiMailboxes::new(2);
        assert!(boxes.send(1, Ipi::PushRt { partition: 0 }));
        assert!(!boxes.send(2, Ipi::PushRt { partition: 0 }));
        assert_eq!(boxes.pending(0), 0);
        assert_eq!(boxes.pending(1), 1);
        assert_eq!(boxes.try_recv(0), None);
        assert_eq!(boxes.try_recv(1), Some(Ipi::PushRt { partition: 0 }));
        assert_eq!(boxes.try_recv(1), None);
    }
}
