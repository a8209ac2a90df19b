//! Deferred policy re-evaluation.
//!
//! Paths that must not sleep queue a CPU here; the kernel's worker drains
//! the queue with [`CpuFreq::run_pending_updates`].

use spin::Mutex;

use crate::cpufreq::CpuFreq;
use crate::cpumask::CpuMask;

/// De-duplicating set of CPUs awaiting re-evaluation
#[derive(Debug, Default)]
pub struct UpdateQueue {
    pending: Mutex<CpuMask>,
}

impl UpdateQueue {
    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(CpuMask::empty()),
        }
    }

    /// Queue `cpu`
    pub fn schedule(&self, cpu: usize) {
        self.pending.lock().set(cpu);
    }

    /// CPUs waiting
    pub fn pending(&self) -> CpuMask {
        *self.pending.lock()
    }

    fn take(&self) -> CpuMask {
        core::mem::take(&mut *self.pending.lock())
    }
}

impl CpuFreq {
    /// Re-evaluate every queued policy; returns how many ran
    ///
    /// Must be called from a context that may sleep.
    pub fn run_pending_updates(&self) -> usize {
        let pending = self.updates().take();
        for cpu in pending {
            log::debug!("cpufreq: handle_update for cpu {} called", cpu);
            if let Err(err) = self.update_policy(cpu) {
                log::debug!("cpufreq: deferred update of CPU {} failed: {}", cpu, err);
            }
        }
        pending.weight() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_dedups() {
        let queue = UpdateQueue::new();
        queue.schedule(3);
        queue.schedule(3);
        queue.schedule(1);
        assert_eq!(queue.pending(), CpuMask::from_cpus(&[1, 3]));
        assert_eq!(queue.take().weight(), 2);
        assert!(queue.pending().is_empty());
    }
}
