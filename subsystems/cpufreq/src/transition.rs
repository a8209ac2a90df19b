//! # Frequency Transitions
//!
//! Two-phase notification around every frequency change:
//!
//! ```text
//!  driver ──▶ PreChange ──▶ program hardware ──▶ PostChange
//!               │                                  │
//!               ├─ correct `old` to the            ├─ recalibrate loops
//!               │  policy's belief                 ├─ broadcast
//!               └─ broadcast                       └─ policy.cur = new
//! ```
//!
//! Both phases run in contexts that must not sleep. A direct frequency read
//! that disagrees with the policy runs both phases back to back and queues a
//! full policy re-evaluation.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::attr::Attribute;
use crate::cpufreq::CpuFreq;

/// Phase of a frequency transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPhase {
    /// Before the hardware changes
    PreChange,
    /// After the hardware changed
    PostChange,
}

/// A frequency change on one CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreqTransition {
    /// CPU whose frequency changes
    pub cpu: usize,
    /// Frequency before, in kHz
    pub old: u32,
    /// Frequency after, in kHz
    pub new: u32,
    /// Driver-specific flags
    pub flags: u32,
}

impl FreqTransition {
    /// Describe a change
    pub const fn new(cpu: usize, old: u32, new: u32) -> Self {
        Self {
            cpu,
            old,
            new,
            flags: 0,
        }
    }
}

/// `old * mult / div` without intermediate overflow
pub fn cpufreq_scale(old: u64, div: u32, mult: u32) -> u64 {
    if div == 0 {
        return old;
    }
    let scaled = (old as u128) * (mult as u128) / (div as u128);
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

// =============================================================================
// Loop Calibration
// =============================================================================

/// Uniprocessor delay-loop calibration that follows the clock
#[derive(Debug)]
pub struct LoopCalibration {
    enabled: bool,
    current: AtomicU64,
    reference: AtomicU64,
    ref_freq: AtomicU32,
}

impl LoopCalibration {
    /// Calibration starting at `loops_per_jiffy`; `None` disables it
    pub const fn new(loops_per_jiffy: Option<u64>) -> Self {
        let (enabled, loops) = match loops_per_jiffy {
            Some(loops) => (true, loops),
            None => (false, 0),
        };
        Self {
            enabled,
            current: AtomicU64::new(loops),
            reference: AtomicU64::new(0),
            ref_freq: AtomicU32::new(0),
        }
    }

    /// Current value, when calibration is enabled
    pub fn loops_per_jiffy(&self) -> Option<u64> {
        self.enabled.then(|| self.current.load(Ordering::Acquire))
    }

    pub(crate) fn adjust(&self, phase: TransitionPhase, freqs: &FreqTransition, const_loops: bool) {
        if !self.enabled || const_loops {
            return;
        }
        if self.ref_freq.load(Ordering::Acquire) == 0 {
            self.reference
                .store(self.current.load(Ordering::Acquire), Ordering::Release);
            self.ref_freq.store(freqs.old, Ordering::Release);
            log::debug!(
                "cpufreq: saving {} as reference value for loops_per_jiffy, freq is {} kHz",
                self.reference.load(Ordering::Relaxed),
                freqs.old
            );
        }
        if phase == TransitionPhase::PostChange && freqs.old != freqs.new {
            let loops = cpufreq_scale(
                self.reference.load(Ordering::Acquire),
                self.ref_freq.load(Ordering::Acquire),
                freqs.new,
            );
            self.current.store(loops, Ordering::Release);
            log::debug!(
                "cpufreq: scaling loops_per_jiffy to {} for frequency {} kHz",
                loops,
                freqs.new
            );
        }
    }
}

// =============================================================================
// Notification
// =============================================================================

impl CpuFreq {
    /// Announce one phase of a frequency change
    ///
    /// Called by drivers around every change they make, including from
    /// [`CpuFreqDriver::target`](crate::CpuFreqDriver::target). Must not
    /// sleep. On PreChange `freqs.old` may be corrected to what the core
    /// believed the frequency was.
    pub fn notify_transition(&self, freqs: &mut FreqTransition, phase: TransitionPhase) {
        log::debug!(
            "cpufreq: notification {:?} of frequency transition to {} kHz",
            phase,
            freqs.new
        );
        let const_loops = self.registry().driver().is_some_and(|d| d.const_loops());
        let policy = self.registry().peek(freqs.cpu);

        match phase {
            TransitionPhase::PreChange => {
                if let Some(policy) = &policy {
                    let (owner, cur) = {
                        let data = policy.snapshot();
                        (data.cpu, data.cur)
                    };
                    if !const_loops && owner == freqs.cpu && cur != 0 && cur != freqs.old {
                        log::debug!(
                            "cpufreq: Warning: CPU frequency is {}, cpufreq assumed {} kHz",
                            freqs.old,
                            cur
                        );
                        freqs.old = cur;
                    }
                }
                self.transition_notifier().notify(phase, freqs);
                self.loops().adjust(phase, freqs, const_loops);
            }
            TransitionPhase::PostChange => {
                self.loops().adjust(phase, freqs, const_loops);
                log::debug!("cpufreq: FREQ: {} - CPU: {}", freqs.new, freqs.cpu);
                self.transition_notifier().notify(phase, freqs);
                if let Some(policy) = &policy {
                    if policy.owning_cpu() == freqs.cpu {
                        policy.update(|d| d.cur = freqs.new);
                        self.attribute_changed(freqs.cpu, Attribute::ScalingCurFreq);
                    }
                }
            }
        }
    }

    /// Repair a disagreement between the policy and the hardware
    pub(crate) fn out_of_sync(&self, cpu: usize, old: u32, new: u32) {
        log::warn!(
            "cpufreq: Warning: CPU frequency out of sync: cpufreq and timing core thinks of {}, is {} kHz",
            old,
            new
        );
        let mut freqs = FreqTransition::new(cpu, old, new);
        self.notify_transition(&mut freqs, TransitionPhase::PreChange);
        self.notify_transition(&mut freqs, TransitionPhase::PostChange);
        self.updates().schedule(cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    use crate::testing::{cpufreq, cpufreq_with, FakeDriver, RecordingTransitions};
    use crate::{CpuFreqConfig, NotifierPriority};

    #[test]
    fn test_scale() {
        assert_eq!(cpufreq_scale(4_000_000, 1_000_000, 500_000), 2_000_000);
        assert_eq!(cpufreq_scale(7, 0, 3), 7);
    }

    #[test]
    fn test_prechange_corrects_old() {
        let cpufreq = cpufreq(&[0]);
        let rec = Arc::new(RecordingTransitions::new());
        cpufreq.register_transition_notifier(rec.clone(), NotifierPriority::NORMAL);
        cpufreq.register_driver(Arc::new(FakeDriver::new())).unwrap();
        assert_eq!(cpufreq.quick_get(0), 2_000_000);
        rec.clear();

        let mut freqs = FreqTransition::new(0, 900_000, 1_100_000);
        cpufreq.notify_transition(&mut freqs, TransitionPhase::PreChange);
        assert_eq!(freqs.old, 2_000_000);
        cpufreq.notify_transition(&mut freqs, TransitionPhase::PostChange);
        assert_eq!(cpufreq.quick_get(0), 1_100_000);
        assert_eq!(rec.events().len(), 2);
    }

    #[test]
    fn test_postchange_on_sibling_keeps_cur() {
        let cpufreq = cpufreq(&[0, 1]);
        let driver = FakeDriver::new().with_domain(&[0, 1]);
        cpufreq.register_driver(Arc::new(driver)).unwrap();

        let mut freqs = FreqTransition::new(1, 2_000_000, 800_000);
        cpufreq.notify_transition(&mut freqs, TransitionPhase::PreChange);
        cpufreq.notify_transition(&mut freqs, TransitionPhase::PostChange);
        assert_eq!(cpufreq.quick_get(1), 2_000_000);
    }

    #[test]
    fn test_desync_emits_one_pair() {
        let cpufreq = cpufreq(&[0]);
        let driver = Arc::new(FakeDriver::new().with_get());
        cpufreq.register_driver(driver.clone()).unwrap();
        cpufreq.set_gov("userspace", 0).unwrap();
        cpufreq.store(0, crate::Attribute::ScalingSetspeed, "1000000").unwrap();
        assert_eq!(cpufreq.quick_get(0), 1_000_000);

        let rec = Arc::new(RecordingTransitions::new());
        cpufreq.register_transition_notifier(rec.clone(), NotifierPriority::NORMAL);
        driver.set_hw_freq(0, 1_200_000);

        assert_eq!(cpufreq.get(0), 1_200_000);
        assert_eq!(cpufreq.quick_get(0), 1_200_000);
        let events = rec.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, TransitionPhase::PreChange);
        assert_eq!(events[1].0, TransitionPhase::PostChange);
        for (_, freqs) in events {
            assert_eq!((freqs.old, freqs.new), (1_000_000, 1_200_000));
        }

        // the queued re-evaluation finds nothing left to repair
        assert_eq!(cpufreq.run_pending_updates(), 1);
        assert_eq!(rec.events().len(), 2);
    }

    #[test]
    fn test_loops_per_jiffy_follows_clock() {
        let config = CpuFreqConfig::new().with_loops_per_jiffy(4_000_000);
        let cpufreq = cpufreq_with(config, &[0]);
        cpufreq.register_driver(Arc::new(FakeDriver::new())).unwrap();
        // START of performance: 2_000_000 (init) is already the max, no change
        assert_eq!(cpufreq.loops().loops_per_jiffy(), Some(4_000_000));

        cpufreq.set_gov("powersave", 0).unwrap();
        // 2_000_000 -> 300_000 kHz
        assert_eq!(cpufreq.loops().loops_per_jiffy(), Some(600_000));
    }

    #[test]
    fn test_const_loops_skip_calibration() {
        let calibration = LoopCalibration::new(Some(1_000));
        let freqs = FreqTransition::new(0, 100, 200);
        calibration.adjust(TransitionPhase::PostChange, &freqs, true);
        assert_eq!(calibration.loops_per_jiffy(), Some(1_000));
        calibration.adjust(TransitionPhase::PostChange, &freqs, false);
        assert_eq!(calibration.loops_per_jiffy(), Some(2_000));
    }
}
