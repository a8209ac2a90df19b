//! Static governors shipped with the core.

use alloc::collections::BTreeMap;

use spin::Mutex;

use super::{Governor, GovernorEvent};
use crate::cpufreq::CpuFreq;
use crate::driver::Relation;
use crate::error::CpuFreqResult;
use crate::policy::{Policy, PolicyId};

/// Keeps the domain at its highest allowed frequency
#[derive(Debug, Default)]
pub struct Performance;

impl Governor for Performance {
    fn name(&self) -> &str {
        "performance"
    }

    fn handle(&self, cpufreq: &CpuFreq, policy: &Policy, event: GovernorEvent) -> CpuFreqResult<()> {
        match event {
            GovernorEvent::Start | GovernorEvent::Limits => {
                let max = policy.effective().max;
                log::debug!("cpufreq: setting to {} kHz because of event {:?}", max, event);
                cpufreq.target_locked(policy, max, Relation::High)
            }
            GovernorEvent::Stop => Ok(()),
        }
    }
}

/// Keeps the domain at its lowest allowed frequency
#[derive(Debug, Default)]
pub struct Powersave;

impl Governor for Powersave {
    fn name(&self) -> &str {
        "powersave"
    }

    fn handle(&self, cpufreq: &CpuFreq, policy: &Policy, event: GovernorEvent) -> CpuFreqResult<()> {
        match event {
            GovernorEvent::Start | GovernorEvent::Limits => {
                let min = policy.effective().min;
                log::debug!("cpufreq: setting to {} kHz because of event {:?}", min, event);
                cpufreq.target_locked(policy, min, Relation::Low)
            }
            GovernorEvent::Stop => Ok(()),
        }
    }
}

/// Runs the domain at a speed chosen through `scaling_setspeed`
#[derive(Debug, Default)]
pub struct Userspace {
    setspeed: Mutex<BTreeMap<PolicyId, u32>>,
}

impl Userspace {
    /// Create the governor
    pub const fn new() -> Self {
        Self {
            setspeed: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Governor for Userspace {
    fn name(&self) -> &str {
        "userspace"
    }

    fn handle(&self, cpufreq: &CpuFreq, policy: &Policy, event: GovernorEvent) -> CpuFreqResult<()> {
        match event {
            GovernorEvent::Start => {
                self.setspeed.lock().insert(policy.id(), policy.cur());
                Ok(())
            }
            GovernorEvent::Stop => {
                self.setspeed.lock().remove(&policy.id());
                Ok(())
            }
            GovernorEvent::Limits => {
                let limits = policy.effective();
                let speed = self.setspeed.lock().get(&policy.id()).copied();
                match speed {
                    Some(speed) if speed > limits.max => {
                        cpufreq.target_locked(policy, limits.max, Relation::High)
                    }
                    Some(speed) if speed < limits.min => {
                        cpufreq.target_locked(policy, limits.min, Relation::Low)
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    fn store_setspeed(&self, cpufreq: &CpuFreq, policy: &Policy, freq: u32) -> CpuFreqResult<()> {
        log::debug!("cpufreq: userspace setspeed for CPU {} to {} kHz", policy.owning_cpu(), freq);
        let freq = policy.effective().clamp(freq);
        self.setspeed.lock().insert(policy.id(), freq);
        cpufreq.target_locked(policy, freq, Relation::Low)
    }

    fn show_setspeed(&self, policy: &Policy) -> Option<u32> {
        self.setspeed.lock().get(&policy.id()).copied()
    }
}
