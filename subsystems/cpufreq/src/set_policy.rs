//! # Policy-Set Protocol
//!
//! Validates a candidate against QoS and the user's request, lets the
//! driver and policy observers shape it, then commits it and drives the
//! governor.
//!
//! ```text
//!  candidate ─▶ QoS clamp ─▶ conflict? ─▶ verify ─▶ ADJUST ─▶ INCOMPATIBLE
//!                                                                  │
//!      governor STOP/START/LIMITS ◀── commit ◀── NOTIFY ◀── verify ◀┘
//!      (or driver.setpolicy)
//! ```
//!
//! The caller holds the domain writer lock for the whole protocol.

use alloc::string::String;

use crate::attr::Attribute;
use crate::cpufreq::CpuFreq;
use crate::driver::{DriverHandle, ScalingMode};
use crate::error::{CpuFreqError, CpuFreqResult};
use crate::governor::{GovernorEvent, GovernorHandle};
use crate::notifier::PolicyEvent;
use crate::policy::{Policy, PolicyCandidate, ScalingPolicy};
use crate::qos::QosClass;

/// Bounds and governor requested by a policy client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRequest {
    /// Requested minimum in kHz
    pub min: u32,
    /// Requested maximum in kHz
    pub max: u32,
    /// Governor or driver policy name; `None` keeps the current one
    pub governor: Option<String>,
}

impl PolicyRequest {
    /// Request a range, keeping the governor
    pub const fn new(min: u32, max: u32) -> Self {
        Self {
            min,
            max,
            governor: None,
        }
    }

    /// Also switch the governor
    pub fn with_governor(mut self, name: &str) -> Self {
        self.governor = Some(String::from(name));
        self
    }
}

impl CpuFreq {
    /// Apply `candidate` to `policy`; the caller holds the writer lock
    ///
    /// On return the visible bounds are the ones the candidate carried in,
    /// while the enforced bounds are the clamped result.
    pub(crate) fn set_policy_locked(
        &self,
        driver: &DriverHandle,
        policy: &Policy,
        mut candidate: PolicyCandidate,
    ) -> CpuFreqResult<()> {
        let requested = candidate.bounds();
        let (user, cpuinfo) = {
            let data = policy.snapshot();
            (data.user.bounds(), data.cpuinfo)
        };
        let qmin = self.qos().target(QosClass::CpuFreqMin).min(user.max);
        let qmax = self.qos().target(QosClass::CpuFreqMax).max(user.min);

        log::debug!(
            "cpufreq: setting new policy for CPU {}: {} - {} ({} - {}) kHz",
            candidate.cpu,
            requested.min,
            requested.max,
            qmin,
            qmax
        );

        candidate.min = requested.min.max(qmin);
        candidate.max = requested.max.min(qmax);
        candidate.cpuinfo = cpuinfo;

        if candidate.min > user.max || candidate.max < user.min {
            return Err(CpuFreqError::BoundsConflict);
        }

        driver.verify(&mut candidate)?;
        self.policy_notifier().notify(PolicyEvent::Adjust, &mut candidate);
        self.policy_notifier().notify(PolicyEvent::Incompatible, &mut candidate);
        driver.verify(&mut candidate)?;
        candidate.verify_within_cpu_limits();

        // observers of the final policy may only look
        let mut announced = candidate.clone();
        self.policy_notifier().notify(PolicyEvent::Notify, &mut announced);

        let effective = candidate.bounds();
        policy.update(|d| {
            d.effective = effective;
            d.min = requested.min;
            d.max = requested.max;
        });
        log::debug!(
            "cpufreq: new min and max freqs are {} - {} kHz",
            effective.min,
            effective.max
        );

        if driver.mode() == ScalingMode::SetPolicy {
            policy.update(|d| d.policy = candidate.policy);
            log::debug!("cpufreq: setting range");
            driver.setpolicy(&candidate)?;
            return Ok(());
        }

        if candidate.governor != policy.governor() {
            self.switch_governor(policy, candidate.governor)?;
        }
        log::debug!("cpufreq: governor: change or update limits");
        if let Err(err) = self.governor_event(policy, GovernorEvent::Limits) {
            log::warn!("cpufreq: governor LIMITS on CPU {} failed: {}", candidate.cpu, err);
        }
        Ok(())
    }

    /// Stop the running governor and start `new`, restoring the old one on failure
    fn switch_governor(&self, policy: &Policy, new: Option<GovernorHandle>) -> CpuFreqResult<()> {
        log::debug!("cpufreq: governor switch");
        let old = policy.governor();
        if old.is_some() {
            if let Err(err) = self.governor_event(policy, GovernorEvent::Stop) {
                log::warn!("cpufreq: stopping governor of CPU {} failed: {}", policy.owning_cpu(), err);
            }
        }

        policy.update(|d| d.governor = new);
        let Err(err) = self.governor_event(policy, GovernorEvent::Start) else {
            return Ok(());
        };
        log::debug!(
            "cpufreq: starting governor {} failed: {}",
            policy.governor().as_ref().map_or("none", |g| g.name()),
            err
        );

        if let Some(old) = old {
            let name = String::from(old.name());
            policy.update(|d| d.governor = Some(old));
            if let Err(restore) = self.governor_event(policy, GovernorEvent::Start) {
                log::error!(
                    "cpufreq: restarting governor {} on CPU {} failed: {}",
                    name,
                    policy.owning_cpu(),
                    restore
                );
                return Err(restore);
            }
        }
        Err(err)
    }

    /// Re-evaluate the policy of `cpu` from its user request
    pub fn update_policy(&self, cpu: usize) -> CpuFreqResult<()> {
        let policy = self.try_cpu_get(cpu)?;
        let driver = self.driver()?;
        let _guard = self.write_lock(cpu)?;

        let data = policy.snapshot();
        let mut candidate = PolicyCandidate::from(&data);
        candidate.min = data.user.min;
        candidate.max = data.user.max;
        candidate.policy = data.user.policy;
        candidate.governor = data.user.governor.clone();

        if let Some(freq) = driver.get(data.cpu) {
            candidate.cur = freq;
            if data.cur == 0 {
                log::debug!("cpufreq: driver did not initialize current freq");
                policy.update(|d| d.cur = freq);
            } else if data.cur != freq {
                self.out_of_sync(data.cpu, data.cur, freq);
            }
        }

        self.set_policy_locked(&driver, &policy, candidate)
    }

    /// Apply a client request to the policy of `cpu`
    ///
    /// The request becomes the policy's user request; a failed request
    /// leaves the previous one in place.
    pub fn set_policy(&self, cpu: usize, request: PolicyRequest) -> CpuFreqResult<()> {
        if request.min > request.max {
            return Err(CpuFreqError::InvalidArgument);
        }
        let policy = self.try_cpu_get(cpu)?;
        let driver = self.driver()?;
        let _guard = self.write_lock(cpu)?;

        let data = policy.snapshot();
        let mut candidate = PolicyCandidate::from(&data);
        candidate.min = request.min;
        candidate.max = request.max;
        if let Some(name) = request.governor.as_deref() {
            let (kind, governor) = self.parse_governor(name)?;
            candidate.policy = kind;
            candidate.governor = governor;
        }

        let previous = data.user;
        policy.update(|d| {
            d.user.min = request.min;
            d.user.max = request.max;
        });

        match self.set_policy_locked(&driver, &policy, candidate) {
            Ok(()) => {
                policy.update(|d| {
                    d.user.policy = d.policy;
                    d.user.governor = d.governor.clone();
                });
                Ok(())
            }
            Err(err) => {
                policy.update(|d| d.user = previous);
                Err(err)
            }
        }
    }

    /// Switch the governor of `cpu`'s policy
    pub fn set_gov(&self, name: &str, cpu: usize) -> CpuFreqResult<()> {
        let policy = self.try_cpu_get(cpu)?;
        let driver = self.driver()?;
        let _guard = self.write_lock(cpu)?;

        let data = policy.snapshot();
        match data.governor_name() {
            Some(current) if current.eq_ignore_ascii_case(name) => {
                log::debug!("cpufreq: target governor & current governor is same");
                return Err(CpuFreqError::InvalidArgument);
            }
            Some(_) => {}
            None => return Err(CpuFreqError::InvalidArgument),
        }

        let (kind, governor) = self.parse_governor(name)?;
        let mut candidate = PolicyCandidate::from(&data);
        candidate.policy = kind;
        candidate.governor = governor;

        let ret = self.set_policy_locked(&driver, &policy, candidate);
        policy.update(|d| {
            d.user.policy = d.policy;
            d.user.governor = d.governor.clone();
        });
        ret
    }

    /// Resolve a `scaling_governor` value for the registered driver
    pub fn parse_governor(&self, name: &str) -> CpuFreqResult<(ScalingPolicy, Option<GovernorHandle>)> {
        let driver = self.driver()?;
        let name = name.trim();
        match driver.mode() {
            ScalingMode::SetPolicy => {
                if name.eq_ignore_ascii_case("performance") {
                    Ok((ScalingPolicy::Performance, None))
                } else if name.eq_ignore_ascii_case("powersave") {
                    Ok((ScalingPolicy::Powersave, None))
                } else {
                    Err(CpuFreqError::InvalidArgument)
                }
            }
            ScalingMode::Target => self
                .governors()
                .find(name)
                .map(|governor| (ScalingPolicy::Governed, Some(governor)))
                .ok_or(CpuFreqError::InvalidArgument),
        }
    }

    /// Write `scaling_min_freq` or `scaling_max_freq`
    ///
    /// A verify rejection is only logged. The verified value becomes the
    /// user request whatever the protocol decides.
    pub(crate) fn store_bound(
        &self,
        driver: &DriverHandle,
        policy: &Policy,
        attr: Attribute,
        value: u32,
    ) -> CpuFreqResult<()> {
        let data = policy.snapshot();
        let mut candidate = PolicyCandidate::from(&data);
        candidate.min = data.user.min;
        candidate.max = data.user.max;
        match attr {
            Attribute::ScalingMinFreq => candidate.min = value,
            Attribute::ScalingMaxFreq => candidate.max = value,
            _ => return Err(CpuFreqError::InvalidArgument),
        }

        if let Err(err) = driver.verify(&mut candidate) {
            log::error!("cpufreq: Frequency verification failed: {}", err);
        }
        policy.update(|d| {
            d.user.min = candidate.min;
            d.user.max = candidate.max;
        });
        self.set_policy_locked(driver, policy, candidate)
    }
}
