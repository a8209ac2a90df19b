//! # Governors
//!
//! Pluggable frequency-selection algorithms and the state machine the core
//! runs them through.
//!
//! ```text
//!            START ok                 LIMITS
//!  Stopped ──────────▶ Starting ──▶ Running ◀──┐
//!     ▲   START failed    │            │  └──────┘
//!     └───────────────────┘            │ STOP
//!     ▲────────────────────────────────┘
//! ```
//!
//! Governor callbacks run with the domain writer lock held. They may target
//! frequencies through [`CpuFreq::target_locked`] but must not take a domain
//! lock.

mod builtin;

pub use builtin::{Performance, Powersave, Userspace};

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;

use spin::Mutex;

use crate::cpufreq::CpuFreq;
use crate::cpumask::MAX_CPUS;
use crate::error::{CpuFreqError, CpuFreqResult};
use crate::policy::Policy;

// =============================================================================
// Governor Trait
// =============================================================================

/// Event delivered to a governor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorEvent {
    /// Begin managing the policy
    Start,
    /// Stop managing the policy
    Stop,
    /// Bounds changed, re-evaluate
    Limits,
}

/// Lifecycle state of the governor attached to a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum GovernorState {
    /// Not running
    #[default]
    Stopped  = 0,
    /// START in progress
    Starting = 1,
    /// Managing the policy
    Running  = 2,
}

/// A frequency-selection algorithm
pub trait Governor: Send + Sync {
    /// Unique name
    fn name(&self) -> &str;

    /// Slowest hardware transition the governor can cope with, in ns; 0 = any
    fn max_transition_latency(&self) -> u32 {
        0
    }

    /// Handle a lifecycle event
    fn handle(&self, cpufreq: &CpuFreq, policy: &Policy, event: GovernorEvent)
        -> CpuFreqResult<()>;

    /// Write `scaling_setspeed`
    fn store_setspeed(&self, _cpufreq: &CpuFreq, _policy: &Policy, _freq: u32) -> CpuFreqResult<()> {
        Err(CpuFreqError::InvalidArgument)
    }

    /// Read `scaling_setspeed`
    fn show_setspeed(&self, _policy: &Policy) -> Option<u32> {
        None
    }
}

/// Shared handle to a registered governor, compared by identity
#[derive(Clone)]
pub struct GovernorHandle(Arc<dyn Governor>);

impl GovernorHandle {
    /// Wrap a governor
    pub fn new(governor: Arc<dyn Governor>) -> Self {
        Self(governor)
    }
}

impl Deref for GovernorHandle {
    type Target = dyn Governor;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for GovernorHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.0) as *const () == Arc::as_ptr(&other.0) as *const ()
    }
}

impl Eq for GovernorHandle {}

impl fmt::Debug for GovernorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Governor").field(&self.0.name()).finish()
    }
}

// =============================================================================
// Governor List
// =============================================================================

/// Registered governors
pub struct GovernorList {
    governors: Mutex<Vec<GovernorHandle>>,
}

impl GovernorList {
    /// Create an empty list
    pub const fn new() -> Self {
        Self {
            governors: Mutex::new(Vec::new()),
        }
    }

    /// Add a governor; names are unique ignoring case
    pub(crate) fn register(&self, governor: GovernorHandle) -> CpuFreqResult<()> {
        let mut list = self.governors.lock();
        if list
            .iter()
            .any(|g| g.name().eq_ignore_ascii_case(governor.name()))
        {
            return Err(CpuFreqError::Busy);
        }
        list.push(governor);
        Ok(())
    }

    /// Remove a governor by name
    pub(crate) fn unregister(&self, name: &str) -> Option<GovernorHandle> {
        let mut list = self.governors.lock();
        let pos = list.iter().position(|g| g.name().eq_ignore_ascii_case(name))?;
        Some(list.remove(pos))
    }

    /// Look a governor up by name
    pub fn find(&self, name: &str) -> Option<GovernorHandle> {
        self.governors
            .lock()
            .iter()
            .find(|g| g.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Names in registration order
    pub fn names(&self) -> Vec<String> {
        self.governors
            .lock()
            .iter()
            .map(|g| String::from(g.name()))
            .collect()
    }

    /// Number of registered governors
    pub fn len(&self) -> usize {
        self.governors.lock().len()
    }

    /// Whether no governor is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for GovernorList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GovernorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// =============================================================================
// State Machine
// =============================================================================

impl CpuFreq {
    /// Run `event` through the policy's governor
    ///
    /// The caller holds the domain writer lock. START substitutes the
    /// fallback governor when the hardware is slower than the governor
    /// tolerates. STOP on a stopped governor and LIMITS on a governor that
    /// is not running are no-ops.
    pub(crate) fn governor_event(&self, policy: &Policy, event: GovernorEvent) -> CpuFreqResult<()> {
        let (governor, latency, state) = {
            let data = policy.snapshot();
            (data.governor, data.cpuinfo.transition_latency, data.governor_state)
        };
        let mut governor = governor.ok_or(CpuFreqError::InvalidArgument)?;

        match event {
            GovernorEvent::Stop if state == GovernorState::Stopped => return Ok(()),
            GovernorEvent::Limits if state != GovernorState::Running => return Ok(()),
            GovernorEvent::Start => {
                let limit = governor.max_transition_latency();
                if limit != 0 && latency > limit {
                    let fallback = self.fallback_governor().ok_or_else(|| {
                        log::warn!(
                            "cpufreq: {} governor needs latency <= {} ns, hardware has {} ns",
                            governor.name(),
                            limit,
                            latency
                        );
                        CpuFreqError::IncompatibleGovernor
                    })?;
                    log::warn!(
                        "cpufreq: {} governor failed, too long transition latency of HW, fallback to {} governor",
                        governor.name(),
                        fallback.name()
                    );
                    policy.update(|d| d.governor = Some(fallback.clone()));
                    governor = fallback;
                }
                policy.update(|d| d.governor_state = GovernorState::Starting);
            }
            _ => {}
        }

        log::debug!(
            "cpufreq: governor {} event {:?} for CPU {}",
            governor.name(),
            event,
            policy.owning_cpu()
        );
        let ret = governor.handle(self, policy, event);

        match (event, ret.is_ok()) {
            (GovernorEvent::Start, true) => {
                policy.update(|d| d.governor_state = GovernorState::Running);
            }
            (GovernorEvent::Start, false) | (GovernorEvent::Stop, true) => {
                policy.update(|d| d.governor_state = GovernorState::Stopped);
            }
            _ => {}
        }
        ret
    }

    fn fallback_governor(&self) -> Option<GovernorHandle> {
        self.config().fallback_governor.and_then(|name| self.governors().find(name))
    }

    /// Register a governor
    pub fn register_governor(&self, governor: Arc<dyn Governor>) -> CpuFreqResult<()> {
        if self.is_disabled() {
            return Err(CpuFreqError::NoDriver);
        }
        let name = String::from(governor.name());
        self.governors().register(GovernorHandle::new(governor))?;
        log::debug!("cpufreq: registered governor {}", name);
        Ok(())
    }

    /// Unregister a governor
    ///
    /// Saved snapshots of offline CPUs naming the governor forget it, and
    /// every offline CPU forgets its saved bounds.
    pub fn unregister_governor(&self, name: &str) -> CpuFreqResult<()> {
        if self.is_disabled() {
            return Err(CpuFreqError::NoDriver);
        }
        let online = self.online_cpus();
        for cpu in (0..MAX_CPUS).filter(|&cpu| !online.test(cpu)) {
            self.saved().forget(cpu, name);
        }
        self.governors()
            .unregister(name)
            .map(|_| log::debug!("cpufreq: unregistered governor {}", name))
            .ok_or(CpuFreqError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDriver, FlakyGovernor};
    use crate::CpuFreqConfig;

    #[test]
    fn test_register_duplicate_governor() {
        let list = GovernorList::new();
        list.register(GovernorHandle::new(Arc::new(Performance))).unwrap();
        let err = list.register(GovernorHandle::new(Arc::new(Performance)));
        assert_eq!(err, Err(CpuFreqError::Busy));
        assert!(list.find("PERFORMANCE").is_some());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_latency_fallback_substitutes_governor() {
        let cpufreq = crate::testing::cpufreq(&[0]);
        let slow = Arc::new(FlakyGovernor::new("picky").with_max_latency(1_000));
        cpufreq.register_governor(slow).unwrap();
        let driver = Arc::new(FakeDriver::new().with_latency(50_000));
        cpufreq.register_driver(driver).unwrap();

        cpufreq.set_gov("picky", 0).unwrap();
        let policy = cpufreq.cpu_get(0).unwrap();
        assert_eq!(policy.governor().unwrap().name(), "performance");
        assert_eq!(policy.governor_state(), GovernorState::Running);
    }

    #[test]
    fn test_latency_without_fallback_is_incompatible() {
        let config = CpuFreqConfig::new().with_fallback_governor(None);
        let cpufreq = crate::testing::cpufreq_with(config, &[0]);
        let slow = Arc::new(FlakyGovernor::new("picky").with_max_latency(1_000));
        cpufreq.register_governor(slow).unwrap();
        let driver = Arc::new(FakeDriver::new().with_latency(50_000));
        cpufreq.register_driver(driver).unwrap();

        assert_eq!(cpufreq.set_gov("picky", 0), Err(CpuFreqError::IncompatibleGovernor));
        let policy = cpufreq.cpu_get(0).unwrap();
        assert_eq!(policy.governor().unwrap().name(), "performance");
        assert_eq!(policy.governor_state(), GovernorState::Running);
    }

    #[test]
    fn test_unregister_governor_forgets_offline_snapshots() {
        let cpufreq = crate::testing::cpufreq(&[0, 1]);
        cpufreq.register_governor(Arc::new(FlakyGovernor::new("custom"))).unwrap();
        cpufreq.register_driver(Arc::new(FakeDriver::new())).unwrap();
        cpufreq.set_gov("custom", 1).unwrap();
        cpufreq.cpu_down(1).unwrap();

        assert_eq!(cpufreq.saved().get(1).governor.as_deref(), Some("custom"));
        cpufreq.unregister_governor("custom").unwrap();
        let saved = cpufreq.saved().get(1);
        assert_eq!(saved.governor, None);
        assert_eq!((saved.min, saved.max), (0, 0));
        assert_eq!(cpufreq.unregister_governor("custom"), Err(CpuFreqError::NotFound));
    }
}
