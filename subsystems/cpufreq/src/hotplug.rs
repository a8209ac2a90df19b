//! # Policy Lifecycle
//!
//! Creating, merging, splitting and destroying policies as CPUs come and go.
//!
//! ## Add
//!
//! ```text
//!  add(cpu) ── mapped? ──yes──▶ done
//!     │no
//!     ▼
//!  driver.init ──▶ sibling of a live policy? ──yes──▶ join: STOP, grow cpus,
//!     │                    │no                        START, LIMITS, link,
//!     ▼                    ▼                          exit provisional
//!   fail: unmap      publish: bind cpus, link siblings, set policy
//! ```
//!
//! ## Remove
//!
//! A sibling leaving only shrinks the policy. The owner leaving saves the
//! intent of every member, unbinds them, waits for the external handle to be
//! released and exits the driver; if members remain, the lowest one is added
//! back as the new owner and the original CPU is then removed from the new
//! policy as a plain sibling.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::cpufreq::CpuFreq;
use crate::cpumask::{CpuMask, MAX_CPUS};
use crate::driver::{DriverHandle, ScalingMode};
use crate::error::{CpuFreqError, CpuFreqResult};
use crate::governor::{GovernorEvent, GovernorHandle};
use crate::lock::DomainWriteGuard;
use crate::notifier::PolicyEvent;
use crate::policy::{Policy, PolicyCandidate, PolicyData, PolicyRef, RefKind, ScalingPolicy, UserPolicy};

// =============================================================================
// Saved Snapshots
// =============================================================================

/// Intent of a CPU that left its policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedPolicy {
    /// Governor name, or driver policy name
    pub governor: Option<String>,
    /// User minimum; 0 = none
    pub min: u32,
    /// User maximum; 0 = none
    pub max: u32,
}

/// Saved snapshots of every CPU
pub struct SavedPolicies {
    slots: Mutex<[SavedPolicy; MAX_CPUS]>,
}

impl SavedPolicies {
    /// No saved intent
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(core::array::from_fn(|_| SavedPolicy::default())),
        }
    }

    /// Saved intent of `cpu`
    pub fn get(&self, cpu: usize) -> SavedPolicy {
        self.slots.lock().get(cpu).cloned().unwrap_or_default()
    }

    pub(crate) fn save(&self, cpu: usize, data: &PolicyData) {
        if let Some(slot) = self.slots.lock().get_mut(cpu) {
            *slot = SavedPolicy {
                governor: data.governor_name().map(String::from),
                min: data.user.min,
                max: data.user.max,
            };
        }
    }

    pub(crate) fn clear(&self, cpu: usize) {
        if let Some(slot) = self.slots.lock().get_mut(cpu) {
            *slot = SavedPolicy::default();
        }
    }

    /// Drop `governor` from the snapshot of `cpu` and reset its bounds
    pub(crate) fn forget(&self, cpu: usize, governor: &str) {
        if let Some(slot) = self.slots.lock().get_mut(cpu) {
            if slot
                .governor
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case(governor))
            {
                slot.governor = None;
            }
            slot.min = 0;
            slot.max = 0;
        }
    }
}

impl Default for SavedPolicies {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SavedPolicies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        f.debug_map()
            .entries(
                slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| **s != SavedPolicy::default()),
            )
            .finish()
    }
}

// =============================================================================
// Hotplug Entry Points
// =============================================================================

/// CPU hotplug notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    /// CPU came online
    Online,
    /// CPU is about to go offline
    DownPrepare,
    /// Offlining the CPU failed, it stays online
    DownFailed,
}

impl CpuFreq {
    /// Hotplug notifier; inactive while no driver is registered
    pub fn cpu_callback(&self, cpu: usize, action: HotplugAction) -> CpuFreqResult<()> {
        if self.registry().driver().is_none() {
            return Ok(());
        }
        match action {
            HotplugAction::Online | HotplugAction::DownFailed => self.add_cpu(cpu),
            HotplugAction::DownPrepare => self.remove_cpu(cpu),
        }
    }

    /// Mark `cpu` online and run the online callback
    pub fn cpu_up(&self, cpu: usize) -> CpuFreqResult<()> {
        self.set_cpu_online(cpu, true);
        self.cpu_callback(cpu, HotplugAction::Online)
    }

    /// Run the down-prepare callback and mark `cpu` offline
    pub fn cpu_down(&self, cpu: usize) -> CpuFreqResult<()> {
        let ret = self.cpu_callback(cpu, HotplugAction::DownPrepare);
        self.set_cpu_online(cpu, false);
        ret
    }

    // =========================================================================
    // Add
    // =========================================================================

    /// Bring `cpu` under a policy, joining its domain's policy if one exists
    pub fn add_cpu(&self, cpu: usize) -> CpuFreqResult<()> {
        if cpu >= MAX_CPUS {
            return Err(CpuFreqError::InvalidArgument);
        }
        if !self.is_online(cpu) {
            return Ok(());
        }
        log::debug!("cpufreq: adding CPU {}", cpu);
        if self.registry().lookup(cpu, RefKind::Internal).is_ok() {
            return Ok(());
        }
        let driver = self.driver()?;

        let mut data = PolicyData::new(cpu);
        if driver.mode() == ScalingMode::Target {
            data.governor = Some(self.initial_governor(cpu)?);
        }

        self.locks().set_owner(cpu, Some(cpu));
        let guard = match self.write_lock(cpu) {
            Ok(guard) => guard,
            Err(err) => {
                self.locks().set_owner(cpu, None);
                return Err(err);
            }
        };

        if let Err(err) = driver.init(&mut data) {
            log::debug!("cpufreq: initialization of CPU {} failed: {}", cpu, err);
            drop(guard);
            self.locks().set_owner(cpu, None);
            return Err(err.into());
        }
        self.seed_policy(&driver, cpu, &mut data);

        let mut start = PolicyCandidate::from(&data);
        self.policy_notifier().notify(PolicyEvent::Start, &mut start);

        let related = data.related_cpus;
        let policy = Policy::new(data);

        match self.find_managing_policy(cpu, related) {
            Some(managed) => self.join_policy(&driver, cpu, &policy, managed, guard),
            None => self.publish_policy(&driver, cpu, &policy, guard),
        }
    }

    /// Governor of an online sibling, else the configured default
    fn initial_governor(&self, cpu: usize) -> CpuFreqResult<GovernorHandle> {
        for sibling in self.online_cpus().without(cpu) {
            let Some(policy) = self.registry().peek(sibling) else {
                continue;
            };
            let data = policy.snapshot();
            if data.related_cpus.test(cpu) {
                if let Some(governor) = data.governor {
                    return Ok(governor);
                }
            }
        }
        let config = self.config();
        self.governors()
            .find(config.default_governor)
            .or_else(|| config.fallback_governor.and_then(|name| self.governors().find(name)))
            .ok_or(CpuFreqError::NotFound)
    }

    /// Fill the fields the driver left open and restore saved intent
    fn seed_policy(&self, driver: &DriverHandle, cpu: usize, data: &mut PolicyData) {
        data.related_cpus = data.related_cpus | data.cpus;
        data.cpus = data.cpus & self.online_cpus();
        data.cpus.set(cpu);

        if data.min == 0 && data.max == 0 {
            data.min = data.cpuinfo.min_freq;
            data.max = data.cpuinfo.max_freq;
        }
        if driver.mode() == ScalingMode::SetPolicy && data.policy == ScalingPolicy::Governed {
            data.policy = ScalingPolicy::Performance;
        }
        data.user = UserPolicy {
            min: data.min,
            max: data.max,
            policy: data.policy,
            governor: data.governor.clone(),
        };
        data.util = 0;

        let saved = self.saved().get(cpu);
        if let Some(name) = saved.governor.as_deref() {
            if let Ok((policy, governor)) = self.parse_governor(name) {
                log::debug!("cpufreq: restoring governor {} for cpu {}", name, cpu);
                data.policy = policy;
                if governor.is_some() {
                    data.governor = governor;
                }
            }
        }
        if saved.min != 0 {
            data.min = saved.min;
            data.user.min = saved.min;
        }
        if saved.max != 0 {
            data.max = saved.max;
            data.user.max = saved.max;
        }
    }

    fn find_managing_policy(&self, cpu: usize, related: CpuMask) -> Option<PolicyRef> {
        related
            .without(cpu)
            .iter()
            .find_map(|sibling| self.registry().lookup(sibling, RefKind::External).ok())
    }

    /// Fold `cpu` into the live policy of its domain
    fn join_policy<'a>(
        &'a self,
        driver: &DriverHandle,
        cpu: usize,
        provisional: &Arc<Policy>,
        managed: PolicyRef,
        guard: DomainWriteGuard<'a>,
    ) -> CpuFreqResult<()> {
        let owner = managed.owning_cpu();
        drop(guard);
        self.locks().set_owner(cpu, Some(owner));
        let guard = match self.write_lock(cpu) {
            Ok(guard) => guard,
            Err(err) => {
                driver.exit(provisional);
                self.locks().set_owner(cpu, None);
                return Err(err);
            }
        };

        // the owner may have been removed while this CPU waited for the lock
        let live = self
            .registry()
            .peek(owner)
            .is_some_and(|p| Arc::ptr_eq(&p, managed.arc()))
            && !managed.node().is_released();
        if !live {
            return self.join_failed(driver, cpu, provisional, managed, guard);
        }

        if let Err(err) = self.governor_event(&managed, GovernorEvent::Stop) {
            log::warn!("cpufreq: stopping governor of CPU {} failed: {}", owner, err);
        }
        let online = self.online_cpus();
        let joined = provisional.cpus();
        self.registry().join(cpu, managed.arc(), |d| {
            d.cpus = (d.cpus | joined | CpuMask::of(cpu)) & online;
        });
        self.restart_governor(&managed);

        log::debug!("cpufreq: CPU {} already managed by CPU {}, adding link", cpu, owner);
        self.links().lock().insert(cpu, managed);
        if let Some(sink) = self.sink() {
            sink.link_created(cpu, owner);
        }
        self.saved().clear(cpu);

        driver.exit(provisional);
        drop(guard);
        Ok(())
    }

    /// The domain policy went away under a joining CPU
    ///
    /// With siblings left, the promoted owner picks `cpu` up. Otherwise
    /// `cpu` publishes its own policy without the departing CPUs.
    fn join_failed<'a>(
        &'a self,
        driver: &DriverHandle,
        cpu: usize,
        provisional: &Arc<Policy>,
        dying: PolicyRef,
        guard: DomainWriteGuard<'a>,
    ) -> CpuFreqResult<()> {
        let owner = guard.owner();
        let departing = dying.cpus();
        // the promoted owner only starts once `dying` is put
        if !departing.without(owner).is_empty() {
            log::debug!("cpufreq: policy of CPU {} went away, CPU {} left to promotion", owner, cpu);
            driver.exit(provisional);
            self.locks().set_owner(cpu, None);
            drop(guard);
            drop(dying);
            return Err(CpuFreqError::StaleCpu);
        }

        log::debug!("cpufreq: policy of CPU {} went away, CPU {} publishes its own", owner, cpu);
        provisional.update(|d| d.cpus = (d.cpus & !departing) | CpuMask::of(cpu));
        self.locks().set_owner(cpu, Some(cpu));
        drop(guard);
        drop(dying);
        let guard = match self.write_lock(cpu) {
            Ok(guard) => guard,
            Err(err) => {
                driver.exit(provisional);
                self.locks().set_owner(cpu, None);
                return Err(err);
            }
        };
        self.publish_policy(driver, cpu, provisional, guard)
    }

    /// Make a new policy live and apply its initial state
    fn publish_policy<'a>(
        &'a self,
        driver: &DriverHandle,
        cpu: usize,
        policy: &Arc<Policy>,
        guard: DomainWriteGuard<'a>,
    ) -> CpuFreqResult<()> {
        if let Some(sink) = self.sink() {
            sink.node_published(cpu);
        }
        let cpus = policy.cpus() & self.online_cpus();
        self.registry().bind(cpus, policy);
        for member in cpus {
            self.locks().set_owner(member, Some(cpu));
        }
        for sibling in cpus.without(cpu) {
            log::debug!("cpufreq: CPU {} linked to CPU {}", sibling, cpu);
            if let Some(link) = PolicyRef::acquire(policy.clone(), RefKind::External) {
                self.links().lock().insert(sibling, link);
                if let Some(sink) = self.sink() {
                    sink.link_created(sibling, cpu);
                }
            }
        }

        let candidate = PolicyCandidate::from(&policy.snapshot());
        policy.update(|d| d.governor = None);
        let ret = self.set_policy_locked(driver, policy, candidate);
        policy.update(|d| {
            d.user.policy = d.policy;
            d.user.governor = d.governor.clone();
        });

        if let Err(err) = ret {
            log::debug!("cpufreq: setting policy of CPU {} failed: {}", cpu, err);
            driver.exit(policy);
            self.registry().unbind_from(cpus, policy);
            for member in cpus {
                self.locks().set_owner(member, None);
            }
            drop(self.take_links(cpus.without(cpu)));
            drop(guard);
            self.release_node(cpu, policy);
            return Err(err);
        }

        self.saved().clear(cpu);
        drop(guard);
        log::debug!("cpufreq: initialization of CPU {} complete", cpu);
        Ok(())
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Take `cpu` out of its policy
    pub fn remove_cpu(&self, cpu: usize) -> CpuFreqResult<()> {
        if cpu >= MAX_CPUS {
            return Err(CpuFreqError::InvalidArgument);
        }
        if !self.is_online(cpu) {
            return Ok(());
        }
        let guard = self.write_lock(cpu)?;
        self.remove_locked(cpu, guard)
    }

    /// Take `cpu` out of its policy; consumes the caller's writer lock
    pub fn remove_locked<'a>(&'a self, cpu: usize, guard: DomainWriteGuard<'a>) -> CpuFreqResult<()> {
        log::debug!("cpufreq: unregistering CPU {}", cpu);
        let Some(policy) = self.registry().unbind(cpu) else {
            return Err(CpuFreqError::InvalidArgument);
        };
        if policy.owning_cpu() != cpu {
            self.remove_sibling(cpu, &policy, guard);
            return Ok(());
        }
        self.remove_owner(cpu, &policy, guard);
        Ok(())
    }

    fn remove_sibling(&self, cpu: usize, policy: &Arc<Policy>, guard: DomainWriteGuard<'_>) {
        log::debug!("cpufreq: removing link of CPU {}", cpu);
        if let Err(err) = self.governor_event(policy, GovernorEvent::Stop) {
            log::warn!("cpufreq: stopping governor of CPU {} failed: {}", policy.owning_cpu(), err);
        }
        policy.update(|d| d.cpus.clear(cpu));
        self.restart_governor(policy);
        drop(guard);
        self.locks().set_owner(cpu, None);
        drop(self.take_links(CpuMask::of(cpu)));
    }

    fn remove_owner(&self, cpu: usize, policy: &Arc<Policy>, guard: DomainWriteGuard<'_>) {
        let driver = self.registry().driver();
        let data = policy.snapshot();
        self.saved().save(cpu, &data);

        let siblings = data.cpus.without(cpu);
        if !siblings.is_empty() {
            self.registry().unbind_from(siblings, policy);
            for sibling in siblings {
                self.saved().save(sibling, &data);
                log::debug!("cpufreq: removing link for cpu {}", sibling);
            }
            drop(self.take_links(siblings));
        }

        if driver.as_ref().is_some_and(|d| d.mode() == ScalingMode::Target) {
            if let Err(err) = self.governor_event(policy, GovernorEvent::Stop) {
                log::warn!("cpufreq: stopping governor of CPU {} failed: {}", cpu, err);
            }
        }
        drop(guard);

        log::debug!("cpufreq: waiting for dropping of refcount");
        self.release_node(cpu, policy);
        log::debug!("cpufreq: wait complete");

        let relock = self.write_lock(cpu);
        if let Some(driver) = &driver {
            driver.exit(policy);
        }
        drop(relock);
        self.locks().set_owner(cpu, None);

        if let Some(successor) = siblings.first() {
            policy.update(|d| d.cpus.clear(cpu));
            log::debug!("cpufreq: promoting CPU {} to own the domain of CPU {}", successor, cpu);
            if let Err(err) = self.add_cpu(successor) {
                log::warn!("cpufreq: re-adding CPU {} failed: {}", successor, err);
            }
            self.drop_stale_link(cpu);
        }
    }

    /// After promotion `cpu` may have been linked into the new policy
    fn drop_stale_link(&self, cpu: usize) {
        let Ok(guard) = self.write_lock(cpu) else {
            return;
        };
        match self.registry().unbind(cpu) {
            Some(policy) if policy.owning_cpu() != cpu => self.remove_sibling(cpu, &policy, guard),
            Some(policy) => {
                log::warn!("cpufreq: CPU {} still owns {} after promotion", cpu, policy.id());
                self.registry().bind(CpuMask::of(cpu), &policy);
            }
            None => {}
        }
    }

    /// START then LIMITS after a membership change
    fn restart_governor(&self, policy: &Policy) {
        for event in [GovernorEvent::Start, GovernorEvent::Limits] {
            if let Err(err) = self.governor_event(policy, event) {
                log::warn!(
                    "cpufreq: governor {:?} on CPU {} failed: {}",
                    event,
                    policy.owning_cpu(),
                    err
                );
            }
        }
    }

    fn take_links(&self, cpus: CpuMask) -> Vec<PolicyRef> {
        let mut links = self.links().lock();
        let taken: Vec<PolicyRef> = cpus.iter().filter_map(|cpu| links.remove(&cpu)).collect();
        drop(links);
        if let Some(sink) = self.sink() {
            for cpu in cpus {
                sink.link_removed(cpu);
            }
        }
        taken
    }

    /// Drop the base reference of the node and wait for its teardown
    fn release_node(&self, cpu: usize, policy: &Policy) {
        policy.node().put();
        policy.node().wait_released();
        if let Some(sink) = self.sink() {
            sink.node_removed(cpu);
        }
    }
}
