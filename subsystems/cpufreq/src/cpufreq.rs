//! # Frequency Scaling Core
//!
//! [`CpuFreq`] ties the pieces together: the online map, the domain lock
//! table, the policy registry, governors, notifier channels and QoS.
//!
//! The operations live next to the concern they implement:
//!
//! | Concern | Module |
//! |---------|--------|
//! | Governor state machine, governor registration | `governor` |
//! | Transition notification, desync repair | `transition` |
//! | CPU add/remove, domain merge | `hotplug` |
//! | Policy-set protocol, updates | `set_policy` |
//! | Attribute show/store | `attr` |
//! | QoS requests | `qos` |
//!
//! This module holds driver registration, frequency queries and targeting,
//! and suspend/resume.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, RwLock};
use static_assertions::assert_impl_all;

use crate::attr::{Attribute, AttributeSink};
use crate::config::CpuFreqConfig;
use crate::cpumask::{AtomicCpuMask, CpuMask};
use crate::driver::{CpuFreqDriver, DriverFlags, DriverHandle, Relation, ScalingMode};
use crate::error::{CpuFreqError, CpuFreqResult, DriverError};
use crate::governor::{Governor, GovernorHandle, GovernorList, Performance, Powersave, Userspace};
use crate::hotplug::SavedPolicies;
use crate::lock::{DomainLockTable, DomainReadGuard, DomainWriteGuard};
use crate::notifier::{
    NotifierChain, NotifierId, NotifierPriority, PolicyObserver, TransitionObserver,
};
use crate::policy::{Policy, PolicyData, PolicyRef, RefKind};
use crate::qos::PmQos;
use crate::registry::PolicyRegistry;
use crate::transition::LoopCalibration;
use crate::work::UpdateQueue;

/// CPU frequency scaling core
pub struct CpuFreq {
    config: CpuFreqConfig,
    online: AtomicCpuMask,
    locks: DomainLockTable,
    registry: PolicyRegistry,
    governors: GovernorList,
    policy_notifier: NotifierChain<dyn PolicyObserver>,
    transition_notifier: NotifierChain<dyn TransitionObserver>,
    qos: PmQos,
    saved: SavedPolicies,
    links: Mutex<BTreeMap<usize, PolicyRef>>,
    updates: UpdateQueue,
    loops: LoopCalibration,
    sink: RwLock<Option<Arc<dyn AttributeSink>>>,
    suspended: AtomicBool,
}

assert_impl_all!(CpuFreq: Send, Sync);

impl CpuFreq {
    /// Create a core with the built-in governors registered
    pub fn new(config: CpuFreqConfig) -> Self {
        let cpufreq = Self {
            config,
            online: AtomicCpuMask::new(),
            locks: DomainLockTable::new(),
            registry: PolicyRegistry::new(),
            governors: GovernorList::new(),
            policy_notifier: NotifierChain::new(),
            transition_notifier: NotifierChain::new(),
            qos: PmQos::new(),
            saved: SavedPolicies::new(),
            links: Mutex::new(BTreeMap::new()),
            updates: UpdateQueue::new(),
            loops: LoopCalibration::new(config.loops_per_jiffy),
            sink: RwLock::new(None),
            suspended: AtomicBool::new(false),
        };
        let builtins: [Arc<dyn Governor>; 3] = [
            Arc::new(Performance),
            Arc::new(Powersave),
            Arc::new(Userspace::new()),
        ];
        for governor in builtins {
            // the list is empty, names cannot clash
            let _ = cpufreq.governors.register(GovernorHandle::new(governor));
        }
        cpufreq
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Configuration
    pub fn config(&self) -> &CpuFreqConfig {
        &self.config
    }

    /// Domain lock table
    pub fn locks(&self) -> &DomainLockTable {
        &self.locks
    }

    /// Policy registry
    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Registered governors
    pub fn governors(&self) -> &GovernorList {
        &self.governors
    }

    /// QoS aggregates
    pub fn qos(&self) -> &PmQos {
        &self.qos
    }

    /// Loop calibration state
    pub fn loops(&self) -> &LoopCalibration {
        &self.loops
    }

    /// Deferred update queue
    pub fn updates(&self) -> &UpdateQueue {
        &self.updates
    }

    pub(crate) fn saved(&self) -> &SavedPolicies {
        &self.saved
    }

    pub(crate) fn links(&self) -> &Mutex<BTreeMap<usize, PolicyRef>> {
        &self.links
    }

    pub(crate) fn policy_notifier(&self) -> &NotifierChain<dyn PolicyObserver> {
        &self.policy_notifier
    }

    pub(crate) fn transition_notifier(&self) -> &NotifierChain<dyn TransitionObserver> {
        &self.transition_notifier
    }

    /// Registered driver
    pub fn driver(&self) -> CpuFreqResult<DriverHandle> {
        self.registry.driver().ok_or(CpuFreqError::NoDriver)
    }

    // =========================================================================
    // Online Map and Locks
    // =========================================================================

    /// Record a CPU coming online or going offline
    pub fn set_cpu_online(&self, cpu: usize, online: bool) {
        self.online.assign(cpu, online);
    }

    /// Online CPUs
    pub fn online_cpus(&self) -> CpuMask {
        self.online.load()
    }

    /// Whether `cpu` is online
    pub fn is_online(&self, cpu: usize) -> bool {
        self.online.test(cpu)
    }

    /// Reader lock of `cpu`'s domain
    pub fn read_lock(&self, cpu: usize) -> CpuFreqResult<DomainReadGuard<'_>> {
        self.locks.read(cpu, &self.online)
    }

    /// Writer lock of `cpu`'s domain
    pub fn write_lock(&self, cpu: usize) -> CpuFreqResult<DomainWriteGuard<'_>> {
        self.locks.write(cpu, &self.online)
    }

    // =========================================================================
    // Policy References
    // =========================================================================

    /// Reference the policy of `cpu`; `None` without driver or policy
    pub fn cpu_get(&self, cpu: usize) -> Option<PolicyRef> {
        self.try_cpu_get(cpu).ok()
    }

    /// Reference the policy of `cpu`
    pub fn try_cpu_get(&self, cpu: usize) -> CpuFreqResult<PolicyRef> {
        self.registry.lookup(cpu, RefKind::External)
    }

    /// Snapshot of the policy of `cpu`
    pub fn get_policy(&self, cpu: usize) -> CpuFreqResult<PolicyData> {
        Ok(self.try_cpu_get(cpu)?.snapshot())
    }

    /// Run `f` on the policy of `cpu` under the domain reader lock
    pub fn read_policy<R>(&self, cpu: usize, f: impl FnOnce(&PolicyData) -> R) -> CpuFreqResult<R> {
        let policy = self.try_cpu_get(cpu)?;
        let _guard = self.read_lock(cpu)?;
        Ok(f(&policy.snapshot()))
    }

    // =========================================================================
    // Frequency Queries
    // =========================================================================

    /// Hardware frequency of `cpu` in kHz, 0 if unknown
    ///
    /// Repairs a disagreement with the policy's belief on the way.
    pub fn get(&self, cpu: usize) -> u32 {
        let Ok(_policy) = self.try_cpu_get(cpu) else {
            return 0;
        };
        let Ok(_guard) = self.read_lock(cpu) else {
            return 0;
        };
        self.get_locked(cpu)
    }

    pub(crate) fn get_locked(&self, cpu: usize) -> u32 {
        let Some(driver) = self.registry.driver() else {
            return 0;
        };
        let Some(policy) = self.registry.peek(cpu) else {
            return 0;
        };
        let Some(freq) = driver.get(cpu) else {
            return 0;
        };
        let (owner, cur) = {
            let data = policy.snapshot();
            (data.cpu, data.cur)
        };
        if cur != 0 && freq != cur && !driver.const_loops() {
            self.out_of_sync(owner, cur, freq);
        }
        freq
    }

    /// Last known frequency of `cpu`, without asking the driver
    pub fn quick_get(&self, cpu: usize) -> u32 {
        self.cpu_get(cpu).map_or(0, |p| p.cur())
    }

    /// Enforced maximum of `cpu`
    pub fn quick_get_max(&self, cpu: usize) -> u32 {
        self.cpu_get(cpu).map_or(0, |p| p.effective().max)
    }

    /// Last reported utilization of `cpu`
    pub fn quick_get_util(&self, cpu: usize) -> u32 {
        self.cpu_get(cpu).map_or(0, |p| p.util())
    }

    /// Record a load sample for the policy of `cpu`
    pub fn notify_utilization(&self, cpu: usize, util: u32) {
        if let Some(policy) = self.registry.peek(cpu) {
            policy.update(|d| d.util = util);
            self.attribute_changed(policy.owning_cpu(), Attribute::CpuUtilization);
        }
    }

    /// Average frequency of `cpu` as reported by the driver, 0 if unknown
    pub fn driver_getavg(&self, cpu: usize) -> u32 {
        if !self.is_online(cpu) {
            return 0;
        }
        let Ok(driver) = self.driver() else {
            return 0;
        };
        let Ok(policy) = self.try_cpu_get(cpu) else {
            return 0;
        };
        driver.getavg(&policy, cpu).unwrap_or(0)
    }

    // =========================================================================
    // Targeting
    // =========================================================================

    /// Ask the driver for a frequency; the caller holds the writer lock
    pub fn target_locked(&self, policy: &Policy, target_freq: u32, relation: Relation) -> CpuFreqResult<()> {
        if self.is_disabled() {
            return Err(CpuFreqError::NoDriver);
        }
        let (cpu, cur) = {
            let data = policy.snapshot();
            (data.cpu, data.cur)
        };
        log::debug!(
            "cpufreq: target for CPU {}: {} kHz, relation {:?}",
            cpu,
            target_freq,
            relation
        );
        if target_freq == cur {
            return Ok(());
        }
        let driver = self.driver()?;
        if !self.is_online(cpu) || driver.mode() != ScalingMode::Target {
            return Err(CpuFreqError::InvalidArgument);
        }
        driver.target(self, policy, target_freq, relation)?;
        Ok(())
    }

    /// Ask the driver for a frequency on `cpu`'s domain
    pub fn driver_target(&self, cpu: usize, target_freq: u32, relation: Relation) -> CpuFreqResult<()> {
        let policy = self.try_cpu_get(cpu)?;
        let _guard = self.write_lock(cpu)?;
        self.target_locked(&policy, target_freq, relation)
    }

    // =========================================================================
    // Driver Registration
    // =========================================================================

    /// Register the platform driver and bring up every online CPU
    pub fn register_driver(&self, driver: Arc<dyn CpuFreqDriver>) -> CpuFreqResult<()> {
        if self.is_disabled() {
            return Err(CpuFreqError::NoDriver);
        }
        let handle = DriverHandle::new(driver.clone());
        log::debug!("cpufreq: trying to register driver {}", handle.name());
        self.registry.install_driver(handle.clone())?;

        for cpu in self.online_cpus() {
            if let Err(err) = self.add_cpu(cpu) {
                log::debug!("cpufreq: adding CPU {} failed: {}", cpu, err);
            }
        }

        if !handle.flags().contains(DriverFlags::STICKY) && self.registry.bound_cpus().is_empty() {
            log::debug!("cpufreq: no CPU initialized for driver {}", handle.name());
            self.registry.remove_driver(&driver)?;
            return Err(CpuFreqError::DriverRejected(DriverError::NoDevice));
        }

        log::info!("cpufreq: driver {} up and running", handle.name());
        Ok(())
    }

    /// Remove every policy and unregister the platform driver
    pub fn unregister_driver(&self, driver: &Arc<dyn CpuFreqDriver>) -> CpuFreqResult<()> {
        match self.registry.driver() {
            Some(current) if current.is(driver) => {}
            _ => return Err(CpuFreqError::NotCurrentDriver),
        }
        log::debug!("cpufreq: unregistering driver {}", driver.name());

        for cpu in self.online_cpus() {
            if let Err(err) = self.remove_cpu(cpu) {
                log::debug!("cpufreq: removing CPU {} failed: {}", cpu, err);
            }
        }
        self.registry.remove_driver(driver)?;
        Ok(())
    }

    /// Turn the core off for good
    pub fn disable(&self) {
        self.registry.disable();
    }

    /// Whether the core has been disabled
    pub fn is_disabled(&self) -> bool {
        self.registry.is_disabled()
    }

    // =========================================================================
    // Notifiers and Sink
    // =========================================================================

    /// Observe policy changes
    pub fn register_policy_notifier(
        &self,
        observer: Arc<dyn PolicyObserver>,
        priority: NotifierPriority,
    ) -> NotifierId {
        self.policy_notifier.register(observer, priority)
    }

    /// Stop observing policy changes
    pub fn unregister_policy_notifier(&self, id: NotifierId) -> bool {
        self.policy_notifier.unregister(id)
    }

    /// Observe frequency transitions
    pub fn register_transition_notifier(
        &self,
        observer: Arc<dyn TransitionObserver>,
        priority: NotifierPriority,
    ) -> NotifierId {
        self.transition_notifier.register(observer, priority)
    }

    /// Stop observing frequency transitions
    pub fn unregister_transition_notifier(&self, id: NotifierId) -> bool {
        self.transition_notifier.unregister(id)
    }

    /// Install the attribute surface
    pub fn set_attribute_sink(&self, sink: Option<Arc<dyn AttributeSink>>) {
        *self.sink.write() = sink;
    }

    pub(crate) fn sink(&self) -> Option<Arc<dyn AttributeSink>> {
        self.sink.read().clone()
    }

    pub(crate) fn attribute_changed(&self, cpu: usize, attr: Attribute) {
        if let Some(sink) = self.sink() {
            sink.attribute_changed(cpu, attr);
        }
    }

    // =========================================================================
    // Suspend / Resume
    // =========================================================================

    /// Prepare the driver for system suspend
    pub fn suspend(&self) -> CpuFreqResult<()> {
        if self.suspended.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(cpu) = self.online_cpus().first() else {
            return Ok(());
        };
        log::debug!("cpufreq: suspending cpu {}", cpu);
        let Some(policy) = self.cpu_get(cpu) else {
            return Ok(());
        };
        let driver = self.driver()?;
        driver.suspend(&policy).map_err(|err| {
            log::error!("cpufreq: suspend failed in ->suspend step on CPU {}", policy.owning_cpu());
            CpuFreqError::from(err)
        })
    }

    /// Restore the driver after system resume
    pub fn resume(&self) -> CpuFreqResult<()> {
        if !self.suspended.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(cpu) = self.online_cpus().first() else {
            return Ok(());
        };
        log::debug!("cpufreq: resuming cpu {}", cpu);
        let Some(policy) = self.cpu_get(cpu) else {
            return Ok(());
        };
        let driver = self.driver()?;
        if let Err(err) = driver.resume(&policy) {
            log::error!("cpufreq: resume failed in ->resume step on CPU {}", policy.owning_cpu());
            return Err(err.into());
        }
        self.updates.schedule(policy.owning_cpu());
        Ok(())
    }
}

impl fmt::Debug for CpuFreq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuFreq")
            .field("config", &self.config)
            .field("online", &self.online_cpus())
            .field("registry", &self.registry)
            .field("governors", &self.governors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cpufreq, FakeDriver};

    #[test]
    fn test_register_driver_twice() {
        let cpufreq = cpufreq(&[0]);
        cpufreq.register_driver(Arc::new(FakeDriver::new())).unwrap();
        assert_eq!(
            cpufreq.register_driver(Arc::new(FakeDriver::new())),
            Err(CpuFreqError::AlreadyRegistered)
        );
    }

    #[test]
    fn test_register_driver_without_usable_cpu() {
        let cpufreq = cpufreq(&[0, 1]);
        let driver = Arc::new(FakeDriver::new().failing_init());
        assert_eq!(
            cpufreq.register_driver(driver),
            Err(CpuFreqError::DriverRejected(DriverError::NoDevice))
        );
        assert!(cpufreq.registry().driver().is_none());

        let sticky = Arc::new(FakeDriver::new().failing_init().sticky());
        cpufreq.register_driver(sticky).unwrap();
        assert!(cpufreq.registry().driver().is_some());
        assert!(cpufreq.cpu_get(0).is_none());
    }

    #[test]
    fn test_unregister_driver() {
        let cpufreq = cpufreq(&[0, 1, 2]);
        let driver: Arc<dyn CpuFreqDriver> = Arc::new(FakeDriver::new().with_domain(&[0, 1]));
        cpufreq.register_driver(driver.clone()).unwrap();

        let other: Arc<dyn CpuFreqDriver> = Arc::new(FakeDriver::new());
        assert_eq!(cpufreq.unregister_driver(&other), Err(CpuFreqError::NotCurrentDriver));

        cpufreq.unregister_driver(&driver).unwrap();
        assert!(cpufreq.registry().bound_cpus().is_empty());
        assert!(cpufreq.registry().driver().is_none());
        assert!(cpufreq.links().lock().is_empty());
    }

    #[test]
    fn test_disabled_core() {
        let cpufreq = cpufreq(&[0]);
        cpufreq.disable();
        assert_eq!(
            cpufreq.register_driver(Arc::new(FakeDriver::new())),
            Err(CpuFreqError::NoDriver)
        );
        assert_eq!(
            cpufreq.register_governor(Arc::new(Performance)),
            Err(CpuFreqError::NoDriver)
        );
    }

    #[test]
    fn test_setpolicy_driver_gets_const_loops() {
        let cpufreq = cpufreq(&[0]);
        cpufreq.register_driver(Arc::new(FakeDriver::new().setpolicy())).unwrap();
        assert!(cpufreq.driver().unwrap().const_loops());
    }

    #[test]
    fn test_targeting_unchanged_frequency_skips_driver() {
        let cpufreq = cpufreq(&[0]);
        let driver = Arc::new(FakeDriver::new());
        cpufreq.register_driver(driver.clone()).unwrap();
        let calls = driver.target_calls();

        cpufreq.driver_target(0, 2_000_000, Relation::High).unwrap();
        assert_eq!(driver.target_calls(), calls);
        cpufreq.driver_target(0, 1_000_000, Relation::Low).unwrap();
        assert_eq!(driver.target_calls(), calls + 1);
        assert_eq!(cpufreq.quick_get(0), 1_000_000);
    }

    #[test]
    fn test_suspend_resume_once_per_cycle() {
        let cpufreq = cpufreq(&[1, 3]);
        let driver = Arc::new(FakeDriver::new());
        cpufreq.register_driver(driver.clone()).unwrap();

        cpufreq.suspend().unwrap();
        cpufreq.suspend().unwrap();
        assert_eq!(driver.suspend_calls(), [1]);

        cpufreq.resume().unwrap();
        cpufreq.resume().unwrap();
        assert_eq!(driver.resume_calls(), [1]);
        assert_eq!(cpufreq.updates().pending(), CpuMask::of(1));
    }

    #[test]
    fn test_utilization() {
        let cpufreq = cpufreq(&[0, 1]);
        cpufreq.register_driver(Arc::new(FakeDriver::new().with_domain(&[0, 1]))).unwrap();
        cpufreq.notify_utilization(1, 42);
        assert_eq!(cpufreq.quick_get_util(0), 42);
        assert_eq!(cpufreq.quick_get_util(5), 0);
    }

    #[test]
    fn test_getavg() {
        let cpufreq = cpufreq(&[0]);
        cpufreq.register_driver(Arc::new(FakeDriver::new())).unwrap();
        assert_eq!(cpufreq.driver_getavg(0), 2_000_000);
        assert_eq!(cpufreq.driver_getavg(4), 0);
    }
}
