//! # Policy Registry
//!
//! The driver slot and the CPU → policy map, behind one short spinlock.
//! Nothing here blocks or calls out of the core, so lookups are safe from
//! any context.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::cpumask::{CpuMask, MAX_CPUS};
use crate::driver::{CpuFreqDriver, DriverHandle};
use crate::error::{CpuFreqError, CpuFreqResult};
use crate::policy::{Policy, PolicyData, PolicyRef, RefKind};

struct RegistryInner {
    driver: Option<DriverHandle>,
    policies: [Option<Arc<Policy>>; MAX_CPUS],
}

/// Driver slot and CPU → policy map
pub struct PolicyRegistry {
    inner: Mutex<RegistryInner>,
    disabled: AtomicBool,
}

impl PolicyRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                driver: None,
                policies: [const { None }; MAX_CPUS],
            }),
            disabled: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Driver Slot
    // =========================================================================

    /// Registered driver
    pub fn driver(&self) -> Option<DriverHandle> {
        self.inner.lock().driver.clone()
    }

    pub(crate) fn install_driver(&self, driver: DriverHandle) -> CpuFreqResult<()> {
        let mut inner = self.inner.lock();
        if inner.driver.is_some() {
            return Err(CpuFreqError::AlreadyRegistered);
        }
        inner.driver = Some(driver);
        Ok(())
    }

    pub(crate) fn remove_driver(&self, driver: &Arc<dyn CpuFreqDriver>) -> CpuFreqResult<DriverHandle> {
        let mut inner = self.inner.lock();
        match inner.driver.take() {
            Some(current) if current.is(driver) => Ok(current),
            other => {
                inner.driver = other;
                Err(CpuFreqError::NotCurrentDriver)
            }
        }
    }

    /// Turn the core off; lookups find nothing afterwards
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    /// Whether the core has been disabled
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    // =========================================================================
    // CPU Map
    // =========================================================================

    /// Take a reference on the policy of `cpu`
    pub fn lookup(&self, cpu: usize, kind: RefKind) -> CpuFreqResult<PolicyRef> {
        if cpu >= MAX_CPUS {
            return Err(CpuFreqError::InvalidArgument);
        }
        if self.is_disabled() {
            return Err(CpuFreqError::NoDriver);
        }
        let inner = self.inner.lock();
        if inner.driver.is_none() {
            return Err(CpuFreqError::NoDriver);
        }
        let policy = inner.policies[cpu].clone().ok_or(CpuFreqError::NotFound)?;
        PolicyRef::acquire(policy, kind).ok_or(CpuFreqError::NotFound)
    }

    /// Policy of `cpu` without taking a reference
    pub(crate) fn peek(&self, cpu: usize) -> Option<Arc<Policy>> {
        self.inner.lock().policies.get(cpu)?.clone()
    }

    pub(crate) fn bind(&self, cpus: CpuMask, policy: &Arc<Policy>) {
        let mut inner = self.inner.lock();
        for cpu in cpus {
            inner.policies[cpu] = Some(policy.clone());
        }
    }

    pub(crate) fn unbind(&self, cpu: usize) -> Option<Arc<Policy>> {
        self.inner.lock().policies.get_mut(cpu)?.take()
    }

    /// Unbind the CPUs of `cpus` that still map to `policy`
    pub(crate) fn unbind_from(&self, cpus: CpuMask, policy: &Arc<Policy>) {
        let mut inner = self.inner.lock();
        for cpu in cpus {
            let slot = &mut inner.policies[cpu];
            if slot.as_ref().is_some_and(|p| Arc::ptr_eq(p, policy)) {
                *slot = None;
            }
        }
    }

    /// Update `policy` and bind `cpu` to it in one step
    pub(crate) fn join(&self, cpu: usize, policy: &Arc<Policy>, f: impl FnOnce(&mut PolicyData)) {
        let mut inner = self.inner.lock();
        policy.update(f);
        if let Some(slot) = inner.policies.get_mut(cpu) {
            *slot = Some(policy.clone());
        }
    }

    /// CPUs currently mapped to a policy
    pub fn bound_cpus(&self) -> CpuMask {
        let inner = self.inner.lock();
        let mut mask = CpuMask::empty();
        for (cpu, slot) in inner.policies.iter().enumerate() {
            if slot.is_some() {
                mask.set(cpu);
            }
        }
        mask
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("driver", &self.driver())
            .field("bound", &self.bound_cpus())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDriver;

    fn registry_with_driver() -> (PolicyRegistry, Arc<dyn CpuFreqDriver>) {
        let registry = PolicyRegistry::new();
        let driver: Arc<dyn CpuFreqDriver> = Arc::new(FakeDriver::new());
        registry.install_driver(DriverHandle::new(driver.clone())).unwrap();
        (registry, driver)
    }

    #[test]
    fn test_lookup_requires_driver() {
        let registry = PolicyRegistry::new();
        let policy = Policy::new(PolicyData::new(0));
        registry.bind(CpuMask::of(0), &policy);
        assert_eq!(registry.lookup(0, RefKind::Internal).unwrap_err(), CpuFreqError::NoDriver);
    }

    #[test]
    fn test_shared_policy_lookup() {
        let (registry, _driver) = registry_with_driver();
        let policy = Policy::new(PolicyData::new(0));
        registry.bind(CpuMask::from_cpus(&[0, 1]), &policy);

        let a = registry.lookup(0, RefKind::External).unwrap();
        let b = registry.lookup(1, RefKind::Internal).unwrap();
        assert!(PolicyRef::same(&a, &b));
        assert_eq!(policy.refcount(), 2);
        assert_eq!(registry.lookup(2, RefKind::Internal).unwrap_err(), CpuFreqError::NotFound);

        registry.disable();
        assert_eq!(registry.lookup(0, RefKind::Internal).unwrap_err(), CpuFreqError::NoDriver);
    }

    #[test]
    fn test_unbind_from_keeps_other_policies() {
        let (registry, _driver) = registry_with_driver();
        let p0 = Policy::new(PolicyData::new(0));
        let p2 = Policy::new(PolicyData::new(2));
        registry.bind(CpuMask::from_cpus(&[0, 1]), &p0);
        registry.bind(CpuMask::of(2), &p2);

        registry.unbind_from(CpuMask::from_cpus(&[1, 2]), &p0);
        assert_eq!(registry.bound_cpus(), CpuMask::from_cpus(&[0, 2]));
    }

    #[test]
    fn test_remove_other_driver_rejected() {
        let (registry, driver) = registry_with_driver();
        let other: Arc<dyn CpuFreqDriver> = Arc::new(FakeDriver::new());
        assert_eq!(
            registry.remove_driver(&other).unwrap_err(),
            CpuFreqError::NotCurrentDriver
        );
        assert!(registry.driver().is_some());
        assert!(registry.remove_driver(&driver).is_ok());
        assert!(registry.driver().is_none());
    }
}
