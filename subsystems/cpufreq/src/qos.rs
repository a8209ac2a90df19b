//! # Frequency QoS
//!
//! System-wide frequency floor and ceiling built from independent requests.
//! The floor is the largest minimum request, the ceiling the smallest
//! maximum request. Whenever either aggregate moves, every online policy is
//! re-evaluated so its enforced bounds follow.

use alloc::collections::BTreeMap;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::cpufreq::CpuFreq;
use crate::error::{CpuFreqError, CpuFreqResult};

/// Floor when no minimum request exists
pub const QOS_MIN_DEFAULT: u32 = 0;
/// Ceiling when no maximum request exists
pub const QOS_MAX_DEFAULT: u32 = u32::MAX;

/// QoS constraint class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QosClass {
    /// Frequency floor
    CpuFreqMin,
    /// Frequency ceiling
    CpuFreqMax,
}

/// Handle of an active request
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct QosRequest {
    id: u64,
    class: QosClass,
}

impl QosRequest {
    /// Class of the request
    pub fn class(&self) -> QosClass {
        self.class
    }
}

#[derive(Debug, Default)]
struct QosState {
    min: BTreeMap<u64, u32>,
    max: BTreeMap<u64, u32>,
}

impl QosState {
    fn requests(&mut self, class: QosClass) -> &mut BTreeMap<u64, u32> {
        match class {
            QosClass::CpuFreqMin => &mut self.min,
            QosClass::CpuFreqMax => &mut self.max,
        }
    }

    fn target(&self, class: QosClass) -> u32 {
        match class {
            QosClass::CpuFreqMin => self.min.values().copied().max().unwrap_or(QOS_MIN_DEFAULT),
            QosClass::CpuFreqMax => self.max.values().copied().min().unwrap_or(QOS_MAX_DEFAULT),
        }
    }
}

/// Aggregated frequency constraints
pub struct PmQos {
    state: Mutex<QosState>,
    next_id: AtomicU64,
}

impl PmQos {
    /// No constraints
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QosState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Current aggregate of `class`
    pub fn target(&self, class: QosClass) -> u32 {
        self.state.lock().target(class)
    }

    /// Add a request; returns the handle and whether the aggregate moved
    pub fn add_request(&self, class: QosClass, value: u32) -> (QosRequest, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let changed = self.modify(class, |requests| {
            requests.insert(id, value);
        });
        (QosRequest { id, class }, changed)
    }

    /// Change a request; returns whether the aggregate moved
    pub fn update_request(&self, request: &QosRequest, value: u32) -> CpuFreqResult<bool> {
        let mut found = false;
        let changed = self.modify(request.class, |requests| {
            if let Some(slot) = requests.get_mut(&request.id) {
                *slot = value;
                found = true;
            }
        });
        found.then_some(changed).ok_or(CpuFreqError::NotFound)
    }

    /// Drop a request; returns whether the aggregate moved
    pub fn remove_request(&self, request: QosRequest) -> CpuFreqResult<bool> {
        let mut found = false;
        let changed = self.modify(request.class, |requests| {
            found = requests.remove(&request.id).is_some();
        });
        found.then_some(changed).ok_or(CpuFreqError::NotFound)
    }

    fn modify(&self, class: QosClass, f: impl FnOnce(&mut BTreeMap<u64, u32>)) -> bool {
        let mut state = self.state.lock();
        let before = state.target(class);
        f(state.requests(class));
        state.target(class) != before
    }
}

impl Default for PmQos {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PmQos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PmQos")
            .field("min", &self.target(QosClass::CpuFreqMin))
            .field("max", &self.target(QosClass::CpuFreqMax))
            .finish()
    }
}

// =============================================================================
// Core Integration
// =============================================================================

impl CpuFreq {
    /// Add a frequency constraint
    pub fn qos_add_request(&self, class: QosClass, value: u32) -> QosRequest {
        let (request, changed) = self.qos().add_request(class, value);
        if changed {
            self.qos_changed(class);
        }
        request
    }

    /// Change a frequency constraint
    pub fn qos_update_request(&self, request: &QosRequest, value: u32) -> CpuFreqResult<()> {
        if self.qos().update_request(request, value)? {
            self.qos_changed(request.class());
        }
        Ok(())
    }

    /// Remove a frequency constraint
    pub fn qos_remove_request(&self, request: QosRequest) -> CpuFreqResult<()> {
        let class = request.class();
        if self.qos().remove_request(request)? {
            self.qos_changed(class);
        }
        Ok(())
    }

    fn qos_changed(&self, class: QosClass) {
        log::debug!(
            "cpufreq: QoS {:?} now {} kHz",
            class,
            self.qos().target(class)
        );
        for cpu in self.online_cpus() {
            if self.cpu_get(cpu).is_none() {
                continue;
            }
            if let Err(err) = self.update_policy(cpu) {
                log::debug!("cpufreq: QoS update of CPU {} failed: {}", cpu, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    use crate::policy::Bounds;
    use crate::testing::{cpufreq, FakeDriver};

    #[test]
    fn test_aggregates() {
        let qos = PmQos::new();
        assert_eq!(qos.target(QosClass::CpuFreqMax), QOS_MAX_DEFAULT);

        let (a, changed) = qos.add_request(QosClass::CpuFreqMin, 500_000);
        assert!(changed);
        let (b, changed) = qos.add_request(QosClass::CpuFreqMin, 400_000);
        assert!(!changed);
        assert_eq!(qos.target(QosClass::CpuFreqMin), 500_000);

        assert!(qos.remove_request(a).unwrap());
        assert_eq!(qos.target(QosClass::CpuFreqMin), 400_000);
        assert!(qos.update_request(&b, 100_000).unwrap());
        assert_eq!(qos.target(QosClass::CpuFreqMin), 100_000);
    }

    #[test]
    fn test_ceiling_reclamps_online_policies() {
        let cpufreq = cpufreq(&[0, 1]);
        cpufreq.register_driver(Arc::new(FakeDriver::new())).unwrap();
        assert_eq!(cpufreq.quick_get(1), 2_000_000);

        let request = cpufreq.qos_add_request(QosClass::CpuFreqMax, 1_500_000);
        for cpu in [0, 1] {
            let policy = cpufreq.cpu_get(cpu).unwrap();
            assert_eq!(policy.effective(), Bounds::new(300_000, 1_500_000));
            // visible bounds keep the request
            assert_eq!(policy.bounds(), Bounds::new(300_000, 2_000_000));
            assert_eq!(policy.cur(), 1_500_000);
        }

        cpufreq.qos_remove_request(request).unwrap();
        assert_eq!(cpufreq.quick_get_max(0), 2_000_000);
        assert_eq!(cpufreq.quick_get(0), 2_000_000);
    }
}
