//! # Platform Driver Interface
//!
//! The capability object through which the core programs scaling hardware.
//! A driver either accepts frequency targets from a governor
//! ([`ScalingMode::Target`]) or picks frequencies itself inside the bounds
//! it is given ([`ScalingMode::SetPolicy`]).

use alloc::sync::Arc;
use core::fmt;
use core::ops::Deref;

use bitflags::bitflags;

use crate::cpufreq::CpuFreq;
use crate::error::DriverError;
use crate::policy::{Policy, PolicyCandidate, PolicyData};

bitflags! {
    /// Driver behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DriverFlags: u16 {
        /// Stay registered even if no CPU could be initialized
        const STICKY      = 1 << 0;
        /// Loop timing does not change with frequency
        const CONST_LOOPS = 1 << 1;
    }
}

/// How a driver chooses frequencies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    /// A governor picks targets, the driver programs them
    Target,
    /// The driver picks frequencies inside the given bounds
    SetPolicy,
}

/// How to round a target frequency to a supported one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Lowest frequency at or above the target
    Low,
    /// Highest frequency at or below the target
    High,
}

/// Platform scaling driver
pub trait CpuFreqDriver: Send + Sync {
    /// Driver name, shown in `scaling_driver`
    fn name(&self) -> &str;

    /// Behaviour flags
    fn flags(&self) -> DriverFlags {
        DriverFlags::empty()
    }

    /// Scaling mode; fixed for the driver's lifetime
    fn mode(&self) -> ScalingMode;

    /// Fill in hardware limits, domain membership and the current frequency
    fn init(&self, policy: &mut PolicyData) -> Result<(), DriverError>;

    /// Release per-policy resources
    fn exit(&self, _policy: &Policy) {}

    /// Pull a candidate inside what the hardware supports
    fn verify(&self, candidate: &mut PolicyCandidate) -> Result<(), DriverError>;

    /// Program a frequency; governor-managed drivers only
    ///
    /// Runs with the domain writer lock held. The driver brackets the change
    /// with [`CpuFreq::notify_transition`] calls.
    fn target(
        &self,
        _cpufreq: &CpuFreq,
        _policy: &Policy,
        _target_freq: u32,
        _relation: Relation,
    ) -> Result<(), DriverError> {
        Err(DriverError::NotSupported)
    }

    /// Apply bounds; driver-managed drivers only
    fn setpolicy(&self, _candidate: &PolicyCandidate) -> Result<(), DriverError> {
        Err(DriverError::NotSupported)
    }

    /// Current hardware frequency in kHz, if the driver can read it
    fn get(&self, _cpu: usize) -> Option<u32> {
        None
    }

    /// Average frequency since the last call
    fn getavg(&self, _policy: &Policy, _cpu: usize) -> Option<u32> {
        None
    }

    /// Firmware-imposed frequency cap
    fn bios_limit(&self, _cpu: usize) -> Option<u32> {
        None
    }

    /// Called once before system suspend
    fn suspend(&self, _policy: &Policy) -> Result<(), DriverError> {
        Ok(())
    }

    /// Called once after system resume
    fn resume(&self, _policy: &Policy) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Registered driver with its effective flags
#[derive(Clone)]
pub struct DriverHandle {
    driver: Arc<dyn CpuFreqDriver>,
    flags: DriverFlags,
}

impl DriverHandle {
    /// Wrap a driver; driver-managed drivers always get `CONST_LOOPS`
    pub fn new(driver: Arc<dyn CpuFreqDriver>) -> Self {
        let mut flags = driver.flags();
        if driver.mode() == ScalingMode::SetPolicy {
            flags |= DriverFlags::CONST_LOOPS;
        }
        Self { driver, flags }
    }

    /// Effective flags
    pub fn flags(&self) -> DriverFlags {
        self.flags
    }

    /// Whether loop timing is frequency independent
    pub fn const_loops(&self) -> bool {
        self.flags.contains(DriverFlags::CONST_LOOPS)
    }

    /// Whether this wraps `driver`
    pub fn is(&self, driver: &Arc<dyn CpuFreqDriver>) -> bool {
        Arc::as_ptr(&self.driver) as *const () == Arc::as_ptr(driver) as *const ()
    }
}

impl Deref for DriverHandle {
    type Target = dyn CpuFreqDriver;

    fn deref(&self) -> &Self::Target {
        &*self.driver
    }
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHandle")
            .field("name", &self.driver.name())
            .field("flags", &self.flags)
            .finish()
    }
}
