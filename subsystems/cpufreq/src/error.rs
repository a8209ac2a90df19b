//! # Error Types
//!
//! Errors surfaced by the frequency scaling core and by platform drivers.
//!
//! | Error | Raised by | Recoverable |
//! |-------|-----------|-------------|
//! | `InvalidArgument` | malformed request, read-only attribute | yes |
//! | `NoDriver` | no driver registered, core disabled | yes |
//! | `StaleCpu` | CPU went offline while resolving its lock | yes |
//! | `BoundsConflict` | clamped bounds outside the user bounds | yes |
//! | `IncompatibleGovernor` | latency too high, no fallback governor | yes |
//! | `DriverRejected` | platform `init`/`verify`/`target` failed | yes |
//! | `Busy` | governor name clash, domain lock lost during merge | yes |
//! | `NotFound` | lookup on an unmapped CPU | yes |

use core::fmt;

// =============================================================================
// Driver Errors
// =============================================================================

/// Failure reported by a platform driver callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverError {
    /// Requested range cannot be programmed
    InvalidRange,
    /// Callback is not implemented by this driver
    NotSupported,
    /// Hardware did not respond as expected
    HardwareFault,
    /// No scaling hardware behind this CPU
    NoDevice,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRange => write!(f, "invalid frequency range"),
            Self::NotSupported => write!(f, "operation not supported by driver"),
            Self::HardwareFault => write!(f, "hardware fault"),
            Self::NoDevice => write!(f, "no scaling device"),
        }
    }
}

// =============================================================================
// Core Errors
// =============================================================================

/// Frequency scaling core error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuFreqError {
    /// Malformed request
    InvalidArgument,
    /// No platform driver registered, or the core is disabled
    NoDriver,
    /// Target CPU went offline mid-operation
    StaleCpu,
    /// Requested bounds violate the current user bounds
    BoundsConflict,
    /// Governor latency requirement unmet and no fallback configured
    IncompatibleGovernor,
    /// Platform driver returned a failure
    DriverRejected(DriverError),
    /// Resource is in use
    Busy,
    /// CPU or governor not found
    NotFound,
    /// A platform driver is already registered
    AlreadyRegistered,
    /// Driver is not the registered one
    NotCurrentDriver,
}

impl CpuFreqError {
    /// Whether the error means "no longer applicable" rather than a fault
    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::StaleCpu | Self::NotFound)
    }
}

impl From<DriverError> for CpuFreqError {
    fn from(err: DriverError) -> Self {
        Self::DriverRejected(err)
    }
}

impl fmt::Display for CpuFreqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NoDriver => write!(f, "no cpufreq driver registered"),
            Self::StaleCpu => write!(f, "CPU went offline"),
            Self::BoundsConflict => write!(f, "bounds conflict with user policy"),
            Self::IncompatibleGovernor => write!(f, "governor incompatible with hardware latency"),
            Self::DriverRejected(e) => write!(f, "driver rejected request: {}", e),
            Self::Busy => write!(f, "resource busy"),
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyRegistered => write!(f, "driver already registered"),
            Self::NotCurrentDriver => write!(f, "not the registered driver"),
        }
    }
}

/// Result type for frequency scaling operations
pub type CpuFreqResult<T> = Result<T, CpuFreqError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_driver_error_wraps() {
        let err: CpuFreqError = DriverError::HardwareFault.into();
        assert_eq!(err, CpuFreqError::DriverRejected(DriverError::HardwareFault));
        assert_eq!(err.to_string(), "driver rejected request: hardware fault");
    }

    #[test]
    fn test_stale_classification() {
        assert!(CpuFreqError::StaleCpu.is_stale());
        assert!(CpuFreqError::NotFound.is_stale());
        assert!(!CpuFreqError::Busy.is_stale());
    }
}
