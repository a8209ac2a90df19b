//! # Helix CPU Frequency Scaling Core
//!
//! Policy core between platform frequency drivers and the governors that
//! pick frequencies.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            CpuFreq                                   │
//! │                                                                      │
//! │  hotplug ──▶ add/remove ──▶ PolicyRegistry ──▶ Arc<Policy> per domain│
//! │                 │                 ▲                   │              │
//! │                 ▼                 │                   ▼              │
//! │         DomainLockTable ── owner ─┘          governor state machine  │
//! │     (reader/writer lock per domain)          STOP / START / LIMITS   │
//! │                                                       │              │
//! │  clients ──▶ set_policy / store ──▶ Policy-Set ───────┘              │
//! │                                     protocol ◀── PmQos floor/ceiling │
//! │                                                                      │
//! │  driver ──▶ notify_transition ──▶ transition observers, cur, loops   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lock Order
//!
//! 1. Domain lock of the owning CPU ([`DomainLockTable`])
//! 2. Registry mutex ([`PolicyRegistry`])
//! 3. Policy data lock
//!
//! Neither the registry mutex nor a policy data lock is held across a call
//! into a driver, governor or observer. Governors run under the domain
//! writer lock and must not take a domain lock themselves.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use helix_cpufreq::{CpuFreqConfig, PolicyRequest};
//!
//! let cpufreq = helix_cpufreq::init(CpuFreqConfig::default());
//! cpufreq.set_cpu_online(0, true);
//! cpufreq.register_driver(Arc::new(AcpiCpufreq::probe()?))?;
//!
//! cpufreq.set_policy(0, PolicyRequest::new(800_000, 1_600_000).with_governor("powersave"))?;
//! ```

#![no_std]

// =============================================================================
// EXTERNAL DEPENDENCIES
// =============================================================================

extern crate alloc;

#[cfg(test)]
extern crate std;

use spin::Once;

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Attribute show/store surface
pub mod attr;

/// Core configuration
pub mod config;

/// The scaling core
pub mod cpufreq;

/// CPU sets
pub mod cpumask;

/// Platform driver interface
pub mod driver;

/// Error types
pub mod error;

/// Governors and their state machine
pub mod governor;

/// Policy creation, merge and removal
pub mod hotplug;

/// Per-domain locks
pub mod lock;

/// Observer channels
pub mod notifier;

/// Policy object and references
pub mod policy;

/// Frequency QoS
pub mod qos;

/// CPU to policy map
pub mod registry;

/// Policy-set protocol
pub mod set_policy;

/// Frequency transitions
pub mod transition;

/// Deferred updates
pub mod work;

#[cfg(test)]
mod testing;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use attr::{Attribute, AttributeSink};
pub use config::CpuFreqConfig;
pub use cpufreq::CpuFreq;
pub use cpumask::{CpuMask, MAX_CPUS};
pub use driver::{CpuFreqDriver, DriverFlags, DriverHandle, Relation, ScalingMode};
pub use error::{CpuFreqError, CpuFreqResult, DriverError};
pub use governor::{Governor, GovernorEvent, GovernorHandle, GovernorState};
pub use hotplug::{HotplugAction, SavedPolicy};
pub use lock::{DomainLockTable, DomainReadGuard, DomainWriteGuard};
pub use notifier::{
    NotifierId, NotifierPriority, PolicyEvent, PolicyObserver, TransitionObserver,
};
pub use policy::{
    Bounds, CpuInfo, Policy, PolicyCandidate, PolicyData, PolicyId, PolicyRef, RefKind,
    ScalingPolicy, UserPolicy,
};
pub use qos::{QosClass, QosRequest};
pub use registry::PolicyRegistry;
pub use set_policy::PolicyRequest;
pub use transition::{cpufreq_scale, FreqTransition, TransitionPhase};

// =============================================================================
// GLOBAL INSTANCE
// =============================================================================

static CPUFREQ: Once<CpuFreq> = Once::new();

/// Initialize the global core; later calls return the existing instance
pub fn init(config: CpuFreqConfig) -> &'static CpuFreq {
    CPUFREQ.call_once(|| {
        log::info!(
            "cpufreq: core initialized, default governor {}",
            config.default_governor
        );
        CpuFreq::new(config)
    })
}

/// The global core, once initialized
pub fn get() -> Option<&'static CpuFreq> {
    CPUFREQ.get()
}
