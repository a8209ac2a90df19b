//! # Attribute Surface
//!
//! Text view of policy fields for user tooling. Every value is rendered the
//! way tooling expects to read it back: one line, newline terminated.
//!
//! | Attribute | Access | Value |
//! |-----------|--------|-------|
//! | `cpuinfo_{min,max}_freq` | ro | hardware limits |
//! | `cpuinfo_cur_freq` | ro | live driver query |
//! | `scaling_{min,max}_freq` | rw | requested bounds |
//! | `scaling_cur_freq` | ro | last applied frequency |
//! | `scaling_governor` | rw | governor or driver policy |
//! | `scaling_setspeed` | rw | governor-defined |
//! | `affected_cpus`, `related_cpus` | ro | CPU lists |
//!
//! Handlers take an internal reference, so they never hold up node teardown,
//! and then the lock of the owning CPU.

use alloc::format;
use alloc::string::String;

use crate::cpufreq::CpuFreq;
use crate::cpumask::CpuMask;
use crate::driver::ScalingMode;
use crate::error::{CpuFreqError, CpuFreqResult};
use crate::policy::{PolicyCandidate, RefKind};

/// Policy field exposed to tooling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Hardware minimum
    CpuinfoMinFreq,
    /// Hardware maximum
    CpuinfoMaxFreq,
    /// Hardware transition latency in ns
    CpuinfoTransitionLatency,
    /// Frequency read back from the driver
    CpuinfoCurFreq,
    /// Requested minimum
    ScalingMinFreq,
    /// Requested maximum
    ScalingMaxFreq,
    /// Last applied frequency
    ScalingCurFreq,
    /// Governor or driver policy
    ScalingGovernor,
    /// Governors that can be written to `scaling_governor`
    ScalingAvailableGovernors,
    /// Driver name
    ScalingDriver,
    /// Governor-defined speed
    ScalingSetspeed,
    /// Online CPUs of the policy
    AffectedCpus,
    /// Every CPU of the domain
    RelatedCpus,
    /// Last reported load
    CpuUtilization,
    /// Firmware frequency cap
    BiosLimit,
    /// User minimum
    PolicyMinFreq,
    /// User maximum
    PolicyMaxFreq,
}

impl Attribute {
    /// Every attribute, in node order
    pub const ALL: [Attribute; 17] = [
        Self::CpuinfoMinFreq,
        Self::CpuinfoMaxFreq,
        Self::CpuinfoTransitionLatency,
        Self::CpuinfoCurFreq,
        Self::ScalingMinFreq,
        Self::ScalingMaxFreq,
        Self::ScalingCurFreq,
        Self::ScalingGovernor,
        Self::ScalingAvailableGovernors,
        Self::ScalingDriver,
        Self::ScalingSetspeed,
        Self::AffectedCpus,
        Self::RelatedCpus,
        Self::CpuUtilization,
        Self::BiosLimit,
        Self::PolicyMinFreq,
        Self::PolicyMaxFreq,
    ];

    /// File name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CpuinfoMinFreq => "cpuinfo_min_freq",
            Self::CpuinfoMaxFreq => "cpuinfo_max_freq",
            Self::CpuinfoTransitionLatency => "cpuinfo_transition_latency",
            Self::CpuinfoCurFreq => "cpuinfo_cur_freq",
            Self::ScalingMinFreq => "scaling_min_freq",
            Self::ScalingMaxFreq => "scaling_max_freq",
            Self::ScalingCurFreq => "scaling_cur_freq",
            Self::ScalingGovernor => "scaling_governor",
            Self::ScalingAvailableGovernors => "scaling_available_governors",
            Self::ScalingDriver => "scaling_driver",
            Self::ScalingSetspeed => "scaling_setspeed",
            Self::AffectedCpus => "affected_cpus",
            Self::RelatedCpus => "related_cpus",
            Self::CpuUtilization => "cpu_utilization",
            Self::BiosLimit => "bios_limit",
            Self::PolicyMinFreq => "policy_min_freq",
            Self::PolicyMaxFreq => "policy_max_freq",
        }
    }

    /// Look an attribute up by file name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|attr| attr.name() == name)
    }

    /// Whether the attribute accepts writes
    pub const fn is_writable(&self) -> bool {
        matches!(
            self,
            Self::ScalingMinFreq | Self::ScalingMaxFreq | Self::ScalingGovernor | Self::ScalingSetspeed
        )
    }
}

/// Receiver of attribute-surface events
///
/// Implemented by whatever publishes the attributes (a pseudo filesystem,
/// a debug console). Calls arrive with domain locks held and must not call
/// back into the core.
pub trait AttributeSink: Send + Sync {
    /// A readable value changed
    fn attribute_changed(&self, _cpu: usize, _attr: Attribute) {}

    /// A policy node appeared under `cpu`
    fn node_published(&self, _cpu: usize) {}

    /// The policy node under `cpu` was torn down
    fn node_removed(&self, _cpu: usize) {}

    /// `cpu` now points at the node of `target`
    fn link_created(&self, _cpu: usize, _target: usize) {}

    /// The link of `cpu` was removed
    fn link_removed(&self, _cpu: usize) {}
}

fn show_cpus(mask: CpuMask) -> String {
    format!("{}\n", mask)
}

fn parse_freq(value: &str) -> CpuFreqResult<u32> {
    value.trim().parse().map_err(|_| CpuFreqError::InvalidArgument)
}

impl CpuFreq {
    /// Render `attr` of `cpu`'s policy
    pub fn show(&self, cpu: usize, attr: Attribute) -> CpuFreqResult<String> {
        let policy = self.registry().lookup(cpu, RefKind::Internal)?;
        let driver = self.driver()?;
        let _guard = self.read_lock(cpu)?;
        let data = policy.snapshot();

        let text = match attr {
            Attribute::CpuinfoMinFreq => format!("{}\n", data.cpuinfo.min_freq),
            Attribute::CpuinfoMaxFreq => format!("{}\n", data.cpuinfo.max_freq),
            Attribute::CpuinfoTransitionLatency => {
                format!("{}\n", data.cpuinfo.transition_latency)
            }
            Attribute::CpuinfoCurFreq => match self.get_locked(data.cpu) {
                0 => String::from("<unknown>\n"),
                freq => format!("{}\n", freq),
            },
            Attribute::ScalingMinFreq => format!("{}\n", data.min),
            Attribute::ScalingMaxFreq => format!("{}\n", data.max),
            Attribute::ScalingCurFreq => {
                let live = match driver.mode() {
                    ScalingMode::SetPolicy => driver.get(data.cpu),
                    ScalingMode::Target => None,
                };
                format!("{}\n", live.unwrap_or(data.cur))
            }
            Attribute::ScalingGovernor => {
                let name = data.governor_name().ok_or(CpuFreqError::InvalidArgument)?;
                format!("{}\n", name)
            }
            Attribute::ScalingAvailableGovernors => match driver.mode() {
                ScalingMode::SetPolicy => String::from("performance powersave\n"),
                ScalingMode::Target => {
                    let mut text = String::new();
                    for name in self.governors().names() {
                        text.push_str(&name);
                        text.push(' ');
                    }
                    text.push('\n');
                    text
                }
            },
            Attribute::ScalingDriver => format!("{}\n", driver.name()),
            Attribute::ScalingSetspeed => {
                match data.governor.as_ref().and_then(|g| g.show_setspeed(&policy)) {
                    Some(speed) => format!("{}\n", speed),
                    None => String::from("<unsupported>\n"),
                }
            }
            Attribute::AffectedCpus => show_cpus(data.cpus),
            Attribute::RelatedCpus => {
                if data.related_cpus.is_empty() {
                    show_cpus(data.cpus)
                } else {
                    show_cpus(data.related_cpus)
                }
            }
            Attribute::CpuUtilization => format!("{}\n", data.util),
            Attribute::BiosLimit => {
                let limit = driver.bios_limit(data.cpu).unwrap_or(data.cpuinfo.max_freq);
                format!("{}\n", limit)
            }
            Attribute::PolicyMinFreq => format!("{}\n", data.user.min),
            Attribute::PolicyMaxFreq => format!("{}\n", data.user.max),
        };
        Ok(text)
    }

    /// Write `value` to `attr` of `cpu`'s policy
    pub fn store(&self, cpu: usize, attr: Attribute, value: &str) -> CpuFreqResult<()> {
        if !attr.is_writable() {
            return Err(CpuFreqError::InvalidArgument);
        }
        let policy = self.registry().lookup(cpu, RefKind::Internal)?;
        let driver = self.driver()?;
        let _guard = self.write_lock(cpu)?;
        log::debug!("cpufreq: store {} = {:?} on CPU {}", attr.name(), value, cpu);

        match attr {
            Attribute::ScalingMinFreq | Attribute::ScalingMaxFreq => {
                let freq = parse_freq(value)?;
                self.store_bound(&driver, &policy, attr, freq)
            }
            Attribute::ScalingGovernor => {
                let name = value.split_whitespace().next().ok_or(CpuFreqError::InvalidArgument)?;
                let (kind, governor) = self.parse_governor(name)?;
                let mut candidate = PolicyCandidate::from(&policy.snapshot());
                candidate.policy = kind;
                candidate.governor = governor;

                let ret = self.set_policy_locked(&driver, &policy, candidate);
                policy.update(|d| {
                    d.user.policy = d.policy;
                    d.user.governor = d.governor.clone();
                });
                ret
            }
            _ => {
                let freq = parse_freq(value)?;
                let governor = policy.governor().ok_or(CpuFreqError::InvalidArgument)?;
                governor.store_setspeed(self, &policy, freq)
            }
        }
    }
}
