//! Test fixtures: a scriptable platform driver, governors and observers.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::attr::{Attribute, AttributeSink};
use crate::config::CpuFreqConfig;
use crate::cpufreq::CpuFreq;
use crate::cpumask::{CpuMask, MAX_CPUS};
use crate::driver::{CpuFreqDriver, DriverFlags, Relation, ScalingMode};
use crate::error::{CpuFreqError, CpuFreqResult, DriverError};
use crate::governor::{Governor, GovernorEvent};
use crate::notifier::TransitionObserver;
use crate::policy::{CpuInfo, Policy, PolicyCandidate, PolicyData};
use crate::transition::{FreqTransition, TransitionPhase};

/// Core with the given CPUs online
pub fn cpufreq(online: &[usize]) -> CpuFreq {
    cpufreq_with(CpuFreqConfig::default(), online)
}

/// Core with `config` and the given CPUs online
pub fn cpufreq_with(config: CpuFreqConfig, online: &[usize]) -> CpuFreq {
    let cpufreq = CpuFreq::new(config);
    for &cpu in online {
        cpufreq.set_cpu_online(cpu, true);
    }
    cpufreq
}

// =============================================================================
// Fake Driver
// =============================================================================

/// Driver over simulated hardware: 300..2000 MHz, every CPU at 2000 MHz
pub struct FakeDriver {
    domains: Vec<CpuMask>,
    latency: u32,
    readable: bool,
    flags: DriverFlags,
    mode: ScalingMode,
    hw: [AtomicU64; MAX_CPUS],
    fail_init: AtomicBool,
    fail_verify: AtomicBool,
    init_calls: AtomicUsize,
    exit_calls: AtomicUsize,
    target_calls: AtomicUsize,
    suspends: Mutex<Vec<usize>>,
    resumes: Mutex<Vec<usize>>,
}

impl FakeDriver {
    pub const MIN: u32 = 300_000;
    pub const MAX: u32 = 2_000_000;

    pub fn new() -> Self {
        Self {
            domains: Vec::new(),
            latency: 0,
            readable: false,
            flags: DriverFlags::empty(),
            mode: ScalingMode::Target,
            hw: core::array::from_fn(|_| AtomicU64::new(u64::from(Self::MAX))),
            fail_init: AtomicBool::new(false),
            fail_verify: AtomicBool::new(false),
            init_calls: AtomicUsize::new(0),
            exit_calls: AtomicUsize::new(0),
            target_calls: AtomicUsize::new(0),
            suspends: Mutex::new(Vec::new()),
            resumes: Mutex::new(Vec::new()),
        }
    }

    /// CPUs sharing one clock
    pub fn with_domain(mut self, cpus: &[usize]) -> Self {
        self.domains.push(CpuMask::from_cpus(cpus));
        self
    }

    pub fn with_latency(mut self, ns: u32) -> Self {
        self.latency = ns;
        self
    }

    /// Let the core read the hardware frequency back
    pub fn with_get(mut self) -> Self {
        self.readable = true;
        self
    }

    pub fn failing_init(self) -> Self {
        self.fail_init.store(true, Ordering::SeqCst);
        self
    }

    pub fn sticky(mut self) -> Self {
        self.flags |= DriverFlags::STICKY;
        self
    }

    /// Driver-managed scaling instead of governors
    pub fn setpolicy(mut self) -> Self {
        self.mode = ScalingMode::SetPolicy;
        self
    }

    pub fn fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    pub fn fail_verify(&self, fail: bool) {
        self.fail_verify.store(fail, Ordering::SeqCst);
    }

    pub fn hw_freq(&self, cpu: usize) -> u32 {
        self.hw[cpu].load(Ordering::SeqCst) as u32
    }

    /// Change the clock behind the core's back
    pub fn set_hw_freq(&self, cpu: usize, freq: u32) {
        self.hw[cpu].store(u64::from(freq), Ordering::SeqCst);
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn exit_calls(&self) -> usize {
        self.exit_calls.load(Ordering::SeqCst)
    }

    pub fn target_calls(&self) -> usize {
        self.target_calls.load(Ordering::SeqCst)
    }

    pub fn suspend_calls(&self) -> Vec<usize> {
        self.suspends.lock().clone()
    }

    pub fn resume_calls(&self) -> Vec<usize> {
        self.resumes.lock().clone()
    }

    fn domain_of(&self, cpu: usize) -> CpuMask {
        self.domains
            .iter()
            .copied()
            .find(|domain| domain.test(cpu))
            .unwrap_or(CpuMask::of(cpu))
    }
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuFreqDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    fn flags(&self) -> DriverFlags {
        self.flags
    }

    fn mode(&self) -> ScalingMode {
        self.mode
    }

    fn init(&self, policy: &mut PolicyData) -> Result<(), DriverError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(DriverError::HardwareFault);
        }
        policy.cpuinfo = CpuInfo::new(Self::MIN, Self::MAX, self.latency);
        policy.cpus = self.domain_of(policy.cpu);
        policy.related_cpus = policy.cpus;
        policy.cur = self.hw_freq(policy.cpu);
        Ok(())
    }

    fn exit(&self, _policy: &Policy) {
        self.exit_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn verify(&self, candidate: &mut PolicyCandidate) -> Result<(), DriverError> {
        if self.fail_verify.load(Ordering::SeqCst) {
            return Err(DriverError::InvalidRange);
        }
        candidate.verify_within_cpu_limits();
        Ok(())
    }

    fn target(
        &self,
        cpufreq: &CpuFreq,
        policy: &Policy,
        target_freq: u32,
        _relation: Relation,
    ) -> Result<(), DriverError> {
        self.target_calls.fetch_add(1, Ordering::SeqCst);
        let cpus = policy.cpus();
        let old = self.hw_freq(policy.owning_cpu());
        let new = target_freq.clamp(Self::MIN, Self::MAX);

        let mut transitions: Vec<FreqTransition> =
            cpus.iter().map(|cpu| FreqTransition::new(cpu, old, new)).collect();
        for freqs in &mut transitions {
            cpufreq.notify_transition(freqs, TransitionPhase::PreChange);
        }
        for cpu in cpus {
            self.set_hw_freq(cpu, new);
        }
        for freqs in &mut transitions {
            cpufreq.notify_transition(freqs, TransitionPhase::PostChange);
        }
        Ok(())
    }

    fn setpolicy(&self, _candidate: &PolicyCandidate) -> Result<(), DriverError> {
        Ok(())
    }

    fn get(&self, cpu: usize) -> Option<u32> {
        self.readable.then(|| self.hw_freq(cpu))
    }

    fn getavg(&self, _policy: &Policy, cpu: usize) -> Option<u32> {
        Some(self.hw_freq(cpu))
    }

    fn suspend(&self, policy: &Policy) -> Result<(), DriverError> {
        self.suspends.lock().push(policy.owning_cpu());
        Ok(())
    }

    fn resume(&self, policy: &Policy) -> Result<(), DriverError> {
        self.resumes.lock().push(policy.owning_cpu());
        Ok(())
    }
}

// =============================================================================
// Governors
// =============================================================================

/// Governor whose START can be made to fail
pub struct FlakyGovernor {
    name: &'static str,
    max_latency: u32,
    fail_start: AtomicBool,
}

impl FlakyGovernor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            max_latency: 0,
            fail_start: AtomicBool::new(false),
        }
    }

    pub fn with_max_latency(mut self, ns: u32) -> Self {
        self.max_latency = ns;
        self
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }
}

impl Governor for FlakyGovernor {
    fn name(&self) -> &str {
        self.name
    }

    fn max_transition_latency(&self) -> u32 {
        self.max_latency
    }

    fn handle(&self, _cpufreq: &CpuFreq, _policy: &Policy, event: GovernorEvent) -> CpuFreqResult<()> {
        if event == GovernorEvent::Start && self.fail_start.load(Ordering::SeqCst) {
            return Err(CpuFreqError::DriverRejected(DriverError::HardwareFault));
        }
        Ok(())
    }
}

// =============================================================================
// Observers
// =============================================================================

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Transition observer that records every phase
pub struct RecordingTransitions {
    events: Mutex<Vec<(u64, TransitionPhase, FreqTransition)>>,
}

impl RecordingTransitions {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    /// Global delivery order of the first recorded event
    pub fn first_seq(&self) -> Option<u64> {
        self.events.lock().first().map(|(seq, _, _)| *seq)
    }

    pub fn events(&self) -> Vec<(TransitionPhase, FreqTransition)> {
        self.events
            .lock()
            .iter()
            .map(|(_, phase, freqs)| (*phase, *freqs))
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TransitionObserver for RecordingTransitions {
    fn on_transition(&self, phase: TransitionPhase, freqs: &FreqTransition) {
        let seq = SEQUENCE.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push((seq, phase, *freqs));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SinkEvent {
    Changed(usize, Attribute),
    Published(usize),
    Removed(usize),
    Linked(usize, usize),
    Unlinked(usize),
}

/// Attribute sink that records every event
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    fn collect<T>(&self, f: impl Fn(&SinkEvent) -> Option<T>) -> Vec<T> {
        self.events.lock().iter().filter_map(f).collect()
    }

    pub fn changed(&self) -> Vec<(usize, Attribute)> {
        self.collect(|e| match e {
            SinkEvent::Changed(cpu, attr) => Some((*cpu, *attr)),
            _ => None,
        })
    }

    pub fn published(&self) -> Vec<usize> {
        self.collect(|e| match e {
            SinkEvent::Published(cpu) => Some(*cpu),
            _ => None,
        })
    }

    pub fn removed(&self) -> Vec<usize> {
        self.collect(|e| match e {
            SinkEvent::Removed(cpu) => Some(*cpu),
            _ => None,
        })
    }

    pub fn links(&self) -> Vec<(usize, usize)> {
        self.collect(|e| match e {
            SinkEvent::Linked(cpu, target) => Some((*cpu, *target)),
            _ => None,
        })
    }

    pub fn unlinked(&self) -> Vec<usize> {
        self.collect(|e| match e {
            SinkEvent::Unlinked(cpu) => Some(*cpu),
            _ => None,
        })
    }
}

impl AttributeSink for RecordingSink {
    fn attribute_changed(&self, cpu: usize, attr: Attribute) {
        self.events.lock().push(SinkEvent::Changed(cpu, attr));
    }

    fn node_published(&self, cpu: usize) {
        self.events.lock().push(SinkEvent::Published(cpu));
    }

    fn node_removed(&self, cpu: usize) {
        self.events.lock().push(SinkEvent::Removed(cpu));
    }

    fn link_created(&self, cpu: usize, target: usize) {
        self.events.lock().push(SinkEvent::Linked(cpu, target));
    }

    fn link_removed(&self, cpu: usize) {
        self.events.lock().push(SinkEvent::Unlinked(cpu));
    }
}
