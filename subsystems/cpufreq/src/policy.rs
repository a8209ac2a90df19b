//! # Policy Object
//!
//! The shared state governing one scaling domain.
//!
//! ```text
//!            ┌───────────────────────────── Policy ─────────────────────┐
//!  CPU 0 ──▶ │ owning_cpu: 0        cpus: {0,1}   related: {0,1,2,3}    │
//!  CPU 1 ──▶ │ cpuinfo: 300..2000 MHz    user: 800..1600   eff: 1000..1600│
//!            │ governor: ondemand (Running)    cur: 1200 MHz             │
//!            │ refcount ── PolicyRef holders    node ── external handle  │
//!            └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`Policy`] lives in an `Arc`; its storage is freed only when the last
//! `Arc` goes away, so a [`PolicyRef`] held by a reader keeps it alive across
//! hotplug removal. The external handle ([`PolicyNode`]) is torn down
//! separately: removal drops the base reference and waits until every
//! external holder has released theirs.

use alloc::sync::Arc;
use core::fmt;
use core::hint;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use spin::RwLock;

use crate::cpumask::CpuMask;
use crate::governor::{GovernorHandle, GovernorState};

// =============================================================================
// Policy Data
// =============================================================================

/// Hardware frequency limits reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuInfo {
    /// Lowest frequency in kHz
    pub min_freq: u32,
    /// Highest frequency in kHz
    pub max_freq: u32,
    /// Transition latency in nanoseconds
    pub transition_latency: u32,
}

impl CpuInfo {
    /// Create hardware limits
    pub const fn new(min_freq: u32, max_freq: u32, transition_latency: u32) -> Self {
        Self {
            min_freq,
            max_freq,
            transition_latency,
        }
    }
}

/// A frequency range in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bounds {
    /// Lower bound
    pub min: u32,
    /// Upper bound
    pub max: u32,
}

impl Bounds {
    /// Create a range
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// Whether `freq` lies in the range
    pub const fn contains(&self, freq: u32) -> bool {
        self.min <= freq && freq <= self.max
    }

    /// Clamp `freq` into the range
    pub fn clamp(&self, freq: u32) -> u32 {
        freq.max(self.min).min(self.max)
    }
}

/// Who picks the frequency inside the bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ScalingPolicy {
    /// A governor picks the frequency
    #[default]
    Governed    = 0,
    /// Driver-managed, biased to the highest frequency
    Performance = 1,
    /// Driver-managed, biased to the lowest frequency
    Powersave   = 2,
}

impl ScalingPolicy {
    /// Attribute name of a driver-managed policy
    pub const fn name(&self) -> Option<&'static str> {
        match self {
            Self::Governed => None,
            Self::Performance => Some("performance"),
            Self::Powersave => Some("powersave"),
        }
    }
}

/// Limits and governor last requested by policy clients
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserPolicy {
    /// Requested minimum
    pub min: u32,
    /// Requested maximum
    pub max: u32,
    /// Requested driver policy
    pub policy: ScalingPolicy,
    /// Requested governor
    pub governor: Option<GovernorHandle>,
}

impl UserPolicy {
    /// Requested range
    pub const fn bounds(&self) -> Bounds {
        Bounds::new(self.min, self.max)
    }
}

/// Mutable state of a policy
#[derive(Debug, Clone)]
pub struct PolicyData {
    /// CPU that created the policy and hosts its node
    pub cpu: usize,
    /// Online CPUs governed by the policy
    pub cpus: CpuMask,
    /// All CPUs of the hardware domain, online or not
    pub related_cpus: CpuMask,
    /// Hardware limits
    pub cpuinfo: CpuInfo,
    /// Visible `scaling_min_freq`, the unclamped request
    pub min: u32,
    /// Visible `scaling_max_freq`, the unclamped request
    pub max: u32,
    /// Bounds currently enforced
    pub effective: Bounds,
    /// Last applied frequency in kHz
    pub cur: u32,
    /// Driver policy for drivers without governors
    pub policy: ScalingPolicy,
    /// Active governor
    pub governor: Option<GovernorHandle>,
    /// Governor lifecycle state
    pub governor_state: GovernorState,
    /// Client request
    pub user: UserPolicy,
    /// Last reported load, advisory
    pub util: u32,
}

impl PolicyData {
    /// Fresh state for a policy created on `cpu`
    pub fn new(cpu: usize) -> Self {
        Self {
            cpu,
            cpus: CpuMask::of(cpu),
            related_cpus: CpuMask::empty(),
            cpuinfo: CpuInfo::default(),
            min: 0,
            max: 0,
            effective: Bounds::default(),
            cur: 0,
            policy: ScalingPolicy::Governed,
            governor: None,
            governor_state: GovernorState::Stopped,
            user: UserPolicy::default(),
            util: 0,
        }
    }

    /// Visible bounds
    pub const fn bounds(&self) -> Bounds {
        Bounds::new(self.min, self.max)
    }

    /// Name shown in `scaling_governor`
    pub fn governor_name(&self) -> Option<&str> {
        match self.policy.name() {
            Some(name) => Some(name),
            None => self.governor.as_ref().map(|g| g.name()),
        }
    }
}

// =============================================================================
// Candidate
// =============================================================================

/// A proposed policy state, checked and adjusted before commit
#[derive(Debug, Clone)]
pub struct PolicyCandidate {
    /// Owning CPU of the target policy
    pub cpu: usize,
    /// CPUs of the target policy
    pub cpus: CpuMask,
    /// Hardware limits
    pub cpuinfo: CpuInfo,
    /// Proposed minimum
    pub min: u32,
    /// Proposed maximum
    pub max: u32,
    /// Current frequency snapshot
    pub cur: u32,
    /// Proposed driver policy
    pub policy: ScalingPolicy,
    /// Proposed governor
    pub governor: Option<GovernorHandle>,
}

impl PolicyCandidate {
    /// Proposed range
    pub const fn bounds(&self) -> Bounds {
        Bounds::new(self.min, self.max)
    }

    /// Pull the proposed range inside `[min, max]`
    pub fn verify_within_limits(&mut self, min: u32, max: u32) {
        if self.min < min {
            self.min = min;
        }
        if self.max < min {
            self.max = min;
        }
        if self.min > max {
            self.min = max;
        }
        if self.max > max {
            self.max = max;
        }
        if self.min > self.max {
            self.min = self.max;
        }
    }

    /// Pull the proposed range inside the hardware limits
    pub fn verify_within_cpu_limits(&mut self) {
        let CpuInfo {
            min_freq, max_freq, ..
        } = self.cpuinfo;
        self.verify_within_limits(min_freq, max_freq);
    }
}

impl From<&PolicyData> for PolicyCandidate {
    fn from(data: &PolicyData) -> Self {
        Self {
            cpu: data.cpu,
            cpus: data.cpus,
            cpuinfo: data.cpuinfo,
            min: data.min,
            max: data.max,
            cur: data.cur,
            policy: data.policy,
            governor: data.governor.clone(),
        }
    }
}

// =============================================================================
// External Handle
// =============================================================================

/// Published node of a policy, torn down when its last user leaves
#[derive(Debug)]
pub struct PolicyNode {
    users: AtomicUsize,
    released: AtomicBool,
}

impl PolicyNode {
    const fn new() -> Self {
        Self {
            users: AtomicUsize::new(1),
            released: AtomicBool::new(false),
        }
    }

    fn try_get(&self) -> bool {
        self.users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |users| {
                (users != 0).then(|| users + 1)
            })
            .is_ok()
    }

    /// Drop one user; the last one tears the node down
    pub(crate) fn put(&self) {
        let prev = self
            .users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |users| {
                users.checked_sub(1)
            });
        if prev == Ok(1) {
            self.released.store(true, Ordering::Release);
        }
    }

    /// Block until teardown completed
    pub(crate) fn wait_released(&self) {
        while !self.released.load(Ordering::Acquire) {
            hint::spin_loop();
        }
    }

    /// Number of users, including the base reference
    pub fn users(&self) -> usize {
        self.users.load(Ordering::Acquire)
    }

    /// Whether the node has been torn down
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

// =============================================================================
// Policy
// =============================================================================

/// Unique policy identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PolicyId(u64);

impl PolicyId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "policy#{}", self.0)
    }
}

/// Shared scaling policy of one domain
pub struct Policy {
    id: PolicyId,
    data: RwLock<PolicyData>,
    refcount: AtomicUsize,
    node: PolicyNode,
}

impl Policy {
    pub(crate) fn new(data: PolicyData) -> Arc<Self> {
        Arc::new(Self {
            id: PolicyId::new(),
            data: RwLock::new(data),
            refcount: AtomicUsize::new(0),
            node: PolicyNode::new(),
        })
    }

    /// Policy identifier
    pub fn id(&self) -> PolicyId {
        self.id
    }

    /// CPU that owns the policy
    pub fn owning_cpu(&self) -> usize {
        self.data.read().cpu
    }

    /// Online CPUs governed
    pub fn cpus(&self) -> CpuMask {
        self.data.read().cpus
    }

    /// Domain membership including offline CPUs
    pub fn related_cpus(&self) -> CpuMask {
        self.data.read().related_cpus
    }

    /// Hardware limits
    pub fn cpuinfo(&self) -> CpuInfo {
        self.data.read().cpuinfo
    }

    /// Visible bounds, as last requested
    pub fn bounds(&self) -> Bounds {
        self.data.read().bounds()
    }

    /// Enforced bounds
    pub fn effective(&self) -> Bounds {
        self.data.read().effective
    }

    /// Client request
    pub fn user(&self) -> UserPolicy {
        self.data.read().user.clone()
    }

    /// Last applied frequency
    pub fn cur(&self) -> u32 {
        self.data.read().cur
    }

    /// Last reported utilization
    pub fn util(&self) -> u32 {
        self.data.read().util
    }

    /// Active governor
    pub fn governor(&self) -> Option<GovernorHandle> {
        self.data.read().governor.clone()
    }

    /// Governor lifecycle state
    pub fn governor_state(&self) -> GovernorState {
        self.data.read().governor_state
    }

    /// Driver policy
    pub fn scaling_policy(&self) -> ScalingPolicy {
        self.data.read().policy
    }

    /// Consistent copy of the whole state
    pub fn snapshot(&self) -> PolicyData {
        self.data.read().clone()
    }

    /// Number of live [`PolicyRef`]s
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// External handle
    pub fn node(&self) -> &PolicyNode {
        &self.node
    }

    /// Mutate the state; never call out of the core while inside `f`
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut PolicyData) -> R) -> R {
        f(&mut self.data.write())
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.read();
        f.debug_struct("Policy")
            .field("id", &self.id)
            .field("cpu", &data.cpu)
            .field("cpus", &data.cpus)
            .field("cur", &data.cur)
            .field("governor", &data.governor_name())
            .field("refcount", &self.refcount())
            .finish()
    }
}

// =============================================================================
// References
// =============================================================================

/// Which reference an acquire takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// Also pins the external handle; removal waits for it
    External,
    /// Keeps storage alive only; used by attribute handlers and merge
    Internal,
}

/// Counted reference on a policy
pub struct PolicyRef {
    policy: Arc<Policy>,
    pinned: bool,
}

impl PolicyRef {
    /// Take a reference; an external one fails once the node is torn down
    pub(crate) fn acquire(policy: Arc<Policy>, kind: RefKind) -> Option<Self> {
        let pinned = kind == RefKind::External;
        if pinned && !policy.node.try_get() {
            return None;
        }
        policy.refcount.fetch_add(1, Ordering::AcqRel);
        Some(Self { policy, pinned })
    }

    /// Underlying shared pointer
    pub fn arc(&self) -> &Arc<Policy> {
        &self.policy
    }

    /// Whether two references name the same policy
    pub fn same(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.policy, &b.policy)
    }
}

impl Deref for PolicyRef {
    type Target = Policy;

    fn deref(&self) -> &Policy {
        &self.policy
    }
}

impl Drop for PolicyRef {
    fn drop(&mut self) {
        self.policy.refcount.fetch_sub(1, Ordering::AcqRel);
        if self.pinned {
            self.policy.node.put();
        }
    }
}

impl fmt::Debug for PolicyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRef")
            .field("policy", &self.policy.id)
            .field("pinned", &self.pinned)
            .finish()
    }
}
