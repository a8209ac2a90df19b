//! # Notifier Channels
//!
//! Two independent observer channels:
//!
//! - **Policy** ([`PolicyObserver`]): `Adjust`, `Incompatible`, `Notify`,
//!   `Start`. Delivered from contexts that may sleep; observers may block
//!   and may adjust the candidate during `Adjust`/`Incompatible`.
//! - **Transition** ([`TransitionObserver`]): pre/post frequency change.
//!   Delivered from contexts that must not sleep; observers must not block.
//!
//! Observers run in priority order while the channel's read lock is held,
//! so a callback must not register or unregister observers. A policy
//! observer that blocks stalls concurrent `register_*`/`unregister_*`
//! callers until it returns.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::RwLock;

use crate::policy::PolicyCandidate;
use crate::transition::{FreqTransition, TransitionPhase};

/// Policy change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyEvent {
    /// Candidate may be adjusted
    Adjust,
    /// Candidate may be adjusted for hardware incompatibilities
    Incompatible,
    /// Candidate is final
    Notify,
    /// A policy was created
    Start,
}

/// Observer of policy changes; may sleep
pub trait PolicyObserver: Send + Sync {
    /// Observer name, for logs
    fn name(&self) -> &str {
        "anonymous"
    }

    /// Handle an event
    fn on_policy_event(&self, event: PolicyEvent, candidate: &mut PolicyCandidate);
}

/// Observer of frequency transitions; must not sleep
pub trait TransitionObserver: Send + Sync {
    /// Handle one phase of a transition
    fn on_transition(&self, phase: TransitionPhase, freqs: &FreqTransition);
}

/// Notifier registration ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NotifierId(u64);

impl NotifierId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Notifier priority (lower = earlier)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NotifierPriority(pub u8);

impl NotifierPriority {
    /// Runs first
    pub const HIGHEST: Self = Self(0);
    /// Default
    pub const NORMAL: Self = Self(128);
    /// Runs last
    pub const LOWEST: Self = Self(255);
}

impl Default for NotifierPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

struct Entry<T: ?Sized> {
    id: NotifierId,
    priority: NotifierPriority,
    observer: Arc<T>,
}

/// Priority-ordered observer list
pub struct NotifierChain<T: ?Sized> {
    entries: RwLock<Vec<Entry<T>>>,
}

impl<T: ?Sized> NotifierChain<T> {
    /// Create an empty chain
    pub const fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer
    pub fn register(&self, observer: Arc<T>, priority: NotifierPriority) -> NotifierId {
        let id = NotifierId::new();
        let mut entries = self.entries.write();
        let pos = entries
            .iter()
            .position(|e| e.priority > priority)
            .unwrap_or(entries.len());
        entries.insert(
            pos,
            Entry {
                id,
                priority,
                observer,
            },
        );
        id
    }

    /// Unregister an observer
    pub fn unregister(&self, id: NotifierId) -> bool {
        let mut entries = self.entries.write();
        match entries.iter().position(|e| e.id == id) {
            Some(pos) => {
                entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Number of observers
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the chain is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn for_each(&self, mut f: impl FnMut(&T)) {
        let entries = self.entries.read();
        for entry in entries.iter() {
            f(&*entry.observer);
        }
    }
}

impl<T: ?Sized> Default for NotifierChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for NotifierChain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierChain").field("observers", &self.len()).finish()
    }
}

impl NotifierChain<dyn PolicyObserver> {
    /// Deliver a policy event
    pub(crate) fn notify(&self, event: PolicyEvent, candidate: &mut PolicyCandidate) {
        self.for_each(|observer| {
            log::debug!("cpufreq: policy event {:?} to {}", event, observer.name());
            observer.on_policy_event(event, candidate);
        });
    }
}

impl NotifierChain<dyn TransitionObserver> {
    /// Deliver one transition phase
    pub(crate) fn notify(&self, phase: TransitionPhase, freqs: &FreqTransition) {
        self.for_each(|observer| observer.on_transition(phase, freqs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransitions;

    #[test]
    fn test_priority_order() {
        let chain: NotifierChain<dyn TransitionObserver> = NotifierChain::new();
        let late = Arc::new(RecordingTransitions::new());
        let early = Arc::new(RecordingTransitions::new());
        chain.register(late.clone(), NotifierPriority::LOWEST);
        chain.register(early.clone(), NotifierPriority::HIGHEST);

        let freqs = FreqTransition::new(0, 100, 200);
        chain.notify(TransitionPhase::PreChange, &freqs);
        assert_eq!(early.count(), 1);
        assert_eq!(late.count(), 1);
        assert!(early.first_seq() < late.first_seq());
    }

    #[test]
    fn test_unregister() {
        let chain: NotifierChain<dyn TransitionObserver> = NotifierChain::new();
        let obs = Arc::new(RecordingTransitions::new());
        let id = chain.register(obs.clone(), NotifierPriority::NORMAL);
        assert!(chain.unregister(id));
        assert!(!chain.unregister(id));

        chain.notify(TransitionPhase::PostChange, &FreqTransition::new(0, 1, 2));
        assert_eq!(obs.count(), 0);
    }
}
