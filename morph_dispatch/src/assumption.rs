//! Assumptions.
//!
//! An [`Assumption`] is a shared, one-way invalidatable validity token. Cache
//! instances hold references to the assumptions they were specialized under;
//! an instance whose assumption set is no longer valid is never dispatched
//! to and is purged by the next slow path.
//!
//! # Invalidation Protocol
//!
//! 1. `invalidate` flips the flag once (`AcqRel`); later calls are no-ops
//! 2. fast-path readers observe the flag (`Acquire`) before running a body
//! 3. the next slow path purges every instance holding the assumption
//! 4. a fresh state needs a fresh assumption (`AssumptionRegistry::renew`)

use crate::guard::{Reads, Scope};
use dashmap::DashMap;
use parking_lot::RwLock;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

static NEXT_ASSUMPTION_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Assumption
// =============================================================================

struct AssumptionInner {
    id: u64,
    name: String,
    valid: AtomicBool,
}

/// A shared validity flag that can only go from valid to invalid.
#[derive(Clone)]
pub struct Assumption {
    inner: Arc<AssumptionInner>,
}

impl Assumption {
    /// Create a valid assumption.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_state(name.into(), true)
    }

    /// An assumption that stays valid.
    pub fn always_valid() -> Self {
        Self::with_state("always valid".to_string(), true)
    }

    /// An assumption that was never valid.
    pub fn never_valid() -> Self {
        Self::with_state("never valid".to_string(), false)
    }

    fn with_state(name: String, valid: bool) -> Self {
        Self {
            inner: Arc::new(AssumptionInner {
                id: NEXT_ASSUMPTION_ID.fetch_add(1, Ordering::Relaxed),
                name,
                valid: AtomicBool::new(valid),
            }),
        }
    }

    /// Unique id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Diagnostic name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the assumption still holds.
    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// Invalidate. Returns `true` if this call performed the transition.
    pub fn invalidate(&self) -> bool {
        self.inner.valid.swap(false, Ordering::AcqRel)
    }
}

impl PartialEq for Assumption {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Assumption {}

impl fmt::Debug for Assumption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assumption")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("valid", &self.is_valid())
            .finish()
    }
}

// =============================================================================
// Assumption Set
// =============================================================================

/// Assumptions an instance depends on; valid iff every member is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssumptionSet {
    members: SmallVec<[Assumption; 2]>,
}

impl AssumptionSet {
    /// Empty (always valid) set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one assumption.
    pub fn push(&mut self, assumption: Assumption) {
        self.members.push(assumption);
    }

    /// Add every member of `other`.
    pub fn extend(&mut self, other: AssumptionSet) {
        self.members.extend(other.members);
    }

    /// Whether all members are valid.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.members.iter().all(Assumption::is_valid)
    }

    /// Members.
    pub fn members(&self) -> &[Assumption] {
        &self.members
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the set has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl From<Assumption> for AssumptionSet {
    fn from(a: Assumption) -> Self {
        let mut set = Self::new();
        set.push(a);
        set
    }
}

impl FromIterator<Assumption> for AssumptionSet {
    fn from_iter<I: IntoIterator<Item = Assumption>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// Assumption Expression
// =============================================================================

/// Produces the assumptions of a new instance.
pub type AssumptionFn = Arc<dyn Fn(&Scope<'_>) -> AssumptionSet + Send + Sync>;

/// A specialization's assumption declaration.
///
/// Expressions may read cached values and static binds, never the dynamic
/// arguments.
#[derive(Clone)]
pub struct AssumptionExpr {
    pub(crate) name: String,
    pub(crate) reads: Reads,
    pub(crate) binds: SmallVec<[usize; 2]>,
    pub(crate) produce: AssumptionFn,
}

impl AssumptionExpr {
    /// Declare an expression computing an assumption set.
    pub fn new<F>(name: impl Into<String>, produce: F) -> Self
    where
        F: Fn(&Scope<'_>) -> AssumptionSet + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            reads: Reads::empty(),
            binds: SmallVec::new(),
            produce: Arc::new(produce),
        }
    }

    /// Always depend on one fixed assumption.
    pub fn fixed(assumption: Assumption) -> Self {
        let name = assumption.name().to_string();
        Self::new(name, move |_| AssumptionSet::from(assumption.clone()))
    }

    /// Depend on a fixed, possibly empty array of assumptions.
    pub fn array(name: impl Into<String>, assumptions: Vec<Assumption>) -> Self {
        Self::new(name, move |_| assumptions.iter().cloned().collect())
    }

    /// Replace the read set.
    pub fn reads(mut self, reads: Reads) -> Self {
        self.reads = reads;
        self
    }

    /// Read the bind at `index`.
    pub fn bind(mut self, index: usize) -> Self {
        self.binds.push(index);
        self.reads |= Reads::BINDS;
        self
    }

    /// Expression name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the expression reads cached values.
    pub(crate) fn reads_cached(&self) -> bool {
        self.reads.contains(Reads::CACHED)
    }

    pub(crate) fn evaluate(&self, scope: &Scope<'_>) -> AssumptionSet {
        (self.produce)(scope)
    }
}

impl fmt::Debug for AssumptionExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssumptionExpr")
            .field("name", &self.name)
            .field("reads", &self.reads)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Invalidation Event
// =============================================================================

/// A recorded invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
    /// Invalidated assumption.
    pub assumption_id: u64,
    /// Its name.
    pub name: String,
    /// Caller-supplied reason.
    pub reason: String,
    /// Monotonic sequence number.
    pub timestamp: u64,
}

// =============================================================================
// Assumption Registry
// =============================================================================

/// Explicitly owned registry of named assumptions.
///
/// Thread-safe; keeps a bounded history of invalidations.
#[derive(Debug)]
pub struct AssumptionRegistry {
    assumptions: DashMap<u64, Assumption, FxBuildHasher>,
    event_counter: AtomicU64,
    history: RwLock<VecDeque<InvalidationEvent>>,
    max_history: usize,
}

impl AssumptionRegistry {
    /// Create a registry keeping the last 1000 invalidations.
    pub fn new() -> Self {
        Self::with_history_size(1000)
    }

    /// Create with a custom history size.
    pub fn with_history_size(max_history: usize) -> Self {
        Self {
            assumptions: DashMap::with_hasher(FxBuildHasher),
            event_counter: AtomicU64::new(0),
            history: RwLock::new(VecDeque::new()),
            max_history,
        }
    }

    /// Create and register a valid assumption.
    pub fn create(&self, name: impl Into<String>) -> Assumption {
        let assumption = Assumption::new(name);
        self.assumptions.insert(assumption.id(), assumption.clone());
        assumption
    }

    /// Invalidate `assumption` and drop it from the registry.
    /// Idempotent; only the first call is recorded.
    pub fn invalidate(&self, assumption: &Assumption, reason: &str) -> bool {
        if !assumption.invalidate() {
            return false;
        }
        self.assumptions.remove(&assumption.id());
        let timestamp = self.event_counter.fetch_add(1, Ordering::Relaxed);
        debug!(
            assumption = assumption.name(),
            id = assumption.id(),
            reason,
            "assumption invalidated"
        );
        let mut history = self.history.write();
        history.push_back(InvalidationEvent {
            assumption_id: assumption.id(),
            name: assumption.name().to_string(),
            reason: reason.to_string(),
            timestamp,
        });
        while history.len() > self.max_history {
            history.pop_front();
        }
        true
    }

    /// Whether `assumption` is still valid.
    #[inline]
    pub fn is_valid(&self, assumption: &Assumption) -> bool {
        assumption.is_valid()
    }

    /// Mint a fresh valid assumption replacing `assumption` under the same name.
    pub fn renew(&self, assumption: &Assumption) -> Assumption {
        self.assumptions.remove(&assumption.id());
        self.create(assumption.name().to_string())
    }

    /// Look up a registered, still valid assumption.
    pub fn get(&self, id: u64) -> Option<Assumption> {
        self.assumptions.get(&id).map(|a| a.clone())
    }

    /// Number of registered valid assumptions.
    pub fn len(&self) -> usize {
        self.assumptions.len()
    }

    /// Whether no assumption is registered.
    pub fn is_empty(&self) -> bool {
        self.assumptions.is_empty()
    }

    /// The last `count` invalidations, oldest first.
    pub fn recent_events(&self, count: usize) -> Vec<InvalidationEvent> {
        let history = self.history.read();
        let start = history.len().saturating_sub(count);
        history.iter().skip(start).cloned().collect()
    }

    /// Total invalidations performed through this registry.
    pub fn total_invalidations(&self) -> u64 {
        self.event_counter.load(Ordering::Relaxed)
    }
}

impl Default for AssumptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidation_is_one_way() {
        let a = Assumption::new("stable");
        assert!(a.is_valid());
        assert!(a.invalidate());
        assert!(!a.invalidate());
        assert!(!a.is_valid());
    }

    #[test]
    fn test_set_validity() {
        let a = Assumption::new("a");
        let b = Assumption::new("b");
        let set: AssumptionSet = vec![a.clone(), b.clone()].into_iter().collect();
        assert!(set.is_valid());
        b.invalidate();
        assert!(!set.is_valid());
        assert!(AssumptionSet::new().is_valid());
        assert!(!AssumptionSet::from(Assumption::never_valid()).is_valid());
        assert!(AssumptionSet::from(Assumption::always_valid()).is_valid());
    }

    #[test]
    fn test_shared_handles() {
        let a = Assumption::new("shared");
        let b = a.clone();
        assert_eq!(a, b);
        assert_ne!(a, Assumption::new("shared"));
        a.invalidate();
        assert!(!b.is_valid());
    }

    #[test]
    fn test_registry_history_and_renew() {
        let registry = AssumptionRegistry::with_history_size(2);
        let a = registry.create("a");
        assert_eq!(registry.get(a.id()), Some(a.clone()));

        assert!(registry.invalidate(&a, "redefined"));
        assert!(!registry.invalidate(&a, "again"));
        assert!(!registry.is_valid(&a));
        assert_eq!(registry.total_invalidations(), 1);
        assert!(registry.get(a.id()).is_none());

        let fresh = registry.renew(&a);
        assert!(fresh.is_valid());
        assert_eq!(fresh.name(), "a");
        assert_ne!(fresh.id(), a.id());
        assert!(registry.get(a.id()).is_none());

        let b = registry.create("b");
        let c = registry.create("c");
        registry.invalidate(&b, "x");
        registry.invalidate(&c, "y");
        let events = registry.recent_events(10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "b");
        assert_eq!(events[1].reason, "y");
    }

    #[test]
    fn test_registry_drops_invalidated_entries() {
        let registry = AssumptionRegistry::with_history_size(4);
        for round in 0..100 {
            let a = registry.create(format!("a{}", round));
            registry.invalidate(&a, "churn");
        }
        assert!(registry.is_empty());
        assert_eq!(registry.total_invalidations(), 100);
        assert_eq!(registry.recent_events(usize::MAX).len(), 4);

        let live = registry.create("live");
        let dead = registry.create("dead");
        registry.invalidate(&dead, "gone");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(live.id()), Some(live));
    }
}
