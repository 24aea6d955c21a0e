//! Cache instances and the per-node slot store.
//!
//! The store publishes an immutable `Vec` of instances through an
//! [`ArcSwap`]. Fast-path readers load the current snapshot without locking
//! and walk it in insertion order. Writers run under the owning node's
//! specialization lock, build a complete new vector and store it in one
//! atomic swap, so a reader sees either the old or the new list, never a
//! half-built one.
//!
//! Removal marks the instance first and publishes second; readers still
//! holding an older snapshot skip marked instances.

use crate::assumption::AssumptionSet;
use crate::guard::{Reads, Scope};
use crate::node::DispatchNode;
use arc_swap::{ArcSwap, ArcSwapOption};
use morph_core::{Throw, Value, ValueType};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Cached values of one instance.
pub type CachedValues = SmallVec<[Value; 2]>;

// =============================================================================
// Cache Parameter
// =============================================================================

/// Computes a cached value when an instance is created.
pub type CacheInitFn = Arc<dyn Fn(&Scope<'_>) -> Result<Value, Throw> + Send + Sync>;

/// A cached value declared by a specialization.
#[derive(Clone)]
pub struct CacheParam {
    pub(crate) name: String,
    pub(crate) ty: Option<ValueType>,
    pub(crate) expr: String,
    pub(crate) reads: Reads,
    pub(crate) binds: SmallVec<[usize; 2]>,
    pub(crate) init: CacheInitFn,
    pub(crate) never_default: bool,
    pub(crate) shared: Option<String>,
}

impl CacheParam {
    /// Declare a cached value.
    ///
    /// `expr` is the initializer's source text; sharing participants must
    /// agree on it. The initializer sees the arguments, the binds and the
    /// cached values declared before this one.
    pub fn new<F>(name: impl Into<String>, expr: impl Into<String>, init: F) -> Self
    where
        F: Fn(&Scope<'_>) -> Result<Value, Throw> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            ty: None,
            expr: expr.into(),
            reads: Reads::ARGS,
            binds: SmallVec::new(),
            init: Arc::new(init),
            never_default: false,
            shared: None,
        }
    }

    /// Declare the value's type.
    pub fn ty(mut self, ty: ValueType) -> Self {
        self.ty = Some(ty);
        self
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

    /// Reject initializers that produce the default value.
    pub fn never_default(mut self) -> Self {
        self.never_default = true;
        self
    }

    /// Share one node-level slot with every parameter of the same group.
    pub fn shared(mut self, group: impl Into<String>) -> Self {
        self.shared = Some(group.into());
        self
    }

    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Initializer source text.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Declared type.
    pub fn value_type(&self) -> Option<ValueType> {
        self.ty
    }

    /// Whether the default value is rejected.
    pub fn is_never_default(&self) -> bool {
        self.never_default
    }

    /// Sharing group.
    pub fn shared_group(&self) -> Option<&str> {
        self.shared.as_deref()
    }

    #[inline]
    pub(crate) fn initialize(&self, scope: &Scope<'_>) -> Result<Value, Throw> {
        (self.init)(scope)
    }
}

impl fmt::Debug for CacheParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheParam")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("expr", &self.expr)
            .field("never_default", &self.never_default)
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Cache Instance
// =============================================================================

/// One activation of a specialization at one node.
pub struct CacheInstance {
    id: u64,
    specialization: usize,
    cached: CachedValues,
    children: SmallVec<[Arc<DispatchNode>; 2]>,
    assumptions: AssumptionSet,
    removed: AtomicBool,
}

impl CacheInstance {
    pub(crate) fn new(
        specialization: usize,
        cached: CachedValues,
        children: SmallVec<[Arc<DispatchNode>; 2]>,
        assumptions: AssumptionSet,
    ) -> Self {
        Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            specialization,
            cached,
            children,
            assumptions,
            removed: AtomicBool::new(false),
        }
    }

    /// Unique id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Index of the specialization in its table.
    #[inline]
    pub fn specialization(&self) -> usize {
        self.specialization
    }

    /// Cached values in declaration order.
    #[inline]
    pub fn cached(&self) -> &[Value] {
        &self.cached
    }

    /// Owned child nodes.
    #[inline]
    pub fn children(&self) -> &[Arc<DispatchNode>] {
        &self.children
    }

    /// Assumptions the instance depends on.
    #[inline]
    pub fn assumptions(&self) -> &AssumptionSet {
        &self.assumptions
    }

    /// Whether the instance was removed from its store.
    #[inline(always)]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Not removed and all assumptions hold.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.is_removed() && self.assumptions.is_valid()
    }

    fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    fn same_key(&self, other: &CacheInstance) -> bool {
        self.specialization == other.specialization && self.cached == other.cached
    }
}

impl fmt::Debug for CacheInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let children: Vec<_> = self.children.iter().map(|c| c.id()).collect();
        f.debug_struct("CacheInstance")
            .field("id", &self.id)
            .field("specialization", &self.specialization)
            .field("cached", &self.cached)
            .field("children", &children)
            .field("assumptions", &self.assumptions.len())
            .field("removed", &self.is_removed())
            .finish()
    }
}

// =============================================================================
// Slot Store
// =============================================================================

/// Verdict of a fast-path probe on one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The instance applies.
    Hit,
    /// The instance does not apply; keep walking.
    Skip,
    /// The instance would apply but its assumptions are invalid.
    Stale,
}

/// Result of [`CacheSlotStore::try_match`].
#[derive(Debug, Clone)]
pub enum Lookup {
    /// First applicable instance.
    Hit(Arc<CacheInstance>),
    /// No instance applies.
    Miss,
    /// An instance with invalid assumptions was reached first.
    Stale,
}

/// Result of [`CacheSlotStore::insert_or_reuse`].
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// The instance was published.
    Inserted(Arc<CacheInstance>),
    /// An instance with the same specialization and key already existed.
    Reused(Arc<CacheInstance>),
    /// The specialization already holds `limit` instances.
    LimitReached,
}

/// Ordered instances of one node plus its shared cache slots.
pub struct CacheSlotStore {
    instances: ArcSwap<Vec<Arc<CacheInstance>>>,
    shared: Box<[ArcSwapOption<Value>]>,
}

impl CacheSlotStore {
    /// Empty store with `shared_slots` shared-group slots.
    pub fn new(shared_slots: usize) -> Self {
        Self {
            instances: ArcSwap::from_pointee(Vec::new()),
            shared: (0..shared_slots).map(|_| ArcSwapOption::empty()).collect(),
        }
    }

    /// Current published instance list.
    pub fn snapshot(&self) -> Arc<Vec<Arc<CacheInstance>>> {
        self.instances.load_full()
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.instances
            .load()
            .iter()
            .filter(|i| !i.is_removed())
            .count()
    }

    /// Whether there is no live instance.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk live instances in insertion order.
    #[inline]
    pub fn try_match<F>(&self, mut probe: F) -> Lookup
    where
        F: FnMut(&CacheInstance) -> Probe,
    {
        let snapshot = self.instances.load();
        for instance in snapshot.iter() {
            if instance.is_removed() {
                continue;
            }
            match probe(instance) {
                Probe::Hit => return Lookup::Hit(Arc::clone(instance)),
                Probe::Stale => return Lookup::Stale,
                Probe::Skip => {}
            }
        }
        Lookup::Miss
    }

    /// Live instances of specialization `specialization`.
    pub fn count_for(&self, specialization: usize) -> usize {
        self.instances
            .load()
            .iter()
            .filter(|i| i.specialization == specialization && !i.is_removed())
            .count()
    }

    /// Publish `instance` unless an equal one exists or the limit is reached.
    ///
    /// Instances with invalid assumptions are purged first. Caller holds the
    /// node's specialization lock.
    pub fn insert_or_reuse(&self, instance: CacheInstance, limit: usize) -> InsertOutcome {
        self.purge_invalid();
        let current = self.instances.load_full();
        if let Some(existing) = current
            .iter()
            .find(|i| !i.is_removed() && i.same_key(&instance))
        {
            return InsertOutcome::Reused(Arc::clone(existing));
        }
        let count = current
            .iter()
            .filter(|i| i.specialization == instance.specialization && !i.is_removed())
            .count();
        if count >= limit {
            return InsertOutcome::LimitReached;
        }

        let instance = Arc::new(instance);
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().filter(|i| !i.is_removed()).cloned());
        next.push(Arc::clone(&instance));
        self.instances.store(Arc::new(next));
        InsertOutcome::Inserted(instance)
    }

    /// Remove every instance whose assumptions no longer hold.
    pub fn purge_invalid(&self) -> Vec<Arc<CacheInstance>> {
        self.remove_where(|i| !i.assumptions.is_valid())
    }

    /// Remove one instance by id.
    pub fn remove_instance(&self, id: u64) -> bool {
        !self.remove_where(|i| i.id == id).is_empty()
    }

    /// Remove every instance of `specialization`.
    pub fn remove_specialization(&self, specialization: usize) -> Vec<Arc<CacheInstance>> {
        self.remove_where(|i| i.specialization == specialization)
    }

    /// Remove everything, including shared slot values.
    pub fn clear(&self) -> usize {
        for slot in self.shared.iter() {
            slot.store(None);
        }
        self.remove_where(|_| true).len()
    }

    fn remove_where<F>(&self, predicate: F) -> Vec<Arc<CacheInstance>>
    where
        F: Fn(&CacheInstance) -> bool,
    {
        let current = self.instances.load_full();
        let (removed, kept): (Vec<_>, Vec<_>) = current
            .iter()
            .filter(|i| !i.is_removed())
            .cloned()
            .partition(|i| predicate(i));
        if removed.is_empty() {
            return removed;
        }
        for instance in &removed {
            instance.mark_removed();
        }
        self.instances.store(Arc::new(kept));
        removed
    }

    // =========================================================================
    // Shared Slots
    // =========================================================================

    /// Value of shared slot `slot`, if initialized.
    pub fn shared_value(&self, slot: usize) -> Option<Value> {
        self.shared
            .get(slot)
            .and_then(|s| s.load_full())
            .map(|v| (*v).clone())
    }

    /// Initialize shared slot `slot`.
    pub fn publish_shared(&self, slot: usize, value: Value) -> bool {
        match self.shared.get(slot) {
            Some(s) => {
                s.store(Some(Arc::new(value)));
                true
            }
            None => false,
        }
    }
}

impl Default for CacheSlotStore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for CacheSlotStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSlotStore")
            .field("instances", &self.len())
            .field("shared", &self.shared.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assumption::Assumption;
    use smallvec::smallvec;

    fn instance(spec: usize, key: i32) -> CacheInstance {
        CacheInstance::new(
            spec,
            smallvec![Value::Int(key)],
            SmallVec::new(),
            AssumptionSet::new(),
        )
    }

    fn key_of(instance: &CacheInstance) -> i32 {
        instance.cached()[0].as_int().unwrap()
    }

    #[test]
    fn test_insert_respects_limit() {
        let store = CacheSlotStore::new(0);
        assert!(matches!(store.insert_or_reuse(instance(0, 1), 2), InsertOutcome::Inserted(_)));
        assert!(matches!(store.insert_or_reuse(instance(0, 2), 2), InsertOutcome::Inserted(_)));
        assert!(matches!(store.insert_or_reuse(instance(0, 3), 2), InsertOutcome::LimitReached));
        assert!(matches!(store.insert_or_reuse(instance(1, 3), 2), InsertOutcome::Inserted(_)));
        assert_eq!(store.count_for(0), 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_identical_key_reused() {
        let store = CacheSlotStore::new(0);
        let first = match store.insert_or_reuse(instance(0, 7), 3) {
            InsertOutcome::Inserted(i) => i,
            other => panic!("unexpected {:?}", other),
        };
        match store.insert_or_reuse(instance(0, 7), 3) {
            InsertOutcome::Reused(i) => assert_eq!(i.id(), first.id()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_try_match_insertion_order() {
        let store = CacheSlotStore::new(0);
        store.insert_or_reuse(instance(0, 1), 4);
        store.insert_or_reuse(instance(1, 2), 4);
        store.insert_or_reuse(instance(2, 3), 4);

        let mut seen = Vec::new();
        let found = store.try_match(|i| {
            seen.push(key_of(i));
            if i.specialization() >= 1 { Probe::Hit } else { Probe::Skip }
        });
        assert!(matches!(found, Lookup::Hit(ref i) if key_of(i) == 2));
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_removed_instances_invisible_to_old_snapshots() {
        let store = CacheSlotStore::new(0);
        let inserted = match store.insert_or_reuse(instance(0, 1), 1) {
            InsertOutcome::Inserted(i) => i,
            other => panic!("unexpected {:?}", other),
        };
        let old = store.snapshot();
        assert!(store.remove_instance(inserted.id()));
        assert!(old[0].is_removed());
        assert!(!old[0].is_valid());
        assert!(matches!(store.try_match(|_| Probe::Hit), Lookup::Miss));
        assert!(!store.remove_instance(inserted.id()));
    }

    #[test]
    fn test_purge_invalid() {
        let store = CacheSlotStore::new(0);
        let a = Assumption::new("a");
        store.insert_or_reuse(
            CacheInstance::new(0, SmallVec::new(), SmallVec::new(), a.clone().into()),
            1,
        );
        store.insert_or_reuse(instance(1, 5), 1);
        a.invalidate();
        assert!(matches!(store.try_match(|i| {
            if i.assumptions().is_valid() { Probe::Skip } else { Probe::Stale }
        }), Lookup::Stale));
        let purged = store.purge_invalid();
        assert_eq!(purged.len(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.count_for(0), 0);
    }

    #[test]
    fn test_remove_specialization_and_clear() {
        let store = CacheSlotStore::new(1);
        store.insert_or_reuse(instance(0, 1), 3);
        store.insert_or_reuse(instance(0, 2), 3);
        store.insert_or_reuse(instance(1, 3), 3);
        assert_eq!(store.remove_specialization(0).len(), 2);
        assert_eq!(store.len(), 1);

        assert!(store.publish_shared(0, Value::Int(9)));
        assert!(!store.publish_shared(1, Value::Int(9)));
        assert_eq!(store.shared_value(0), Some(Value::Int(9)));
        assert_eq!(store.clear(), 1);
        assert_eq!(store.shared_value(0), None);
        assert!(store.is_empty());
    }
}
