//! The cached dispatch node.
//!
//! A [`DispatchNode`] is one call site. It starts uninitialized and learns
//! which specializations of its table apply by publishing cache instances:
//!
//! ```text
//!  Uninitialized ──▶ Monomorphic ──▶ Polymorphic
//!        │                │                │
//!        └────────────────┴───────┬────────┘
//!                                 ▼
//!                              Generic
//! ```
//!
//! # Fast path
//!
//! A lock-free walk over the published instance snapshot. An instance
//! applies when its specialization is active and not excluded, the arguments
//! cast to its parameter types, its dynamic guards pass and its assumptions
//! still hold. The first applicable instance in insertion order wins.
//!
//! # Slow path
//!
//! Runs under the node's [`SpecializationLock`]: purge invalidated instances,
//! re-check the fast path, then walk the table in declaration order and
//! publish the first specialization that accepts. State bits are set after
//! the instance is published, so a reader seeing an active bit also sees its
//! instance.

use crate::arena::NodeArena;
use crate::attempt::Attempt;
use crate::cache::{CacheInstance, CacheSlotStore, InsertOutcome, Lookup, Probe};
use crate::lock::{SpecializationGuard, SpecializationLock};
use crate::report::{PolymorphismKind, PolymorphismReport};
use crate::specialization::{Children, SpecializationCall};
use crate::stats::DispatchStats;
use crate::table::SpecializationTable;
use morph_core::{
    DispatchError, DispatchResult, Frame, GuestException, NodeId, Throw,
    UnsupportedSpecialization, Value,
};
use morph_inline::InlineStorage;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

// =============================================================================
// Executable
// =============================================================================

/// Anything a specialization body can dispatch into.
pub trait Executable: Send + Sync {
    /// Execute with an optional frame.
    fn dispatch(&self, frame: Option<&Frame>, args: &[Value]) -> DispatchResult<Value>;

    /// Name of the operation.
    fn name(&self) -> &str;
}

// =============================================================================
// Dispatch State
// =============================================================================

/// Coarse classification of a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchState {
    /// Nothing activated yet.
    Uninitialized,
    /// Exactly one instance.
    Monomorphic,
    /// Two or more instances.
    Polymorphic,
    /// A replacing specialization without caches is active.
    Generic,
}

impl DispatchState {
    /// Lowercase name.
    pub const fn name(self) -> &'static str {
        match self {
            DispatchState::Uninitialized => "uninitialized",
            DispatchState::Monomorphic => "monomorphic",
            DispatchState::Polymorphic => "polymorphic",
            DispatchState::Generic => "generic",
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Dispatch Node
// =============================================================================

/// A self-specializing call site.
pub struct DispatchNode {
    id: NodeId,
    table: Arc<SpecializationTable>,
    arena: Arc<NodeArena>,
    storage: InlineStorage,
    cache: CacheSlotStore,
    lock: SpecializationLock,
    stats: DispatchStats,
}

impl DispatchNode {
    /// Create a node for `table` and register it in `arena`.
    pub fn new(table: Arc<SpecializationTable>, arena: &Arc<NodeArena>) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let id = arena.register(weak.clone(), table.name());
            Self {
                id,
                storage: table.new_storage(),
                cache: CacheSlotStore::new(table.shared_groups().len()),
                table,
                arena: arena.clone(),
                lock: SpecializationLock::new(),
                stats: DispatchStats::new(),
            }
        })
    }

    /// Arena id.
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Specialization table.
    #[inline]
    pub fn table(&self) -> &Arc<SpecializationTable> {
        &self.table
    }

    /// Arena the node is registered in.
    #[inline]
    pub fn arena(&self) -> &Arc<NodeArena> {
        &self.arena
    }

    /// Dispatch statistics.
    #[inline]
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// State bits and inlined profile slots.
    #[inline]
    pub fn storage(&self) -> &InlineStorage {
        &self.storage
    }

    /// Currently published instances.
    pub fn instances(&self) -> Arc<Vec<Arc<CacheInstance>>> {
        self.cache.snapshot()
    }

    /// Parent in the arena, if adopted.
    pub fn parent(&self) -> Option<NodeId> {
        self.arena.parent_of(self.id)
    }

    /// Make `child` a child of this node.
    pub fn adopt(&self, child: &DispatchNode) -> bool {
        self.arena.adopt(child.id, self.id)
    }

    /// Whether specialization `index` has an active bit set.
    pub fn is_active(&self, index: usize) -> bool {
        index < self.table.len() && self.storage.any(self.table.entry(index).active)
    }

    /// Whether specialization `index` is excluded at this node.
    pub fn is_excluded(&self, index: usize) -> bool {
        index < self.table.len()
            && self
                .table
                .entry(index)
                .excluded
                .is_some_and(|bit| self.storage.any(bit))
    }

    /// Classify the call site.
    pub fn dispatch_state(&self) -> DispatchState {
        let snapshot = self.cache.snapshot();
        let mut live = snapshot.iter().filter(|i| !i.is_removed()).peekable();
        if live.peek().is_none() {
            return DispatchState::Uninitialized;
        }
        let mut count = 0;
        for instance in live {
            if self.table.entry(instance.specialization()).generic {
                return DispatchState::Generic;
            }
            count += 1;
        }
        if count == 1 {
            DispatchState::Monomorphic
        } else {
            DispatchState::Polymorphic
        }
    }

    /// Execute without a frame.
    #[inline]
    pub fn execute(&self, args: &[Value]) -> DispatchResult<Value> {
        self.run(None, args)
    }

    /// Execute with a frame.
    #[inline]
    pub fn execute_with_frame(&self, frame: &Frame, args: &[Value]) -> DispatchResult<Value> {
        self.run(Some(frame), args)
    }

    /// Drop every instance and clear all state bits.
    pub fn reset(&self) -> DispatchResult<()> {
        let _guard = self.acquire()?;
        let removed = self.cache.snapshot();
        let count = self.cache.clear();
        self.release_children(&removed);
        self.storage.reset();
        self.stats.record_removed(count);
        debug!(node = %self.id, table = %self.table.name(), removed = count, "node reset");
        Ok(())
    }

    // =========================================================================
    // Dispatch Loop
    // =========================================================================

    fn run(&self, frame: Option<&Frame>, args: &[Value]) -> DispatchResult<Value> {
        if args.len() != self.table.arity() {
            return Err(DispatchError::ArityMismatch {
                node: self.id,
                name: self.table.name().to_string(),
                expected: self.table.arity(),
                actual: args.len(),
            });
        }

        let mut rewrites = 0u32;
        loop {
            let attempt = Attempt::new(&self.table, args, frame);
            let instance = match self.lookup(&attempt) {
                Lookup::Hit(instance) => {
                    self.stats.record_fast_hit();
                    instance
                }
                Lookup::Stale => {
                    self.stats.record_respecialization();
                    self.specialize(&attempt)?
                }
                Lookup::Miss => self.specialize(&attempt)?,
            };

            let index = instance.specialization();
            match self.invoke(&attempt, &instance) {
                Ok(value) => return Ok(value),
                Err(Throw::Exception(e)) if self.table.entry(index).spec.rewrites_on(e.kind) => {
                    rewrites += 1;
                    let retries = self.table.config().max_rewrite_retries;
                    if rewrites > retries {
                        warn!(
                            node = %self.id,
                            table = %self.table.name(),
                            retries,
                            "rewrite retry bound exceeded"
                        );
                        return Err(DispatchError::RewriteLimit {
                            node: self.id,
                            name: self.table.name().to_string(),
                            retries,
                        });
                    }
                    self.rewrite(index, &e)?;
                }
                Err(throw) => return Err(throw.into()),
            }
        }
    }

    fn lookup(&self, attempt: &Attempt<'_>) -> Lookup {
        self.cache.try_match(|instance| self.probe(attempt, instance))
    }

    fn probe(&self, attempt: &Attempt<'_>, instance: &CacheInstance) -> Probe {
        let index = instance.specialization();
        let entry = self.table.entry(index);
        if !self.storage.any(entry.active) || self.is_excluded(index) {
            return Probe::Skip;
        }
        if attempt.args_for(index).is_none() {
            return Probe::Skip;
        }
        if entry.spec.fallback && !attempt.fallback_applies(|i| self.is_excluded(i)) {
            return Probe::Skip;
        }
        if !attempt.dynamic_guards_pass(index, instance.cached()) {
            return Probe::Skip;
        }
        if !instance.assumptions().is_valid() {
            return Probe::Stale;
        }
        Probe::Hit
    }

    fn invoke(&self, attempt: &Attempt<'_>, instance: &CacheInstance) -> Result<Value, Throw> {
        let index = instance.specialization();
        let entry = self.table.entry(index);
        let scope = attempt.scope(index).ok_or_else(|| {
            Throw::Error(DispatchError::TypeMismatch {
                expected: format!("arguments of '{}'", entry.spec.name),
                actual: "uncastable arguments".to_string(),
            })
        })?;
        let call = SpecializationCall {
            node: self.id,
            specialization: &entry.spec.name,
            scope: scope.with_cached(instance.cached()),
            children: Children::Cached(instance.children()),
            storage: Some(&self.storage),
            profiles: &entry.profiles,
        };
        trace!(
            node = %self.id,
            specialization = %entry.spec.name,
            instance = instance.id(),
            "dispatch"
        );
        (entry.spec.body)(&call)
    }

    // =========================================================================
    // Slow Path
    // =========================================================================

    fn acquire(&self) -> DispatchResult<SpecializationGuard<'_>> {
        self.lock.try_acquire().ok_or_else(|| {
            warn!(node = %self.id, table = %self.table.name(), "recursive specialization");
            DispatchError::RecursiveSpecialization {
                node: self.id,
                name: self.table.name().to_string(),
            }
        })
    }

    fn specialize(&self, attempt: &Attempt<'_>) -> DispatchResult<Arc<CacheInstance>> {
        let _guard = self.acquire()?;
        self.stats.record_slow_path();
        self.purge()?;

        if let Lookup::Hit(instance) = self.lookup(attempt) {
            return Ok(instance);
        }

        for &index in self.table.order() {
            if let Some(instance) = self.try_activate(attempt, index)? {
                return Ok(instance);
            }
        }

        self.stats.record_unsupported();
        debug!(
            node = %self.id,
            table = %self.table.name(),
            "no specialization accepts the arguments"
        );
        Err(UnsupportedSpecialization {
            node: self.id,
            node_name: self.table.name().to_string(),
            args: attempt.args.to_vec(),
        }
        .into())
    }

    fn try_activate(
        &self,
        attempt: &Attempt<'_>,
        index: usize,
    ) -> DispatchResult<Option<Arc<CacheInstance>>> {
        let entry = self.table.entry(index);
        if self.is_excluded(index) || !attempt.accepts_pre(index) {
            return Ok(None);
        }
        if entry.spec.fallback && !attempt.fallback_applies(|i| self.is_excluded(i)) {
            return Ok(None);
        }
        if self.cache.count_for(index) >= entry.limit {
            trace!(
                node = %self.id,
                specialization = %entry.spec.name,
                limit = entry.limit,
                "instance limit reached"
            );
            return Ok(None);
        }
        let Some((cached, assumptions)) = attempt.initialize(index, Some(&self.cache), true)?
        else {
            return Ok(None);
        };
        let children = self.create_children(index);
        self.publish(CacheInstance::new(index, cached, children, assumptions))
    }

    fn create_children(&self, index: usize) -> SmallVec<[Arc<DispatchNode>; 2]> {
        let entry = self.table.entry(index);
        let mut children = SmallVec::new();
        for spec in &entry.spec.children {
            let child = DispatchNode::new((spec.factory)(), &self.arena);
            if spec.adopt {
                self.arena.adopt(child.id, self.id);
            }
            children.push(child);
        }
        children
    }

    /// Publish `instance`, then flip state bits and apply replacements.
    fn publish(&self, instance: CacheInstance) -> DispatchResult<Option<Arc<CacheInstance>>> {
        let index = instance.specialization();
        let entry = self.table.entry(index);
        let before = self.dispatch_state();
        match self.cache.insert_or_reuse(instance, entry.limit) {
            InsertOutcome::Inserted(instance) => {
                self.storage.set_all(entry.active)?;
                self.stats.record_created();
                debug!(
                    node = %self.id,
                    table = %self.table.name(),
                    specialization = %entry.spec.name,
                    instance = instance.id(),
                    cached = ?instance.cached(),
                    "specialization activated"
                );
                for &replaced in &entry.replaces {
                    self.exclude(replaced, "replaced")?;
                }
                self.report_polymorphism(before, index);
                self.trace_transition(before);
                Ok(Some(instance))
            }
            // The discarded duplicate drops its own children.
            InsertOutcome::Reused(existing) => Ok(Some(existing)),
            InsertOutcome::LimitReached => Ok(None),
        }
    }

    /// Permanently exclude specialization `index` at this node.
    fn exclude(&self, index: usize, reason: &str) -> DispatchResult<()> {
        let entry = self.table.entry(index);
        if let Some(bit) = entry.excluded {
            if self.storage.any(bit) {
                return Ok(());
            }
            self.storage.set_all(bit)?;
        }
        self.storage.clear_all(entry.active)?;
        let removed = self.cache.remove_specialization(index);
        self.release_children(&removed);
        self.stats.record_exclusion();
        self.stats.record_removed(removed.len());
        debug!(
            node = %self.id,
            table = %self.table.name(),
            specialization = %entry.spec.name,
            reason,
            removed = removed.len(),
            "specialization excluded"
        );
        Ok(())
    }

    fn rewrite(&self, index: usize, exception: &GuestException) -> DispatchResult<()> {
        let _guard = self.acquire()?;
        self.stats.record_rewrite();
        let before = self.dispatch_state();
        self.exclude(index, exception.kind)?;
        self.trace_transition(before);
        Ok(())
    }

    /// Remove invalidated instances and clear bits of emptied specializations.
    fn purge(&self) -> DispatchResult<()> {
        let purged = self.cache.purge_invalid();
        if purged.is_empty() {
            return Ok(());
        }
        self.stats.record_removed(purged.len());
        self.release_children(&purged);
        for (index, entry) in self.table.entries().iter().enumerate() {
            if self.storage.any(entry.active) && self.cache.count_for(index) == 0 {
                self.storage.clear_all(entry.active)?;
            }
        }
        debug!(
            node = %self.id,
            table = %self.table.name(),
            purged = purged.len(),
            "invalidated instances purged"
        );
        Ok(())
    }

    fn release_children(&self, instances: &[Arc<CacheInstance>]) {
        for instance in instances {
            for child in instance.children() {
                self.arena.release(child.id);
            }
        }
    }

    /// Report a monomorphic node turning polymorphic, or the activation of
    /// a megamorphic specialization.
    fn report_polymorphism(&self, before: DispatchState, index: usize) {
        let entry = self.table.entry(index);
        let kind = if entry.spec.megamorphic {
            self.stats.record_megamorphic();
            PolymorphismKind::Megamorphic
        } else if before == DispatchState::Monomorphic
            && self.dispatch_state() == DispatchState::Polymorphic
        {
            self.stats.record_polymorphic();
            PolymorphismKind::Polymorphic
        } else {
            return;
        };
        debug!(
            node = %self.id,
            table = %self.table.name(),
            specialization = %entry.spec.name,
            kind = %kind,
            "polymorphism reported"
        );
        self.table.polymorphism().report(&PolymorphismReport {
            node: self.id,
            table: self.table.name(),
            specialization: &entry.spec.name,
            kind,
            instances: self.cache.len(),
        });
    }

    fn trace_transition(&self, before: DispatchState) {
        if !self.table.config().trace_specialization {
            return;
        }
        let after = self.dispatch_state();
        if before != after {
            debug!(
                node = %self.id,
                table = %self.table.name(),
                from = %before,
                to = %after,
                "dispatch state transition"
            );
        }
    }

    // =========================================================================
    // AOT
    // =========================================================================

    /// Activate every specialization whose caches and assumptions are
    /// static, and return the children of all instances.
    pub(crate) fn prepare_static(&self) -> DispatchResult<Vec<Arc<DispatchNode>>> {
        let _guard = self.acquire()?;
        self.purge()?;
        let attempt = Attempt::detached(&self.table);
        let before = self.dispatch_state();
        for &index in self.table.order() {
            let entry = self.table.entry(index);
            if !entry.aot_ready
                || self.is_excluded(index)
                || self.cache.count_for(index) >= entry.limit
            {
                continue;
            }
            let Some((cached, assumptions)) =
                attempt.initialize(index, Some(&self.cache), false)?
            else {
                continue;
            };
            let children = self.create_children(index);
            self.publish(CacheInstance::new(index, cached, children, assumptions))?;
        }
        self.trace_transition(before);
        Ok(self
            .cache
            .snapshot()
            .iter()
            .flat_map(|i| i.children().iter().cloned())
            .collect())
    }
}

impl Executable for DispatchNode {
    fn dispatch(&self, frame: Option<&Frame>, args: &[Value]) -> DispatchResult<Value> {
        self.run(frame, args)
    }

    fn name(&self) -> &str {
        self.table.name()
    }
}

impl Drop for DispatchNode {
    fn drop(&mut self) {
        self.arena.forget(self.id);
    }
}

impl fmt::Debug for DispatchNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchNode")
            .field("id", &self.id)
            .field("table", &self.table.name())
            .field("state", &self.dispatch_state())
            .field("instances", &self.cache.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheParam;
    use crate::guard::Guard;
    use crate::specialization::{ProfileKind, Specialization};
    use morph_core::{DispatchConfig, ValueType};

    fn node(table: Arc<SpecializationTable>) -> Arc<DispatchNode> {
        DispatchNode::new(table, &NodeArena::shared())
    }

    fn int_or_str() -> Arc<SpecializationTable> {
        SpecializationTable::builder("IntOrStr", 1)
            .specialization(
                Specialization::new("int", |c| Ok(Value::Int(c.arg(0).as_int().unwrap_or(0) + 1)))
                    .typed([ValueType::Int]),
            )
            .specialization(
                Specialization::new("str", |c| Ok(Value::str(&format!("{}!", c.arg(0)))))
                    .typed([ValueType::Str]),
            )
            .build(DispatchConfig::default())
            .unwrap()
    }

    #[test]
    fn test_state_progression() {
        let node = node(int_or_str());
        assert_eq!(node.dispatch_state(), DispatchState::Uninitialized);

        assert_eq!(node.execute(&[Value::Int(1)]).unwrap(), Value::Int(2));
        assert_eq!(node.dispatch_state(), DispatchState::Monomorphic);
        assert!(node.is_active(0));
        assert!(!node.is_active(1));

        node.execute(&[Value::str("a")]).unwrap();
        assert_eq!(node.dispatch_state(), DispatchState::Polymorphic);
        assert!(node.is_active(1));

        node.execute(&[Value::Int(5)]).unwrap();
        let stats = node.stats().snapshot();
        assert_eq!(stats.slow_paths, 2);
        assert_eq!(stats.fast_hits, 1);
        assert_eq!(stats.instances_created, 2);
    }

    #[test]
    fn test_unsupported_and_arity() {
        let node = node(int_or_str());
        let err = node.execute(&[Value::Bool(true)]).unwrap_err();
        assert!(err.is_unsupported());
        assert!(err.to_string().contains("'IntOrStr'"));
        assert_eq!(node.dispatch_state(), DispatchState::Uninitialized);

        let err = node.execute(&[]).unwrap_err();
        assert!(matches!(err, DispatchError::ArityMismatch { expected: 1, actual: 0, .. }));
    }

    #[test]
    fn test_reset_clears_instances_and_bits() {
        let node = node(int_or_str());
        node.execute(&[Value::Int(1)]).unwrap();
        node.reset().unwrap();
        assert_eq!(node.dispatch_state(), DispatchState::Uninitialized);
        assert!(!node.is_active(0));
        assert!(node.instances().is_empty());
    }

    #[test]
    fn test_fallback_only_when_nothing_else_applies() {
        let table = SpecializationTable::builder("Fb", 1)
            .specialization(Specialization::new("fb", |_| Ok(Value::str("fallback"))).fallback())
            .specialization(
                Specialization::new("small", |_| Ok(Value::str("small")))
                    .typed([ValueType::Int])
                    .guard(Guard::new("lt10", |s| s.arg(0).as_int().is_some_and(|v| v < 10))),
            )
            .build(DispatchConfig::default())
            .unwrap();
        let node = node(table);
        assert_eq!(node.execute(&[Value::Int(50)]).unwrap(), Value::str("fallback"));
        assert_eq!(node.execute(&[Value::Int(5)]).unwrap(), Value::str("small"));
        assert_eq!(node.execute(&[Value::Int(50)]).unwrap(), Value::str("fallback"));
        assert_eq!(node.execute(&[Value::Int(7)]).unwrap(), Value::str("small"));
    }

    #[test]
    fn test_counting_profile_records_in_node_storage() {
        let table = SpecializationTable::builder("Profiled", 1)
            .specialization(
                Specialization::new("branchy", |c| {
                    let positive = c.count_condition(0, c.arg(0).as_int().unwrap_or(0) > 0);
                    Ok(Value::Bool(positive))
                })
                .profile(ProfileKind::CountingCondition),
            )
            .build(DispatchConfig::default())
            .unwrap();
        let node = node(table);
        node.execute(&[Value::Int(1)]).unwrap();
        node.execute(&[Value::Int(2)]).unwrap();
        node.execute(&[Value::Int(-1)]).unwrap();
        assert_eq!(node.storage().load_primitive(0), Some(2));
        assert_eq!(node.storage().load_primitive(1), Some(1));
    }

    #[test]
    fn test_cache_keyed_instances() {
        let table = SpecializationTable::builder("Keyed", 1)
            .specialization(
                Specialization::new("cached", |c| Ok(c.cached(0).clone()))
                    .cache(CacheParam::new("key", "x", |s| Ok(s.arg(0).clone())))
                    .guard(
                        Guard::new("same", |s| s.arg(0) == s.cached(0))
                            .reads(crate::Reads::ARGS | crate::Reads::CACHED),
                    )
                    .limit(2),
            )
            .build(DispatchConfig::default())
            .unwrap();
        let node = node(table);
        node.execute(&[Value::Int(1)]).unwrap();
        node.execute(&[Value::Int(2)]).unwrap();
        node.execute(&[Value::Int(1)]).unwrap();
        assert_eq!(node.instances().len(), 2);
        assert!(node.execute(&[Value::Int(3)]).unwrap_err().is_unsupported());
    }
}
