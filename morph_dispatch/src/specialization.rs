//! Specialization declarations and the call context handed to bodies.

use crate::assumption::AssumptionExpr;
use crate::cache::CacheParam;
use crate::guard::{Bind, Guard, Scope};
use crate::node::{DispatchNode, Executable};
use crate::table::SpecializationTable;
use crate::uncached::UncachedNode;
use morph_core::{DispatchError, Frame, NodeId, Throw, Value, ValueType};
use morph_inline::{
    BranchProfile, ConditionProfile, CountingConditionProfile, InlinableSpec, InlineStorage,
};
use std::fmt;
use std::sync::Arc;

/// A specialization body.
pub type BodyFn = Arc<dyn Fn(&SpecializationCall<'_>) -> Result<Value, Throw> + Send + Sync>;

/// Produces the table of a child node.
pub type ChildFactory = Arc<dyn Fn() -> Arc<SpecializationTable> + Send + Sync>;

// =============================================================================
// Children
// =============================================================================

/// A child node created with each new instance.
#[derive(Clone)]
pub struct ChildSpec {
    pub(crate) name: String,
    pub(crate) adopt: bool,
    pub(crate) factory: ChildFactory,
}

impl ChildSpec {
    /// Declare a child adopted by the owning node.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<SpecializationTable> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            adopt: true,
            factory: Arc::new(factory),
        }
    }

    /// Do not adopt the child into the owning node.
    pub fn detached(mut self) -> Self {
        self.adopt = false;
        self
    }

    /// Child name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the child is adopted.
    pub fn adopts(&self) -> bool {
        self.adopt
    }
}

impl fmt::Debug for ChildSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildSpec")
            .field("name", &self.name)
            .field("adopt", &self.adopt)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Profiles
// =============================================================================

/// An inlined profile requested by a specialization body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileKind {
    /// Branch entered once.
    Branch,
    /// Condition outcomes seen.
    Condition,
    /// Condition outcome counts.
    CountingCondition,
}

impl ProfileKind {
    pub(crate) fn spec(self) -> InlinableSpec {
        match self {
            ProfileKind::Branch => BranchProfile::spec(),
            ProfileKind::Condition => ConditionProfile::spec(),
            ProfileKind::CountingCondition => CountingConditionProfile::spec(),
        }
    }
}

/// A profile bound to its slots in the node storage.
#[derive(Debug, Clone, Copy)]
pub(crate) enum InlinedProfile {
    Branch(BranchProfile),
    Condition(ConditionProfile),
    Counting(CountingConditionProfile),
}

// =============================================================================
// Specialization
// =============================================================================

/// One guarded implementation variant of an operation.
#[derive(Clone)]
pub struct Specialization {
    pub(crate) name: String,
    pub(crate) params: Vec<Option<ValueType>>,
    pub(crate) guards: Vec<Guard>,
    pub(crate) binds: Vec<Bind>,
    pub(crate) cache: Vec<CacheParam>,
    pub(crate) children: Vec<ChildSpec>,
    pub(crate) assumptions: Vec<AssumptionExpr>,
    pub(crate) replaces: Vec<String>,
    pub(crate) rewrite_on: Vec<&'static str>,
    pub(crate) limit: Option<usize>,
    pub(crate) unroll: usize,
    pub(crate) fallback: bool,
    pub(crate) megamorphic: bool,
    pub(crate) profiles: Vec<ProfileKind>,
    pub(crate) body: BodyFn,
}

impl Specialization {
    /// Declare a specialization accepting any argument types.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&SpecializationCall<'_>) -> Result<Value, Throw> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params: Vec::new(),
            guards: Vec::new(),
            binds: Vec::new(),
            cache: Vec::new(),
            children: Vec::new(),
            assumptions: Vec::new(),
            replaces: Vec::new(),
            rewrite_on: Vec::new(),
            limit: None,
            unroll: 0,
            fallback: false,
            megamorphic: false,
            profiles: Vec::new(),
            body: Arc::new(body),
        }
    }

    /// Per-argument accepted types; `None` accepts anything.
    pub fn params(mut self, params: impl IntoIterator<Item = Option<ValueType>>) -> Self {
        self.params = params.into_iter().collect();
        self
    }

    /// Every argument has a declared type.
    pub fn typed(self, types: impl IntoIterator<Item = ValueType>) -> Self {
        self.params(types.into_iter().map(Some))
    }

    /// Add a guard.
    pub fn guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    /// Add a bind; its index is the number of binds declared before it.
    pub fn bind(mut self, bind: Bind) -> Self {
        self.binds.push(bind);
        self
    }

    /// Add a cached value.
    pub fn cache(mut self, param: CacheParam) -> Self {
        self.cache.push(param);
        self
    }

    /// Add a child node.
    pub fn child(mut self, child: ChildSpec) -> Self {
        self.children.push(child);
        self
    }

    /// Add an assumption expression.
    pub fn assumption(mut self, expr: AssumptionExpr) -> Self {
        self.assumptions.push(expr);
        self
    }

    /// Supersede the named, earlier-declared specialization.
    pub fn replaces(mut self, name: impl Into<String>) -> Self {
        self.replaces.push(name.into());
        self
    }

    /// Exclude this specialization when its body throws `kind`.
    pub fn rewrite_on(mut self, kind: &'static str) -> Self {
        self.rewrite_on.push(kind);
        self
    }

    /// Maximum number of instances.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Number of instances to keep unrolled in the parent.
    pub fn unroll(mut self, unroll: usize) -> Self {
        self.unroll = unroll;
        self
    }

    /// Make this the table's fallback.
    pub fn fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    /// Report the node as megamorphic whenever this specialization activates.
    pub fn megamorphic(mut self) -> Self {
        self.megamorphic = true;
        self
    }

    /// Request an inlined profile.
    pub fn profile(mut self, kind: ProfileKind) -> Self {
        self.profiles.push(kind);
        self
    }

    /// Name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the fallback.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Whether activation is reported as megamorphic.
    pub fn is_megamorphic(&self) -> bool {
        self.megamorphic
    }

    /// Declared cache parameters.
    pub fn cache_params(&self) -> &[CacheParam] {
        &self.cache
    }

    /// Names of replaced specializations.
    pub fn replaced_names(&self) -> &[String] {
        &self.replaces
    }

    /// Exception kinds triggering a rewrite.
    pub fn rewrite_kinds(&self) -> &[&'static str] {
        &self.rewrite_on
    }

    /// Declared unroll count.
    pub fn unroll_count(&self) -> usize {
        self.unroll
    }

    #[inline]
    pub(crate) fn rewrites_on(&self, kind: &str) -> bool {
        self.rewrite_on.iter().any(|k| *k == kind)
    }
}

impl fmt::Debug for Specialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Specialization")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("guards", &self.guards)
            .field("binds", &self.binds)
            .field("cache", &self.cache)
            .field("children", &self.children)
            .field("replaces", &self.replaces)
            .field("rewrite_on", &self.rewrite_on)
            .field("limit", &self.limit)
            .field("fallback", &self.fallback)
            .field("megamorphic", &self.megamorphic)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Call Context
// =============================================================================

#[derive(Clone, Copy)]
pub(crate) enum Children<'a> {
    Cached(&'a [Arc<DispatchNode>]),
    Uncached(&'a [Arc<UncachedNode>]),
}

/// What a specialization body sees.
pub struct SpecializationCall<'a> {
    pub(crate) node: NodeId,
    pub(crate) specialization: &'a str,
    pub(crate) scope: Scope<'a>,
    pub(crate) children: Children<'a>,
    pub(crate) storage: Option<&'a InlineStorage>,
    pub(crate) profiles: &'a [InlinedProfile],
}

impl<'a> SpecializationCall<'a> {
    /// Node executing the body.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Name of the running specialization.
    pub fn specialization(&self) -> &'a str {
        self.specialization
    }

    /// Arguments after implicit casts.
    #[inline]
    pub fn args(&self) -> &'a [Value] {
        self.scope.args()
    }

    /// Argument `index`, or `Null`.
    #[inline]
    pub fn arg(&self, index: usize) -> &'a Value {
        self.scope.arg(index)
    }

    /// Cached value `index`, or `Null`.
    #[inline]
    pub fn cached(&self, index: usize) -> &'a Value {
        self.scope.cached(index)
    }

    /// All cached values of the instance.
    pub fn cached_values(&self) -> &'a [Value] {
        self.scope.cached_values()
    }

    /// Bind `index`, memoized for this dispatch attempt.
    #[inline]
    pub fn bind(&self, index: usize) -> Value {
        self.scope.bind(index)
    }

    /// Invocation frame.
    pub fn frame(&self) -> Option<&'a Frame> {
        self.scope.frame()
    }

    /// Number of child nodes.
    pub fn child_count(&self) -> usize {
        match self.children {
            Children::Cached(c) => c.len(),
            Children::Uncached(c) => c.len(),
        }
    }

    /// Child `index`.
    pub fn child(&self, index: usize) -> Result<&'a dyn Executable, Throw> {
        let child: Option<&'a dyn Executable> = match self.children {
            Children::Cached(c) => c.get(index).map(|n| n.as_ref() as &dyn Executable),
            Children::Uncached(c) => c.get(index).map(|n| n.as_ref() as &dyn Executable),
        };
        child.ok_or_else(|| {
            Throw::Error(DispatchError::TypeMismatch {
                expected: format!("child {}", index),
                actual: format!("{} children", self.child_count()),
            })
        })
    }

    /// Execute child `index`.
    pub fn execute_child(&self, index: usize, args: &[Value]) -> Result<Value, Throw> {
        Ok(self.child(index)?.dispatch(self.frame(), args)?)
    }

    // =========================================================================
    // Profiles
    // =========================================================================

    /// Whether inlined profiles record anything (false for uncached nodes).
    pub fn profiling_enabled(&self) -> bool {
        self.storage.is_some()
    }

    /// Mark branch profile `index` entered.
    pub fn enter_branch(&self, index: usize) {
        if let (Some(storage), Some(InlinedProfile::Branch(p))) =
            (self.storage, self.profiles.get(index))
        {
            p.enter(storage);
        }
    }

    /// Whether branch profile `index` was entered.
    pub fn was_entered(&self, index: usize) -> bool {
        match (self.storage, self.profiles.get(index)) {
            (Some(storage), Some(InlinedProfile::Branch(p))) => p.was_entered(storage),
            _ => false,
        }
    }

    /// Record `value` in condition profile `index`.
    pub fn profile_condition(&self, index: usize, value: bool) -> bool {
        if let (Some(storage), Some(InlinedProfile::Condition(p))) =
            (self.storage, self.profiles.get(index))
        {
            return p.profile(storage, value);
        }
        value
    }

    /// Record `value` in counting profile `index`.
    pub fn count_condition(&self, index: usize, value: bool) -> bool {
        if let (Some(storage), Some(InlinedProfile::Counting(p))) =
            (self.storage, self.profiles.get(index))
        {
            return p.profile(storage, value).unwrap_or(value);
        }
        value
    }

    /// Observed `(true, false)` counts of counting profile `index`.
    pub fn condition_counts(&self, index: usize) -> Option<(i32, i32)> {
        match (self.storage, self.profiles.get(index)) {
            (Some(storage), Some(InlinedProfile::Counting(p))) => p.counts(storage).ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for SpecializationCall<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecializationCall")
            .field("node", &self.node)
            .field("specialization", &self.specialization)
            .field("scope", &self.scope)
            .field("children", &self.child_count())
            .finish_non_exhaustive()
    }
}
