//! The validated specialization table.
//!
//! A [`TableBuilder`] collects specializations and implicit casts in
//! declaration order; [`TableBuilder::build`] checks every configuration rule
//! once and precomputes what dispatch needs at run time:
//!
//! - the transitive `replaces` closure of each specialization
//! - guard phases (before / after cache initialization) and the dynamic
//!   guards the fast path re-evaluates
//! - effective instance limits and shared cache slots
//! - the state-bit layout: an active bit per specialization, an excluded bit
//!   per excludable one, and the inlined profiles
//!
//! A table is immutable once built and shared by every node created from it.

use crate::guard::{dynamic_binds, reads_dynamic};
use crate::report::{PolymorphismHook, PolymorphismReport};
use crate::specialization::{InlinedProfile, ProfileKind, Specialization};
use morph_core::{ConfigError, DispatchConfig, DispatchError, Value, ValueType};
use morph_inline::{
    BitRange, BranchProfile, ConditionProfile, CountingConditionProfile, InlineStorage,
    InlineTarget, RegionLayout, StorageWidth,
};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Arguments after implicit casts.
pub(crate) type ArgVec = SmallVec<[Value; 4]>;

// =============================================================================
// Implicit Cast
// =============================================================================

/// Converts a value; `None` declines the conversion.
pub type CastFn = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// A declared conversion from one accepted input type to a parameter type.
#[derive(Clone)]
pub struct ImplicitCast {
    from: ValueType,
    to: ValueType,
    convert: CastFn,
}

impl ImplicitCast {
    /// Declare a cast from `from` to `to`.
    pub fn new<F>(from: ValueType, to: ValueType, convert: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            from,
            to,
            convert: Arc::new(convert),
        }
    }

    /// Source type.
    pub fn from_type(&self) -> ValueType {
        self.from
    }

    /// Target type.
    pub fn to_type(&self) -> ValueType {
        self.to
    }
}

impl fmt::Debug for ImplicitCast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImplicitCast({} -> {})", self.from, self.to)
    }
}

// =============================================================================
// Entry
// =============================================================================

/// A specialization plus everything precomputed for it.
pub(crate) struct SpecEntry {
    pub(crate) spec: Specialization,
    pub(crate) active: BitRange,
    pub(crate) excluded: Option<BitRange>,
    /// Transitive `replaces` closure, ascending.
    pub(crate) replaces: Vec<usize>,
    /// Some other specialization replaces this one.
    pub(crate) replaced: bool,
    pub(crate) limit: usize,
    pub(crate) generic: bool,
    pub(crate) bind_base: usize,
    pub(crate) pre_guards: Vec<usize>,
    pub(crate) cached_guards: Vec<usize>,
    pub(crate) dynamic_guards: Vec<usize>,
    pub(crate) shared_slots: Vec<Option<usize>>,
    pub(crate) static_assumptions: Vec<usize>,
    pub(crate) aot_ready: bool,
    pub(crate) profiles: Vec<InlinedProfile>,
}

// =============================================================================
// Table
// =============================================================================

/// An immutable, validated set of specializations.
pub struct SpecializationTable {
    id: u64,
    name: String,
    arity: usize,
    config: DispatchConfig,
    entries: Vec<SpecEntry>,
    order: Vec<usize>,
    casts: Vec<ImplicitCast>,
    shared_groups: Vec<String>,
    layout: RegionLayout,
    bind_count: usize,
    fallback: Option<usize>,
    polymorphism: PolymorphismHook,
}

impl SpecializationTable {
    /// Start declaring a table for an operation taking `arity` arguments.
    pub fn builder(name: impl Into<String>, arity: usize) -> TableBuilder {
        TableBuilder {
            name: name.into(),
            arity,
            specs: Vec::new(),
            casts: Vec::new(),
            polymorphism: PolymorphismHook::new(),
        }
    }

    /// Unique id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Operation name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of arguments.
    #[inline]
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Configuration shared by nodes of this table.
    #[inline]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Whether nodes of this table report polymorphism to a listener.
    pub fn reports_polymorphism(&self) -> bool {
        self.polymorphism.is_enabled()
    }

    #[inline]
    pub(crate) fn polymorphism(&self) -> &PolymorphismHook {
        &self.polymorphism
    }

    /// Number of specializations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table declares no specialization.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Specialization names in declaration order.
    pub fn specialization_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.spec.name()).collect()
    }

    /// Index of the named specialization.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.spec.name() == name)
    }

    /// Specialization at `index`.
    pub fn specialization(&self, index: usize) -> Option<&Specialization> {
        self.entries.get(index).map(|e| &e.spec)
    }

    /// Index of the fallback specialization.
    pub fn fallback(&self) -> Option<usize> {
        self.fallback
    }

    /// Whether specialization `index` replaces something and caches nothing.
    pub fn is_generic(&self, index: usize) -> bool {
        self.entries.get(index).is_some_and(|e| e.generic)
    }

    /// Effective instance limit of specialization `index`.
    pub fn limit_of(&self, index: usize) -> Option<usize> {
        self.entries.get(index).map(|e| e.limit)
    }

    /// Transitive replacement set of specialization `index`.
    pub fn replaced_by(&self, index: usize) -> &[usize] {
        self.entries
            .get(index)
            .map(|e| e.replaces.as_slice())
            .unwrap_or(&[])
    }

    /// Declared implicit casts.
    pub fn casts(&self) -> &[ImplicitCast] {
        &self.casts
    }

    /// Names of shared cache groups.
    pub fn shared_groups(&self) -> &[String] {
        &self.shared_groups
    }

    /// State bits claimed per node.
    pub fn state_bits_used(&self) -> u32 {
        self.layout.allocator().used_bits()
    }

    /// Narrowest storage holding the state bits.
    pub fn storage_width(&self) -> StorageWidth {
        self.layout.allocator().width()
    }

    #[inline]
    pub(crate) fn entry(&self, index: usize) -> &SpecEntry {
        &self.entries[index]
    }

    #[inline]
    pub(crate) fn entries(&self) -> &[SpecEntry] {
        &self.entries
    }

    /// Evaluation order: declaration order with the fallback last.
    #[inline]
    pub(crate) fn order(&self) -> &[usize] {
        &self.order
    }

    #[inline]
    pub(crate) fn bind_count(&self) -> usize {
        self.bind_count
    }

    pub(crate) fn new_storage(&self) -> InlineStorage {
        self.layout.storage(self.config.verify_bits)
    }

    /// Convert `args` to the parameter types of specialization `index`.
    ///
    /// Casts are tried in declared order; the first one accepting a value
    /// wins. `None` when some argument can't be converted.
    pub(crate) fn cast_args(&self, index: usize, args: &[Value]) -> Option<ArgVec> {
        let params = &self.entries.get(index)?.spec.params;
        let mut out = ArgVec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let actual = arg.value_type();
            match params.get(i).copied().flatten() {
                None => out.push(arg.clone()),
                Some(ty) if ty == actual => out.push(arg.clone()),
                Some(ty) => {
                    let converted = self
                        .casts
                        .iter()
                        .filter(|c| c.from == actual && c.to == ty)
                        .find_map(|c| (c.convert)(arg))?;
                    out.push(converted);
                }
            }
        }
        Some(out)
    }
}

impl fmt::Debug for SpecializationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecializationTable")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("specializations", &self.specialization_names())
            .field("casts", &self.casts)
            .field("state_bits", &self.state_bits_used())
            .field("reports_polymorphism", &self.reports_polymorphism())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Collects declarations for a [`SpecializationTable`].
#[derive(Debug)]
pub struct TableBuilder {
    name: String,
    arity: usize,
    specs: Vec<Specialization>,
    casts: Vec<ImplicitCast>,
    polymorphism: PolymorphismHook,
}

impl TableBuilder {
    /// Append a specialization.
    pub fn specialization(mut self, spec: Specialization) -> Self {
        self.specs.push(spec);
        self
    }

    /// Append an implicit cast.
    pub fn cast(mut self, cast: ImplicitCast) -> Self {
        self.casts.push(cast);
        self
    }

    /// Report nodes of this table that become polymorphic or activate a
    /// megamorphic specialization.
    pub fn report_polymorphism<F>(mut self, listener: F) -> Self
    where
        F: Fn(&PolymorphismReport<'_>) + Send + Sync + 'static,
    {
        self.polymorphism.set(Arc::new(listener));
        self
    }

    /// Validate and freeze the table.
    pub fn build(self, config: DispatchConfig) -> Result<Arc<SpecializationTable>, ConfigError> {
        let name = self.name.clone();
        match self.build_inner(config) {
            Ok(table) => {
                debug!(
                    table = %table.name,
                    specializations = table.entries.len(),
                    state_bits = table.state_bits_used(),
                    "specialization table built"
                );
                Ok(Arc::new(table))
            }
            Err(e) => {
                warn!(table = %name, error = %e, "invalid specialization table");
                Err(e)
            }
        }
    }

    fn build_inner(self, config: DispatchConfig) -> Result<SpecializationTable, ConfigError> {
        let TableBuilder {
            name,
            arity,
            mut specs,
            casts,
            mut polymorphism,
        } = self;

        // Parameter lists.
        for spec in &mut specs {
            if spec.params.is_empty() {
                spec.params = vec![None; arity];
            } else if spec.params.len() != arity {
                return Err(ConfigError::ParamCountMismatch {
                    specialization: spec.name.clone(),
                    expected: arity,
                    actual: spec.params.len(),
                });
            }
        }

        // Names and fallback.
        let mut index: FxHashMap<String, usize> = FxHashMap::default();
        let mut fallback: Option<usize> = None;
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(ConfigError::DuplicateSpecialization {
                    table: name,
                    name: spec.name.clone(),
                });
            }
            if spec.fallback {
                if let Some(first) = fallback {
                    return Err(ConfigError::MultipleFallbacks {
                        table: name,
                        first: specs[first].name.clone(),
                        second: spec.name.clone(),
                    });
                }
                fallback = Some(i);
            }
        }

        // Replaces graph.
        let mut edges: Vec<Vec<usize>> = Vec::with_capacity(specs.len());
        for spec in &specs {
            let mut targets = Vec::with_capacity(spec.replaces.len());
            for target in &spec.replaces {
                let t = *index
                    .get(target)
                    .ok_or_else(|| ConfigError::UnknownReplaceTarget {
                        specialization: spec.name.clone(),
                        target: target.clone(),
                    })?;
                targets.push(t);
            }
            edges.push(targets);
        }
        if let Some(cycle) = find_cycle(&edges) {
            return Err(ConfigError::ReplacesCycle {
                path: cycle.iter().map(|&i| specs[i].name.clone()).collect(),
            });
        }
        for (i, targets) in edges.iter().enumerate() {
            if let Some(&t) = targets.iter().find(|&&t| t > i) {
                return Err(ConfigError::ReplacesForwardReference {
                    specialization: specs[i].name.clone(),
                    target: specs[t].name.clone(),
                });
            }
        }

        // Targets precede their replacers, so one forward pass closes the graph.
        let mut closures: Vec<Vec<usize>> = Vec::with_capacity(specs.len());
        let mut replaced = vec![false; specs.len()];
        for targets in &edges {
            let mut set: FxHashSet<usize> = FxHashSet::default();
            for &t in targets {
                set.insert(t);
                set.extend(closures[t].iter().copied());
            }
            let mut closure: Vec<usize> = set.into_iter().collect();
            closure.sort_unstable();
            for &t in &closure {
                replaced[t] = true;
            }
            closures.push(closure);
        }

        for (i, spec) in specs.iter().enumerate() {
            if !spec.rewrite_on.is_empty() && !replaced[i] {
                return Err(ConfigError::RewriteWithoutReplacement {
                    specialization: spec.name.clone(),
                });
            }
        }

        // Binds, guards, caches, assumptions.
        let mut dynamic: Vec<Vec<bool>> = Vec::with_capacity(specs.len());
        for spec in &specs {
            validate_binds(spec)?;
            let flags = dynamic_binds(&spec.binds);
            for expr in &spec.assumptions {
                if reads_dynamic(expr.reads, &expr.binds, &flags) {
                    return Err(ConfigError::DynamicBindInStaticContext {
                        specialization: spec.name.clone(),
                        expression: expr.name.clone(),
                    });
                }
            }
            dynamic.push(flags);
        }

        let limits: Vec<usize> = specs
            .iter()
            .zip(&dynamic)
            .map(|(spec, flags)| {
                let keyed = spec
                    .cache
                    .iter()
                    .any(|p| reads_dynamic(p.reads, &p.binds, flags));
                if keyed {
                    spec.limit.unwrap_or(config.default_limit).max(1)
                } else {
                    1
                }
            })
            .collect();

        // Shared cache groups.
        let mut shared_groups: Vec<String> = Vec::new();
        let mut shared_slots: Vec<Vec<Option<usize>>> = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let mut slots = Vec::with_capacity(spec.cache.len());
            for param in &spec.cache {
                let Some(group) = &param.shared else {
                    slots.push(None);
                    continue;
                };
                if limits[i] > 1 {
                    return Err(ConfigError::IllegalSharingGroup {
                        group: group.clone(),
                        reason: format!(
                            "specialization '{}' may create {} instances",
                            spec.name, limits[i]
                        ),
                    });
                }
                let slot = match shared_groups.iter().position(|g| g == group) {
                    Some(slot) => slot,
                    None => {
                        shared_groups.push(group.clone());
                        shared_groups.len() - 1
                    }
                };
                slots.push(Some(slot));
            }
            shared_slots.push(slots);
        }
        for group in &shared_groups {
            let mut first: Option<(&str, &crate::cache::CacheParam)> = None;
            for spec in &specs {
                for param in spec.cache.iter().filter(|p| p.shared.as_ref() == Some(group)) {
                    match first {
                        None => first = Some((&spec.name, param)),
                        Some((owner, reference)) => {
                            if reference.ty != param.ty || reference.expr != param.expr {
                                return Err(ConfigError::IllegalSharingGroup {
                                    group: group.clone(),
                                    reason: format!(
                                        "'{}' and '{}' declare different cache types or initializers",
                                        owner, spec.name
                                    ),
                                });
                            }
                        }
                    }
                }
            }
        }

        // State layout.
        let mut layout = RegionLayout::new(config.state_capacity_bits);
        let mut entries = Vec::with_capacity(specs.len());
        let mut bind_base = 0;
        for (i, (mut spec, (replaces, (flags, slots)))) in specs
            .into_iter()
            .zip(closures.into_iter().zip(dynamic.into_iter().zip(shared_slots)))
            .enumerate()
        {
            let active = layout.claim_state(&format!("{}.active", spec.name), 1)?;
            let excluded = if replaced[i] || !spec.rewrite_on.is_empty() {
                Some(layout.claim_state(&format!("{}.excluded", spec.name), 1)?)
            } else {
                None
            };
            let mut profiles = Vec::with_capacity(spec.profiles.len());
            for kind in &spec.profiles {
                let target = layout.inline(&kind.spec())?;
                profiles.push(bind_profile(*kind, &target)?);
            }

            let mut pre_guards = Vec::new();
            let mut cached_guards = Vec::new();
            let mut dynamic_guards = Vec::new();
            for (g, guard) in spec.guards.iter().enumerate() {
                if guard.reads.contains(crate::guard::Reads::CACHED) {
                    cached_guards.push(g);
                } else {
                    pre_guards.push(g);
                }
                if reads_dynamic(guard.reads, &guard.binds, &flags) {
                    dynamic_guards.push(g);
                }
            }
            let static_assumptions = spec
                .assumptions
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.reads_cached())
                .map(|(k, _)| k)
                .collect();
            let aot_ready = !spec
                .cache
                .iter()
                .any(|p| reads_dynamic(p.reads, &p.binds, &flags));

            if spec.unroll > limits[i] {
                debug!(
                    specialization = %spec.name,
                    unroll = spec.unroll,
                    limit = limits[i],
                    "unroll clamped to limit"
                );
                spec.unroll = limits[i];
            }

            let generic = !replaces.is_empty() && spec.cache.is_empty();
            let binds = spec.binds.len();
            entries.push(SpecEntry {
                spec,
                active,
                excluded,
                replaces,
                replaced: replaced[i],
                limit: limits[i],
                generic,
                bind_base,
                pre_guards,
                cached_guards,
                dynamic_guards,
                shared_slots: slots,
                static_assumptions,
                aot_ready,
                profiles,
            });
            bind_base += binds;
        }

        let mut order: Vec<usize> = (0..entries.len()).filter(|&i| Some(i) != fallback).collect();
        order.extend(fallback);

        if let Some(first) = entries.first() {
            polymorphism.disable_if_monomorphic(entries.len(), first.limit);
        }

        Ok(SpecializationTable {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            arity,
            config,
            entries,
            order,
            casts,
            shared_groups,
            layout,
            bind_count: bind_base,
            fallback,
            polymorphism,
        })
    }
}

/// Binds may only read earlier binds; guards, caches and assumption
/// expressions may only read declared binds.
fn validate_binds(spec: &Specialization) -> Result<(), ConfigError> {
    let forward = |owner: &str, index: usize| ConfigError::BindForwardReference {
        specialization: spec.name.clone(),
        bind: owner.to_string(),
        references: spec
            .binds
            .get(index)
            .map(|b| b.name.clone())
            .unwrap_or_else(|| format!("#{}", index)),
    };
    for (b, bind) in spec.binds.iter().enumerate() {
        if let Some(&d) = bind.deps.iter().find(|&&d| d >= b) {
            return Err(forward(&bind.name, d));
        }
    }
    let count = spec.binds.len();
    for guard in &spec.guards {
        if let Some(&d) = guard.binds.iter().find(|&&d| d >= count) {
            return Err(forward(&guard.name, d));
        }
    }
    for param in &spec.cache {
        if let Some(&d) = param.binds.iter().find(|&&d| d >= count) {
            return Err(forward(&param.name, d));
        }
    }
    for expr in &spec.assumptions {
        if let Some(&d) = expr.binds.iter().find(|&&d| d >= count) {
            return Err(forward(&expr.name, d));
        }
    }
    Ok(())
}

fn bind_profile(kind: ProfileKind, target: &InlineTarget) -> Result<InlinedProfile, ConfigError> {
    let bound = match kind {
        ProfileKind::Branch => BranchProfile::inline(target).map(InlinedProfile::Branch),
        ProfileKind::Condition => ConditionProfile::inline(target).map(InlinedProfile::Condition),
        ProfileKind::CountingCondition => {
            CountingConditionProfile::inline(target).map(InlinedProfile::Counting)
        }
    };
    bound.map_err(|e| match e {
        DispatchError::Config(c) => c,
        _ => ConfigError::InvalidBitRange {
            offset: 0,
            len: 0,
            reason: "inlined profile does not match its reserved fields",
        },
    })
}

/// A cycle in the `replaces` graph, as a closed path of indices.
fn find_cycle(edges: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    fn visit(
        node: usize,
        edges: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::Active;
        stack.push(node);
        for &next in &edges[node] {
            match marks[next] {
                Mark::Active => {
                    let start = stack.iter().position(|&n| n == next)?;
                    let mut path = stack[start..].to_vec();
                    path.push(next);
                    return Some(path);
                }
                Mark::New => {
                    if let Some(path) = visit(next, edges, marks, stack) {
                        return Some(path);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; edges.len()];
    let mut stack = Vec::new();
    for node in 0..edges.len() {
        if marks[node] == Mark::New {
            if let Some(path) = visit(node, edges, &mut marks, &mut stack) {
                return Some(path);
            }
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
