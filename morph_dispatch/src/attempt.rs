//! Per-call evaluation state shared by cached and uncached dispatch.
//!
//! One [`Attempt`] lives for a single `execute` call (or one retry after a
//! rewrite). It memoizes the cast arguments of each specialization and every
//! bind value, so a bind is computed at most once no matter how many guards,
//! caches or candidate specializations read it.

use crate::assumption::AssumptionSet;
use crate::cache::{CacheSlotStore, CachedValues};
use crate::guard::{BindFrame, Scope};
use crate::table::{ArgVec, SpecializationTable};
use morph_core::{DispatchError, DispatchResult, Frame, Value};
use smallvec::SmallVec;
use std::cell::OnceCell;

pub(crate) struct Attempt<'a> {
    pub(crate) table: &'a SpecializationTable,
    pub(crate) args: &'a [Value],
    pub(crate) frame: Option<&'a Frame>,
    casted: SmallVec<[OnceCell<Option<ArgVec>>; 8]>,
    binds: BindFrame,
}

impl<'a> Attempt<'a> {
    pub(crate) fn new(
        table: &'a SpecializationTable,
        args: &'a [Value],
        frame: Option<&'a Frame>,
    ) -> Self {
        Self {
            table,
            args,
            frame,
            casted: (0..table.len()).map(|_| OnceCell::new()).collect(),
            binds: BindFrame::new(table.bind_count()),
        }
    }

    /// An attempt without arguments, used for ahead-of-time preparation.
    ///
    /// Every specialization sees an empty argument list; reads fall back
    /// to `Null`.
    pub(crate) fn detached(table: &'a SpecializationTable) -> Self {
        Self {
            table,
            args: &[],
            frame: None,
            casted: (0..table.len())
                .map(|_| OnceCell::from(Some(ArgVec::new())))
                .collect(),
            binds: BindFrame::new(table.bind_count()),
        }
    }

    /// Arguments cast for specialization `index`, or `None` if a cast fails.
    pub(crate) fn args_for(&self, index: usize) -> Option<&[Value]> {
        self.casted
            .get(index)?
            .get_or_init(|| self.table.cast_args(index, self.args))
            .as_deref()
    }

    pub(crate) fn scope(&self, index: usize) -> Option<Scope<'_>> {
        let args = self.args_for(index)?;
        let entry = self.table.entry(index);
        Some(Scope::new(
            args,
            self.frame,
            &self.binds,
            entry.bind_base,
            &entry.spec.binds,
        ))
    }

    #[cfg(test)]
    pub(crate) fn binds_evaluated(&self) -> usize {
        self.binds.evaluated()
    }

    // =========================================================================
    // Guards
    // =========================================================================

    /// Casts succeed and every guard not reading cached values passes.
    pub(crate) fn accepts_pre(&self, index: usize) -> bool {
        let Some(scope) = self.scope(index) else {
            return false;
        };
        let entry = self.table.entry(index);
        entry
            .pre_guards
            .iter()
            .all(|&g| entry.spec.guards[g].test(&scope))
    }

    /// Every guard that must be re-checked on a fast-path hit passes.
    pub(crate) fn dynamic_guards_pass(&self, index: usize, cached: &[Value]) -> bool {
        let Some(scope) = self.scope(index) else {
            return false;
        };
        let scope = scope.with_cached(cached);
        let entry = self.table.entry(index);
        entry
            .dynamic_guards
            .iter()
            .all(|&g| entry.spec.guards[g].test(&scope))
    }

    /// Assumption expressions not reading cached values currently hold.
    pub(crate) fn static_assumptions_hold(&self, index: usize) -> bool {
        let Some(scope) = self.scope(index) else {
            return false;
        };
        let entry = self.table.entry(index);
        entry
            .static_assumptions
            .iter()
            .all(|&k| entry.spec.assumptions[k].evaluate(&scope).is_valid())
    }

    /// The fallback applies when no other non-excluded specialization
    /// would accept these arguments.
    pub(crate) fn fallback_applies<F>(&self, excluded: F) -> bool
    where
        F: Fn(usize) -> bool,
    {
        self.table
            .order()
            .iter()
            .copied()
            .filter(|&i| !self.table.entry(i).spec.fallback)
            .all(|i| excluded(i) || !(self.accepts_pre(i) && self.static_assumptions_hold(i)))
    }

    // =========================================================================
    // Cache Initialization
    // =========================================================================

    /// Initialize the cached values and assumptions of specialization `index`.
    ///
    /// Cache parameters run in declaration order, each seeing the ones
    /// before it. A value of a shared group is taken from `shared` when
    /// already published there. Returns `None` when a cached guard fails or
    /// an assumption is already invalid.
    pub(crate) fn initialize(
        &self,
        index: usize,
        shared: Option<&CacheSlotStore>,
        check_guards: bool,
    ) -> DispatchResult<Option<(CachedValues, AssumptionSet)>> {
        let Some(scope) = self.scope(index) else {
            return Ok(None);
        };
        let entry = self.table.entry(index);

        let mut cached = CachedValues::new();
        for (p, param) in entry.spec.cache.iter().enumerate() {
            let slot = entry.shared_slots.get(p).copied().flatten();
            let published = match (slot, shared) {
                (Some(slot), Some(store)) => store.shared_value(slot),
                _ => None,
            };
            let value = match published {
                Some(value) => value,
                None => {
                    let value = param
                        .initialize(&scope.with_cached(&cached))
                        .map_err(DispatchError::from)?;
                    if param.never_default && value.is_default() {
                        return Err(DispatchError::NeverDefault {
                            specialization: entry.spec.name.clone(),
                            cache: param.name.clone(),
                        });
                    }
                    if let (Some(slot), Some(store)) = (slot, shared) {
                        store.publish_shared(slot, value.clone());
                    }
                    value
                }
            };
            cached.push(value);
        }

        let full = scope.with_cached(&cached);
        if check_guards
            && !entry
                .cached_guards
                .iter()
                .all(|&g| entry.spec.guards[g].test(&full))
        {
            return Ok(None);
        }

        let mut assumptions = AssumptionSet::new();
        for expr in &entry.spec.assumptions {
            assumptions.extend(expr.evaluate(&full));
        }
        if !assumptions.is_valid() {
            return Ok(None);
        }
        Ok(Some((cached, assumptions)))
    }
}
