//! The uncached dispatch variant.
//!
//! An [`UncachedNode`] evaluates its whole table on every call and keeps no
//! per-call-site state: no instances, no state bits, no profiles. It serves
//! code that runs too rarely to be worth specializing, and shares one node
//! per table.
//!
//! Differences from [`DispatchNode`](crate::DispatchNode):
//!
//! - specializations replaced by another one are never considered
//! - cache initializers run per call and their values are dropped afterwards
//! - a `rewrite_on` exception moves on to the next candidate of the same call
//! - children are created uncached; a child that must be adopted fails

use crate::attempt::Attempt;
use crate::node::Executable;
use crate::specialization::{Children, SpecializationCall};
use crate::table::SpecializationTable;
use morph_core::{
    DispatchError, DispatchResult, Frame, NodeId, Throw, UnsupportedSpecialization, Value,
};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// A stateless node evaluating its table on every call.
pub struct UncachedNode {
    table: Arc<SpecializationTable>,
}

impl UncachedNode {
    /// Uncached node for `table`.
    pub fn new(table: Arc<SpecializationTable>) -> Arc<Self> {
        Arc::new(Self { table })
    }

    /// Specialization table.
    pub fn table(&self) -> &Arc<SpecializationTable> {
        &self.table
    }

    /// Execute without a frame.
    pub fn execute(&self, args: &[Value]) -> DispatchResult<Value> {
        self.run(None, args)
    }

    /// Execute with a frame.
    pub fn execute_with_frame(&self, frame: &Frame, args: &[Value]) -> DispatchResult<Value> {
        self.run(Some(frame), args)
    }

    /// Uncached nodes have no parent to adopt into.
    pub fn adopt(&self, child: &dyn Executable) -> DispatchResult<()> {
        Err(DispatchError::UncachedAdoption {
            table: self.table.name().to_string(),
            child: child.name().to_string(),
        })
    }

    fn run(&self, frame: Option<&Frame>, args: &[Value]) -> DispatchResult<Value> {
        if args.len() != self.table.arity() {
            return Err(DispatchError::ArityMismatch {
                node: NodeId::DETACHED,
                name: self.table.name().to_string(),
                expected: self.table.arity(),
                actual: args.len(),
            });
        }

        let attempt = Attempt::new(&self.table, args, frame);
        let mut skipped: SmallVec<[bool; 8]> = self
            .table
            .entries()
            .iter()
            .map(|e| e.replaced)
            .collect();

        for &index in self.table.order() {
            if skipped[index] || !attempt.accepts_pre(index) {
                continue;
            }
            let entry = self.table.entry(index);
            if entry.spec.fallback && !attempt.fallback_applies(|i| skipped[i]) {
                continue;
            }
            let Some((cached, _assumptions)) = attempt.initialize(index, None, true)? else {
                continue;
            };
            let children = self.create_children(index)?;
            let Some(scope) = attempt.scope(index) else {
                continue;
            };
            let call = SpecializationCall {
                node: NodeId::DETACHED,
                specialization: &entry.spec.name,
                scope: scope.with_cached(&cached),
                children: Children::Uncached(&children),
                storage: None,
                profiles: &[],
            };
            trace!(table = %self.table.name(), specialization = %entry.spec.name, "uncached dispatch");
            match (entry.spec.body)(&call) {
                Ok(value) => return Ok(value),
                Err(Throw::Exception(e)) if entry.spec.rewrites_on(e.kind) => {
                    trace!(
                        table = %self.table.name(),
                        specialization = %entry.spec.name,
                        kind = e.kind,
                        "uncached rewrite"
                    );
                    skipped[index] = true;
                }
                Err(throw) => return Err(throw.into()),
            }
        }

        Err(UnsupportedSpecialization {
            node: NodeId::DETACHED,
            node_name: self.table.name().to_string(),
            args: args.to_vec(),
        }
        .into())
    }

    fn create_children(&self, index: usize) -> DispatchResult<SmallVec<[Arc<UncachedNode>; 2]>> {
        let entry = self.table.entry(index);
        let mut children = SmallVec::new();
        for child in &entry.spec.children {
            if child.adopt {
                return Err(DispatchError::UncachedAdoption {
                    table: self.table.name().to_string(),
                    child: child.name.clone(),
                });
            }
            children.push(UncachedNode::new((child.factory)()));
        }
        Ok(children)
    }
}

impl Executable for UncachedNode {
    fn dispatch(&self, frame: Option<&Frame>, args: &[Value]) -> DispatchResult<Value> {
        self.run(frame, args)
    }

    fn name(&self) -> &str {
        self.table.name()
    }
}

impl fmt::Debug for UncachedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UncachedNode")
            .field("table", &self.table.name())
            .finish()
    }
}
