//! Read-only introspection of dispatch nodes.
//!
//! Reports, per specialization, whether it is active or excluded at a node
//! and which values its instances cached. Binds are never reported; they
//! live only for one dispatch attempt.

use crate::node::{DispatchNode, DispatchState};
use crate::uncached::UncachedNode;
use morph_core::Value;

/// What a node knows about one specialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecializationInfo {
    /// Specialization name.
    pub name: String,
    /// Active bit set.
    pub active: bool,
    /// Excluded bit set.
    pub excluded: bool,
    /// Live instances.
    pub instance_count: usize,
    /// Instances kept unrolled in the node (at most the declared unroll count).
    pub unrolled: usize,
    /// Per instance, `(cache parameter, value)` pairs in declaration order.
    pub cached_data: Vec<Vec<(String, Value)>>,
}

/// Nodes that can describe their specialization state.
pub trait Introspectable {
    /// One entry per specialization, in declaration order.
    fn specializations(&self) -> Vec<SpecializationInfo>;

    /// Current dispatch state.
    fn dispatch_state(&self) -> DispatchState;

    /// Entry for the named specialization.
    fn specialization(&self, name: &str) -> Option<SpecializationInfo> {
        self.specializations().into_iter().find(|s| s.name == name)
    }
}

impl Introspectable for DispatchNode {
    fn specializations(&self) -> Vec<SpecializationInfo> {
        let snapshot = self.instances();
        let table = self.table();
        (0..table.len())
            .filter_map(|index| {
                let spec = table.specialization(index)?;
                let cached_data: Vec<Vec<(String, Value)>> = snapshot
                    .iter()
                    .filter(|i| i.specialization() == index && !i.is_removed())
                    .map(|i| {
                        spec.cache_params()
                            .iter()
                            .zip(i.cached())
                            .map(|(p, v)| (p.name().to_string(), v.clone()))
                            .collect()
                    })
                    .collect();
                Some(SpecializationInfo {
                    name: spec.name().to_string(),
                    active: self.is_active(index),
                    excluded: self.is_excluded(index),
                    instance_count: cached_data.len(),
                    unrolled: cached_data.len().min(spec.unroll_count()),
                    cached_data,
                })
            })
            .collect()
    }

    fn dispatch_state(&self) -> DispatchState {
        DispatchNode::dispatch_state(self)
    }
}

impl Introspectable for UncachedNode {
    /// Uncached nodes hold no instances; every specialization reports inactive.
    fn specializations(&self) -> Vec<SpecializationInfo> {
        self.table()
            .specialization_names()
            .into_iter()
            .map(|name| SpecializationInfo {
                name: name.to_string(),
                active: false,
                excluded: false,
                instance_count: 0,
                unrolled: 0,
                cached_data: Vec::new(),
            })
            .collect()
    }

    /// Uncached nodes always behave generically.
    fn dispatch_state(&self) -> DispatchState {
        DispatchState::Generic
    }
}
