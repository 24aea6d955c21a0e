//! Ahead-of-time preparation.
//!
//! Forces a node tree into a stable state before it first runs: each node
//! activates every specialization whose cached values and assumptions do
//! not depend on call arguments, then its freshly created children are
//! prepared the same way. Preparation takes each node's specialization lock
//! exactly like slow-path dispatch does.
//!
//! A node, or a table, that reappears below itself on the preparation stack
//! would expand forever and is rejected with [`ConfigError::AotRecursion`].

use crate::node::DispatchNode;
use morph_core::{ConfigError, DispatchResult, NodeId};
use std::sync::Arc;
use tracing::{debug, warn};

/// Prepare `node` and its subtree. Returns the number of nodes prepared.
pub fn prepare_for_aot(node: &Arc<DispatchNode>) -> DispatchResult<usize> {
    let mut stack = Vec::new();
    let prepared = prepare(node, &mut stack)?;
    debug!(node = %node.id(), table = %node.table().name(), prepared, "AOT preparation complete");
    Ok(prepared)
}

fn prepare(node: &Arc<DispatchNode>, stack: &mut Vec<(NodeId, u64)>) -> DispatchResult<usize> {
    let table_id = node.table().id();
    if stack
        .iter()
        .any(|&(id, table)| id == node.id() || table == table_id)
    {
        warn!(node = %node.id(), table = %node.table().name(), "recursive AOT preparation");
        return Err(ConfigError::AotRecursion {
            node: node.table().name().to_string(),
        }
        .into());
    }

    stack.push((node.id(), table_id));
    let children = node.prepare_static()?;
    let mut prepared = 1;
    for child in &children {
        prepared += prepare(child, stack)?;
    }
    stack.pop();
    Ok(prepared)
}
