//! Node arena.
//!
//! Dispatch nodes and the children their instances create form a tree.
//! The arena records that tree by [`NodeId`]: parent links for adoption,
//! child lists for release, and weak back-references for lookup. It never
//! keeps a node alive; nodes are owned by their cache instances (or by the
//! caller, for roots) and remove themselves when dropped.

use crate::node::DispatchNode;
use dashmap::DashMap;
use morph_core::NodeId;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Arena bookkeeping for one node.
#[derive(Debug, Clone)]
pub struct ArenaEntry {
    /// The node, if still alive.
    pub node: Weak<DispatchNode>,
    /// Table name of the node.
    pub table: String,
    /// Adopting parent.
    pub parent: Option<NodeId>,
    /// Adopted children.
    pub children: SmallVec<[NodeId; 4]>,
}

/// Registry of live nodes and their adoption tree.
#[derive(Debug)]
pub struct NodeArena {
    next_id: AtomicU32,
    entries: DashMap<NodeId, ArenaEntry, FxBuildHasher>,
}

impl NodeArena {
    /// Empty arena.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(0),
            entries: DashMap::with_hasher(FxBuildHasher),
        }
    }

    /// Empty arena behind an `Arc`, ready to hand to nodes.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a node and assign its id.
    pub fn register(&self, node: Weak<DispatchNode>, table: &str) -> NodeId {
        let id = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.insert(
            id,
            ArenaEntry {
                node,
                table: table.to_string(),
                parent: None,
                children: SmallVec::new(),
            },
        );
        id
    }

    /// Make `parent` the owner of `child`, detaching it from any previous
    /// parent. Returns false if either node is unknown or the link would
    /// form a cycle.
    pub fn adopt(&self, child: NodeId, parent: NodeId) -> bool {
        if child == parent
            || !self.entries.contains_key(&parent)
            || self.is_ancestor(child, parent)
        {
            return false;
        }
        // One shard guard at a time.
        let previous = match self.entries.get_mut(&child) {
            Some(mut entry) => entry.parent.replace(parent),
            None => return false,
        };
        if let Some(previous) = previous.filter(|p| *p != parent) {
            if let Some(mut old) = self.entries.get_mut(&previous) {
                old.children.retain(|c| *c != child);
            }
        }
        if let Some(mut entry) = self.entries.get_mut(&parent) {
            if !entry.children.contains(&child) {
                entry.children.push(child);
            }
        }
        true
    }

    /// Whether `ancestor` is on the parent chain of `node`.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.parent_of(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent_of(id);
        }
        false
    }

    /// Remove `id` and its adopted subtree from the arena.
    ///
    /// Returns the number of entries released.
    pub fn release(&self, id: NodeId) -> usize {
        let Some((_, entry)) = self.entries.remove(&id) else {
            return 0;
        };
        if let Some(parent) = entry.parent {
            if let Some(mut p) = self.entries.get_mut(&parent) {
                p.children.retain(|c| *c != id);
            }
        }
        1 + entry
            .children
            .iter()
            .map(|&child| self.release(child))
            .sum::<usize>()
    }

    /// Drop the entry of `id` only, orphaning its children.
    pub fn forget(&self, id: NodeId) {
        let Some((_, entry)) = self.entries.remove(&id) else {
            return;
        };
        if let Some(parent) = entry.parent {
            if let Some(mut p) = self.entries.get_mut(&parent) {
                p.children.retain(|c| *c != id);
            }
        }
        for child in entry.children {
            if let Some(mut c) = self.entries.get_mut(&child) {
                c.parent = None;
            }
        }
    }

    /// Parent of `id`.
    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.entries.get(&id).and_then(|e| e.parent)
    }

    /// Adopted children of `id`.
    pub fn children_of(&self, id: NodeId) -> SmallVec<[NodeId; 4]> {
        self.entries
            .get(&id)
            .map(|e| e.children.clone())
            .unwrap_or_default()
    }

    /// The live node with `id`.
    pub fn get(&self, id: NodeId) -> Option<Arc<DispatchNode>> {
        self.entries.get(&id).and_then(|e| e.node.upgrade())
    }

    /// Copy of the bookkeeping of `id`.
    pub fn entry(&self, id: NodeId) -> Option<ArenaEntry> {
        self.entries.get(&id).map(|e| e.clone())
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: NodeId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Ids of nodes without a parent, ascending.
    pub fn roots(&self) -> Vec<NodeId> {
        let mut roots: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|e| e.parent.is_none())
            .map(|e| *e.key())
            .collect();
        roots.sort_unstable();
        roots
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no node is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with(n: usize) -> (NodeArena, Vec<NodeId>) {
        let arena = NodeArena::new();
        let ids = (0..n).map(|_| arena.register(Weak::new(), "t")).collect();
        (arena, ids)
    }

    #[test]
    fn test_adopt_and_reparent() {
        let (arena, ids) = arena_with(3);
        assert!(arena.adopt(ids[2], ids[0]));
        assert_eq!(arena.parent_of(ids[2]), Some(ids[0]));
        assert_eq!(arena.children_of(ids[0]).as_slice(), &[ids[2]]);

        assert!(arena.adopt(ids[2], ids[1]));
        assert!(arena.children_of(ids[0]).is_empty());
        assert_eq!(arena.children_of(ids[1]).as_slice(), &[ids[2]]);
        assert_eq!(arena.roots(), vec![ids[0], ids[1]]);
    }

    #[test]
    fn test_adopt_rejects_cycles() {
        let (arena, ids) = arena_with(3);
        assert!(arena.adopt(ids[1], ids[0]));
        assert!(arena.adopt(ids[2], ids[1]));
        assert!(!arena.adopt(ids[0], ids[2]));
        assert!(!arena.adopt(ids[0], ids[0]));
        assert!(arena.is_ancestor(ids[0], ids[2]));
    }

    #[test]
    fn test_release_subtree() {
        let (arena, ids) = arena_with(4);
        arena.adopt(ids[1], ids[0]);
        arena.adopt(ids[2], ids[1]);
        arena.adopt(ids[3], ids[1]);
        assert_eq!(arena.release(ids[1]), 3);
        assert_eq!(arena.len(), 1);
        assert!(arena.children_of(ids[0]).is_empty());
        assert_eq!(arena.release(ids[1]), 0);
    }

    #[test]
    fn test_forget_orphans_children() {
        let (arena, ids) = arena_with(2);
        arena.adopt(ids[1], ids[0]);
        arena.forget(ids[0]);
        assert!(!arena.contains(ids[0]));
        assert_eq!(arena.parent_of(ids[1]), None);
        assert!(arena.get(ids[1]).is_none());
    }
}
