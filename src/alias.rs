//! Bidirectional node-id / alias mapping.
//!
//! Remote segments reference storage nodes by their full 128-bit id, but
//! persisting that id in every piece row would balloon segment rows. The
//! alias cache assigns each node a small monotonically-increasing `u32` the
//! first time it is seen and remembers the mapping both ways, mirroring the
//! teacher's `index` module's use of `DashMap` for a shared, lock-free-read
//! cache (`index/mod.rs`).

use crate::error::{MetabaseError, Result};
use crate::model::NodeId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Maps storage node ids to compact aliases and back.
///
/// Cheap to clone: internally `Arc`-free, callers share it behind an `Arc`
/// at the adapter level the same way the teacher shares its alias and page
/// caches across connections.
#[derive(Debug, Default)]
pub struct AliasCache {
    by_node: DashMap<NodeId, u32>,
    by_alias: DashMap<u32, NodeId>,
    next_alias: AtomicU32,
}

impl AliasCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            by_node: DashMap::new(),
            by_alias: DashMap::new(),
            next_alias: AtomicU32::new(1),
        }
    }

    /// Preloads a cache from a known set of (node, alias) pairs, e.g. when
    /// an adapter starts up and reads the existing alias table.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (NodeId, u32)>) -> Self {
        let cache = Self::new();
        let mut max_alias = 0;
        for (node, alias) in pairs {
            cache.by_node.insert(node, alias);
            cache.by_alias.insert(alias, node);
            max_alias = max_alias.max(alias);
        }
        cache.next_alias.store(max_alias + 1, Ordering::SeqCst);
        cache
    }

    /// Looks up the alias for a node, if already assigned.
    pub fn alias_for(&self, node: NodeId) -> Option<u32> {
        self.by_node.get(&node).map(|v| *v)
    }

    /// Looks up the node for an alias, if known.
    pub fn node_for(&self, alias: u32) -> Option<NodeId> {
        self.by_alias.get(&alias).map(|v| *v)
    }

    /// Resolves a node to its alias, assigning a fresh one if this is the
    /// first time the node has been seen. Idempotent under concurrent calls
    /// for the same node: only one alias is ever assigned to a given node.
    pub fn ensure_alias(&self, node: NodeId) -> u32 {
        if let Some(alias) = self.alias_for(node) {
            return alias;
        }
        let alias = self.next_alias.fetch_add(1, Ordering::SeqCst);
        match self.by_node.entry(node) {
            dashmap::mapref::entry::Entry::Occupied(existing) => *existing.get(),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(alias);
                self.by_alias.insert(alias, node);
                alias
            }
        }
    }

    /// Resolves a batch of nodes to aliases in one pass (`EnsurePiecesToAliases`
    /// from spec §4.5's piece-update path).
    pub fn ensure_aliases(&self, nodes: &[NodeId]) -> Vec<u32> {
        nodes.iter().map(|&n| self.ensure_alias(n)).collect()
    }

    /// Resolves a batch of aliases back to node ids, failing if any alias is
    /// unknown to this cache.
    pub fn resolve_aliases(&self, aliases: &[u32]) -> Result<Vec<NodeId>> {
        aliases
            .iter()
            .map(|&alias| {
                self.node_for(alias)
                    .ok_or_else(|| MetabaseError::Internal(format!("unknown node alias {alias}")))
            })
            .collect()
    }

    /// Number of distinct nodes known to this cache.
    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    /// True if no nodes have been aliased yet.
    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn node() -> NodeId {
        NodeId(Uuid::new_v4())
    }

    #[test]
    fn ensure_alias_is_idempotent() {
        let cache = AliasCache::new();
        let n = node();
        let a1 = cache.ensure_alias(n);
        let a2 = cache.ensure_alias(n);
        assert_eq!(a1, a2);
        assert_eq!(cache.node_for(a1), Some(n));
    }

    #[test]
    fn distinct_nodes_get_distinct_aliases() {
        let cache = AliasCache::new();
        let (n1, n2) = (node(), node());
        assert_ne!(cache.ensure_alias(n1), cache.ensure_alias(n2));
    }

    #[test]
    fn resolve_aliases_fails_on_unknown() {
        let cache = AliasCache::new();
        assert!(cache.resolve_aliases(&[42]).is_err());
    }

    #[test]
    fn from_pairs_continues_numbering() {
        let n = node();
        let cache = AliasCache::from_pairs([(n, 7)]);
        let other = cache.ensure_alias(node());
        assert_eq!(other, 8);
    }
}
