//! node.rs — node and item definitions for smallworld.

use core::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// A node owns its item (vector + metadata) and adjacency lists for each
// HNSW level. Adjacency is guarded by a per-node mutex; the item slot and
// the deleted flag are lock-free so readers never block on them.

/// Internal graph index, dense in `0..node_count`.
pub type NodeId = usize;

/// A vector plus its external identity, as handed to `add`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item<K> {
    pub id: K,
    pub vector: Vec<f32>,
    pub version: u64,
}

impl<K> Item<K> {
    /// Item at version 0.
    pub fn new(id: K, vector: Vec<f32>) -> Self {
        Self { id, vector, version: 0 }
    }

    /// Item with an explicit version, for upsert/tombstone gating.
    pub fn with_version(id: K, vector: Vec<f32>, version: u64) -> Self {
        Self { id, vector, version }
    }

    #[inline]
    pub fn dims(&self) -> usize {
        self.vector.len()
    }
}

/// One vector in the HNSW graph.
///
/// Slots are never vacated: a removed node keeps its id, vector and edges
/// so that searches can still route through it; only the `deleted` flag
/// excludes it from result lists.
pub(crate) struct Node<K> {
    pub(crate) id: NodeId,
    /// Highest layer this node participates in. Immutable after insertion;
    /// always `links.lock().len() - 1`.
    pub(crate) top_level: usize,
    /// Replaceable item slot (byte-equal upserts swap this in place).
    pub(crate) item: ArcSwap<Item<K>>,
    pub(crate) deleted: AtomicBool,
    /// Per-level adjacency, `links[level]` for `level` in `0..=top_level`.
    /// All levels are allocated before the node is published, so readers
    /// that reach a half-wired node see empty lists rather than garbage.
    pub(crate) links: Mutex<Vec<Vec<NodeId>>>,
}

impl<K> Node<K> {
    pub(crate) fn new(id: NodeId, top_level: usize, item: Item<K>) -> Self {
        Self {
            id,
            top_level,
            item: ArcSwap::from_pointee(item),
            deleted: AtomicBool::new(false),
            links: Mutex::new(vec![Vec::new(); top_level + 1]),
        }
    }

    /// Rebuild a node from snapshot parts.
    pub(crate) fn restore(
        id: NodeId,
        links: Vec<Vec<NodeId>>,
        item: Item<K>,
        deleted: bool,
    ) -> Self {
        debug_assert!(!links.is_empty());
        Self {
            id,
            top_level: links.len().saturating_sub(1),
            item: ArcSwap::from_pointee(item),
            deleted: AtomicBool::new(deleted),
            links: Mutex::new(links),
        }
    }

    #[inline]
    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    /// Current item, as a shared handle.
    #[inline]
    pub(crate) fn item(&self) -> Arc<Item<K>> {
        self.item.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_allocated_for_every_level() {
        let node = Node::new(0, 3, Item::new(7u64, vec![0.0; 4]));
        assert_eq!(node.links.lock().len(), 4);
        assert_eq!(node.top_level, 3);
        assert!(!node.is_deleted());
    }

    #[test]
    fn item_slot_is_replaceable() {
        let node = Node::new(0, 0, Item::new(7u64, vec![1.0]));
        node.item.store(Arc::new(Item::with_version(7u64, vec![2.0], 3)));
        assert_eq!(node.item().version, 3);
        assert_eq!(node.item().vector, vec![2.0]);
    }
}
