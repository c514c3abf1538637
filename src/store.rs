//! store.rs — fixed-capacity slotted node array.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::node::{Node, NodeId};

/// Slot array for all nodes, pre-sized to the item capacity.
///
/// Slots are filled densely in id order and never vacated; publication
/// happens under the index's global lock, so a reader either sees a fully
/// constructed node or an empty slot. Growth is the only mutation of the
/// array shape.
pub(crate) struct NodeStore<K> {
    slots: RwLock<Vec<Option<Arc<Node<K>>>>>,
}

impl<K> NodeStore<K> {
    pub(crate) fn with_capacity(max_items: usize) -> Self {
        let mut slots = Vec::with_capacity(max_items);
        slots.resize_with(max_items, || None);
        Self { slots: RwLock::new(slots) }
    }

    /// Rebuild from snapshot slots.
    pub(crate) fn from_slots(mut slots: Vec<Option<Arc<Node<K>>>>, max_items: usize) -> Self {
        if slots.len() < max_items {
            slots.resize_with(max_items, || None);
        }
        Self { slots: RwLock::new(slots) }
    }

    /// Shared handle to the node in `id`'s slot, if populated.
    #[inline]
    pub(crate) fn get(&self, id: NodeId) -> Option<Arc<Node<K>>> {
        self.slots.read().get(id).and_then(Clone::clone)
    }

    /// Place a node into its slot. Caller holds the global lock and has
    /// already reserved the id, so the slot is in range and empty.
    pub(crate) fn publish(&self, node: Arc<Node<K>>) {
        let id = node.id;
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(id) {
            *slot = Some(node);
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.read().len()
    }

    /// Grow-only resize; false when `new_max` does not exceed the current
    /// capacity.
    pub(crate) fn grow(&self, new_max: usize) -> bool {
        let mut slots = self.slots.write();
        if new_max <= slots.len() {
            return false;
        }
        slots.resize_with(new_max, || None);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Item;

    #[test]
    fn publish_then_get() {
        let store: NodeStore<u64> = NodeStore::with_capacity(4);
        assert!(store.get(0).is_none());

        store.publish(Arc::new(Node::new(0, 0, Item::new(7, vec![1.0]))));
        assert_eq!(store.get(0).unwrap().item().id, 7);
        assert!(store.get(1).is_none());
        assert!(store.get(99).is_none());
    }

    #[test]
    fn grow_is_grow_only() {
        let store: NodeStore<u64> = NodeStore::with_capacity(2);
        assert_eq!(store.capacity(), 2);
        assert!(!store.grow(2));
        assert!(!store.grow(1));
        assert!(store.grow(8));
        assert_eq!(store.capacity(), 8);
    }
}
