//! exact.rs — brute-force companion view for recall evaluation.

use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;

use crate::{
    errors::{Error, Result},
    math::Metric,
    node::{Item, NodeId},
    Hnsw, Key, SearchHit,
};

/// Exact k-NN over the same node store as the approximate index.
///
/// `search` linearly scans every populated slot, skipping tombstones, and
/// keeps a size-`k` max-heap. Everything else passes through to the
/// backing index. Obtained via [`Hnsw::as_exact`].
pub struct ExactView<'a, K: Key, M: Metric> {
    index: &'a Hnsw<K, M>,
}

impl<'a, K: Key, M: Metric> ExactView<'a, K, M> {
    pub(crate) fn new(index: &'a Hnsw<K, M>) -> Self {
        Self { index }
    }

    /// Exact k-nearest neighbours, ascending distance.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit<K>>> {
        let dims = self.index.dims();
        if query.len() != dims {
            return Err(Error::DimensionMismatch {
                expected: dims,
                found: query.len(),
            });
        }

        let graph = &self.index.graph;
        let count = graph.registry.lock().node_count;

        let mut best: BinaryHeap<(OrderedFloat<f32>, NodeId)> = BinaryHeap::new();
        for id in 0..count {
            let Some(node) = graph.store.get(id) else {
                continue;
            };
            if node.is_deleted() {
                continue;
            }
            let d = self.index.metric.distance(&node.item().vector, query);
            if best.len() < k {
                best.push((OrderedFloat(d), id));
            } else if let Some(&(OrderedFloat(worst), _)) = best.peek() {
                if d < worst {
                    best.pop();
                    best.push((OrderedFloat(d), id));
                }
            }
        }

        Ok(best
            .into_sorted_vec()
            .into_iter()
            .filter_map(|(OrderedFloat(dist), id)| {
                graph.store.get(id).map(|node| SearchHit {
                    distance: dist,
                    item: node.item(),
                })
            })
            .collect())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: &K) -> bool {
        self.index.contains(id)
    }

    pub fn get(&self, id: &K) -> Option<std::sync::Arc<Item<K>>> {
        self.index.get(id)
    }
}
