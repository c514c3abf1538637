//! graph.rs — core HNSW graph engine for smallworld.
//!
//! Layered navigable small-world graph with concurrent insertion: a global
//! registry mutex linearizes id allocation and entry-point promotion,
//! per-node mutexes guard adjacency lists, and an in-flight set keeps
//! concurrent writers from linking to half-wired nodes.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use dashmap::DashMap;
use ordered_float::OrderedFloat;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::{
    errors::{Error, Result},
    math::Metric,
    node::{Item, Node, NodeId},
    params::Params,
    rand_level::assign_level,
    store::NodeStore,
    visited::{InFlightSet, VisitedPool},
    Key,
};

/// Neighbour-selection scratch kept on the stack for typical `M`.
const SELECT_SCRATCH: usize = 16;

/// Max-heap entry: distance to the query, then internal id.
type Scored = (OrderedFloat<f32>, NodeId);

/// Mutable bookkeeping serialized by the global lock: slot allocation,
/// the live-id map and the tombstone map.
pub(crate) struct Registry<K> {
    pub(crate) node_count: usize,
    pub(crate) lookup: FxHashMap<K, NodeId>,
    pub(crate) tombstones: FxHashMap<K, u64>,
}

impl<K> Registry<K> {
    fn new() -> Self {
        Self {
            node_count: 0,
            lookup: FxHashMap::default(),
            tombstones: FxHashMap::default(),
        }
    }
}

/// In-memory HNSW graph and all of its concurrent state.
pub(crate) struct Graph<K> {
    pub(crate) params: Params,
    pub(crate) store: NodeStore<K>,
    pub(crate) registry: Mutex<Registry<K>>,
    /// Highest-layer node; all searches start here.
    pub(crate) entry: RwLock<Option<Arc<Node<K>>>>,
    pub(crate) in_flight: InFlightSet,
    pub(crate) visited_pool: VisitedPool,
    /// Per-external-id mutexes, created lazily, held across the wiring
    /// phase so two inserts of one id cannot race after global release.
    id_locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Key> Graph<K> {
    pub(crate) fn new(params: Params) -> Self {
        let store = NodeStore::with_capacity(params.max_items);
        Self {
            params,
            store,
            registry: Mutex::new(Registry::new()),
            entry: RwLock::new(None),
            in_flight: InFlightSet::default(),
            visited_pool: VisitedPool::new(pool_size()),
            id_locks: DashMap::new(),
        }
    }

    /// Reassemble a graph from snapshot parts.
    pub(crate) fn from_parts(
        params: Params,
        store: NodeStore<K>,
        registry: Registry<K>,
        entry: Option<Arc<Node<K>>>,
    ) -> Self {
        Self {
            params,
            store,
            registry: Mutex::new(registry),
            entry: RwLock::new(entry),
            in_flight: InFlightSet::default(),
            visited_pool: VisitedPool::new(pool_size()),
            id_locks: DashMap::new(),
        }
    }

    /* ---------------- mutation ------------------------------------------ */

    /// Insert an item; see the crate docs for the upsert/version rules.
    pub(crate) fn add<M: Metric>(&self, item: Item<K>, metric: &M) -> Result<bool> {
        if item.dims() != self.params.dims {
            return Err(Error::DimensionMismatch {
                expected: self.params.dims,
                found: item.dims(),
            });
        }

        let level = assign_level(&item.id, self.params.level_lambda);
        let mut registry = self.registry.lock();
        let capacity = self.store.capacity();

        if let Some(&existing) = registry.lookup.get(&item.id) {
            if !self.params.remove_enabled {
                return Ok(false);
            }
            let Some(node) = self.store.get(existing) else {
                return Ok(false);
            };
            let stored = node.item();
            if item.version < stored.version {
                return Ok(false);
            }
            if same_bytes(&item.vector, &stored.vector) {
                // Vector unchanged: swap the item in place, keep the node.
                node.item.store(Arc::new(item));
                return Ok(true);
            }
            if registry.node_count == capacity {
                return Err(Error::SizeLimitExceeded { capacity });
            }
            // Vector changed: tombstone the old node and insert fresh.
            node.mark_deleted();
            registry.lookup.remove(&item.id);
            registry.tombstones.insert(item.id.clone(), stored.version);
            debug!(id = ?item.id, node = existing, "soft-deleted for upsert");
        } else if let Some(&buried) = registry.tombstones.get(&item.id) {
            if buried > item.version {
                return Ok(false);
            }
        }

        if registry.node_count == capacity {
            return Err(Error::SizeLimitExceeded { capacity });
        }

        let new_id = registry.node_count;
        registry.node_count += 1;
        self.in_flight.insert(new_id);

        let id_key = item.id.clone();
        let node = Arc::new(Node::new(new_id, level, item));
        self.store.publish(Arc::clone(&node));
        registry.lookup.insert(id_key.clone(), new_id);
        registry.tombstones.remove(&id_key);

        // Wiring phase. The per-id mutex outlives the global lock so two
        // inserts of the same id stay ordered; the global lock itself is
        // released unless this node must become the new entry point.
        let id_lock = self.id_lock(&id_key);
        let _id_guard = id_lock.lock();

        let entry_copy = self.entry.read().clone();
        let promote = match entry_copy.as_ref() {
            Some(ep) => level > ep.top_level,
            None => true,
        };
        let registry = if promote {
            Some(registry)
        } else {
            drop(registry);
            None
        };

        self.wire(&node, level, entry_copy.as_ref(), metric);

        if promote {
            *self.entry.write() = Some(Arc::clone(&node));
            debug!(node = new_id, level, "entry point promoted");
        }
        drop(registry);
        self.in_flight.remove(new_id);
        Ok(true)
    }

    /// Link a freshly published node into every layer up to its level.
    fn wire<M: Metric>(
        &self,
        node: &Arc<Node<K>>,
        level: usize,
        entry: Option<&Arc<Node<K>>>,
        metric: &M,
    ) {
        let Some(ep) = entry else {
            return; // first node: nothing to wire against
        };
        let query_item = node.item();
        let query = &query_item.vector;

        let mut cur = Arc::clone(ep);
        if level < ep.top_level {
            cur = self.greedy_descend(query, cur, ep.top_level, level + 1, metric);
        }

        for layer in (0..=level.min(ep.top_level)).rev() {
            let mut found =
                self.search_layer(&cur, query, self.params.ef_construction, layer, metric);
            if ep.is_deleted() {
                // A tombstoned entry point never makes it into the result
                // heap; re-admit it with its true distance so the new node
                // can still link through it.
                let d = metric.distance(&ep.item().vector, query);
                found.push((OrderedFloat(d), ep.id));
                if found.len() > self.params.ef_construction {
                    found.pop();
                }
            }
            self.connect_new(node, found, layer, metric);
        }
    }

    /// Soft deletion: version-gated tombstoning under the global lock.
    /// Edges stay in place so searches keep routing through the node.
    pub(crate) fn remove(&self, id: &K, version: u64) -> bool {
        if !self.params.remove_enabled {
            return false;
        }
        let mut registry = self.registry.lock();
        let Some(&node_id) = registry.lookup.get(id) else {
            return false;
        };
        let Some(node) = self.store.get(node_id) else {
            return false;
        };
        if node.item().version > version {
            return false;
        }
        node.mark_deleted();
        registry.lookup.remove(id);
        registry.tombstones.insert(id.clone(), version);
        debug!(id = ?id, node = node_id, version, "soft-deleted");
        true
    }

    /* ---------------- search -------------------------------------------- */

    /// k-NN over live nodes; ascending distance.
    pub(crate) fn knn<M: Metric>(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        metric: &M,
    ) -> Vec<(f32, Arc<Item<K>>)> {
        let Some(ep) = self.entry.read().clone() else {
            return Vec::new();
        };

        let cur = if ep.top_level > 0 {
            self.greedy_descend(query, Arc::clone(&ep), ep.top_level, 1, metric)
        } else {
            ep
        };

        let mut found = self.search_layer(&cur, query, ef.max(k), 0, metric);
        while found.len() > k {
            found.pop();
        }
        found
            .into_sorted_vec()
            .into_iter()
            .filter_map(|(OrderedFloat(dist), id)| {
                self.store.get(id).map(|node| (dist, node.item()))
            })
            .collect()
    }

    /// Greedy descent: walk `top ..= bottom`, at each layer hopping to the
    /// first strictly closer neighbour until a full scan yields none.
    fn greedy_descend<M: Metric>(
        &self,
        query: &[f32],
        mut cur: Arc<Node<K>>,
        top: usize,
        bottom: usize,
        metric: &M,
    ) -> Arc<Node<K>> {
        let mut cur_dist = metric.distance(&cur.item().vector, query);
        for layer in (bottom..=top).rev() {
            loop {
                let mut closer = None;
                {
                    let links = cur.links.lock();
                    if let Some(list) = links.get(layer) {
                        for &nb_id in list {
                            let Some(nb) = self.store.get(nb_id) else {
                                continue;
                            };
                            let d = metric.distance(&nb.item().vector, query);
                            if d < cur_dist {
                                closer = Some((nb, d));
                                break;
                            }
                        }
                    }
                }
                match closer {
                    Some((nb, d)) => {
                        cur = nb;
                        cur_dist = d;
                    }
                    None => break,
                }
            }
        }
        cur
    }

    /// Best-first expansion at one layer, bounded by a dynamic threshold.
    ///
    /// Returns a max-heap of at most `capacity` scored results — worst on
    /// top, ready for further eviction. Tombstoned nodes are traversed but
    /// never admitted to the result heap; a tombstoned entry enters the
    /// frontier with an infinite placeholder distance.
    fn search_layer<M: Metric>(
        &self,
        entry: &Arc<Node<K>>,
        query: &[f32],
        capacity: usize,
        layer: usize,
        metric: &M,
    ) -> BinaryHeap<Scored> {
        let mut visited = self.visited_pool.borrow();
        let mut results: BinaryHeap<Scored> = BinaryHeap::new();
        let mut frontier: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        let mut bound = f32::INFINITY;

        if entry.is_deleted() {
            frontier.push(Reverse((OrderedFloat(f32::INFINITY), entry.id)));
        } else {
            let d = metric.distance(&entry.item().vector, query);
            results.push((OrderedFloat(d), entry.id));
            frontier.push(Reverse((OrderedFloat(d), entry.id)));
            bound = d;
        }
        visited.first_visit(entry.id);

        while let Some(Reverse((OrderedFloat(dist), id))) = frontier.pop() {
            if dist > bound {
                break;
            }
            let Some(node) = self.store.get(id) else {
                continue;
            };
            let links = node.links.lock();
            let Some(list) = links.get(layer) else {
                continue;
            };
            for &nb_id in list {
                if !visited.first_visit(nb_id) {
                    continue;
                }
                let Some(nb) = self.store.get(nb_id) else {
                    continue;
                };
                let d = metric.distance(&nb.item().vector, query);
                if results.len() < capacity || d < bound {
                    frontier.push(Reverse((OrderedFloat(d), nb_id)));
                    if !nb.is_deleted() {
                        results.push((OrderedFloat(d), nb_id));
                        if results.len() > capacity {
                            results.pop();
                        }
                    }
                    if let Some(&(OrderedFloat(worst), _)) = results.peek() {
                        bound = worst;
                    }
                }
            }
        }
        results
    }

    /* ---------------- neighbour selection ------------------------------- */

    /// Diversity heuristic: closest-first, accept a candidate only when no
    /// already-accepted neighbour is closer to it than the query is. This
    /// keeps long-range links alive instead of collapsing into hubs.
    fn select_neighbors<M: Metric>(
        &self,
        candidates: Vec<Scored>,
        target: usize,
        metric: &M,
    ) -> SmallVec<[Arc<Node<K>>; SELECT_SCRATCH]> {
        if candidates.len() <= target {
            return candidates
                .into_iter()
                .filter_map(|(_, id)| self.store.get(id))
                .collect();
        }

        let mut heap: BinaryHeap<Reverse<Scored>> =
            candidates.into_iter().map(Reverse).collect();
        let mut selected: SmallVec<[Arc<Node<K>>; SELECT_SCRATCH]> = SmallVec::new();

        while let Some(Reverse((OrderedFloat(dist_q), id))) = heap.pop() {
            if selected.len() >= target {
                break;
            }
            let Some(cand) = self.store.get(id) else {
                continue;
            };
            let cand_item = cand.item();
            let diverse = selected
                .iter()
                .all(|s| metric.distance(&cand_item.vector, &s.item().vector) >= dist_q);
            if diverse {
                selected.push(cand);
            }
        }
        selected
    }

    /// Wire the new node and its selected neighbours together at `layer`,
    /// re-pruning any neighbour whose list would overflow.
    fn connect_new<M: Metric>(
        &self,
        node: &Arc<Node<K>>,
        candidates: BinaryHeap<Scored>,
        layer: usize,
        metric: &M,
    ) {
        let best_n = if layer == 0 {
            self.params.max_m0
        } else {
            self.params.max_m
        };
        let selected = self.select_neighbors(candidates.into_vec(), self.params.m, metric);

        for nb in selected {
            if nb.id == node.id {
                continue;
            }
            if self.in_flight.contains(nb.id) {
                // Another writer is mid-wiring on this node; connect in
                // neither direction.
                continue;
            }

            {
                let mut links = node.links.lock();
                if let Some(list) = links.get_mut(layer) {
                    list.push(nb.id);
                }
            }

            let mut nb_links = nb.links.lock();
            let Some(list) = nb_links.get_mut(layer) else {
                continue;
            };
            if list.len() < best_n {
                list.push(node.id);
                continue;
            }

            // Overflow: re-select over {new} ∪ existing by distance to the
            // neighbour, keeping the most diverse best_n.
            let nb_item = nb.item();
            let mut rivals: Vec<Scored> = Vec::with_capacity(list.len() + 1);
            rivals.push((
                OrderedFloat(metric.distance(&node.item().vector, &nb_item.vector)),
                node.id,
            ));
            for &other_id in list.iter() {
                let Some(other) = self.store.get(other_id) else {
                    continue;
                };
                rivals.push((
                    OrderedFloat(metric.distance(&other.item().vector, &nb_item.vector)),
                    other_id,
                ));
            }
            let kept = self.select_neighbors(rivals, best_n, metric);
            *list = kept.iter().map(|n| n.id).collect();
        }
    }

    /* ---------------- lookups ------------------------------------------- */

    pub(crate) fn get(&self, id: &K) -> Option<Arc<Item<K>>> {
        let registry = self.registry.lock();
        let node_id = *registry.lookup.get(id)?;
        self.store.get(node_id).map(|node| node.item())
    }

    pub(crate) fn contains(&self, id: &K) -> bool {
        self.registry.lock().lookup.contains_key(id)
    }

    /// Live item count (tombstoned nodes excluded).
    pub(crate) fn len(&self) -> usize {
        self.registry.lock().lookup.len()
    }

    /// All live items, in internal-id order.
    pub(crate) fn items(&self) -> Vec<Arc<Item<K>>> {
        let registry = self.registry.lock();
        (0..registry.node_count)
            .filter_map(|id| self.store.get(id))
            .filter(|node| !node.is_deleted())
            .map(|node| node.item())
            .collect()
    }

    /// Grow-only capacity change; false when `new_max` does not grow.
    pub(crate) fn resize(&self, new_max: usize) -> bool {
        let _registry = self.registry.lock();
        let grew = self.store.grow(new_max);
        if grew {
            debug!(new_max, "node store grown");
        }
        grew
    }

    fn id_lock(&self, id: &K) -> Arc<Mutex<()>> {
        self.id_locks.entry(id.clone()).or_default().value().clone()
    }
}

fn pool_size() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

#[inline]
fn same_bytes(a: &[f32], b: &[f32]) -> bool {
    bytemuck::cast_slice::<f32, u8>(a) == bytemuck::cast_slice::<f32, u8>(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::SquaredEuclidean;

    fn graph(max_items: usize, m: usize, remove_enabled: bool) -> Graph<u64> {
        Graph::new(Params::derive(2, max_items, m, 10, remove_enabled))
    }

    fn add(g: &Graph<u64>, id: u64, v: [f32; 2]) -> bool {
        g.add(Item::new(id, v.to_vec()), &SquaredEuclidean).unwrap()
    }

    #[test]
    fn degree_caps_hold_after_many_inserts() {
        let g = graph(64, 2, false);
        for i in 0..64u64 {
            add(&g, i, [(i % 8) as f32, (i / 8) as f32]);
        }
        let count = g.registry.lock().node_count;
        for id in 0..count {
            let node = g.store.get(id).unwrap();
            let links = node.links.lock();
            for (layer, list) in links.iter().enumerate() {
                let cap = if layer == 0 { g.params.max_m0 } else { g.params.max_m };
                assert!(list.len() <= cap, "node {id} layer {layer}: {}", list.len());
            }
        }
    }

    #[test]
    fn new_nodes_connect_bidirectionally() {
        let g = graph(8, 4, false);
        add(&g, 1, [0.0, 0.0]);
        add(&g, 2, [1.0, 0.0]);
        let a = g.store.get(0).unwrap();
        let b = g.store.get(1).unwrap();
        assert!(a.links.lock()[0].contains(&1));
        assert!(b.links.lock()[0].contains(&0));
    }

    #[test]
    fn duplicate_insert_without_removals_is_rejected() {
        let g = graph(8, 4, false);
        assert!(add(&g, 1, [0.0, 0.0]));
        assert!(!add(&g, 1, [5.0, 5.0]));
        assert_eq!(g.len(), 1);
        assert_eq!(g.get(&1).unwrap().vector, vec![0.0, 0.0]);
    }

    #[test]
    fn byte_equal_upsert_swaps_in_place() {
        let g = graph(8, 4, true);
        assert!(add(&g, 1, [0.5, 0.25]));
        assert!(g
            .add(Item::with_version(1, vec![0.5, 0.25], 7), &SquaredEuclidean)
            .unwrap());
        assert_eq!(g.len(), 1);
        assert_eq!(g.registry.lock().node_count, 1);
        assert_eq!(g.get(&1).unwrap().version, 7);
    }

    #[test]
    fn changed_vector_upsert_allocates_a_new_slot() {
        let g = graph(8, 4, true);
        add(&g, 1, [0.0, 0.0]);
        assert!(g
            .add(Item::with_version(1, vec![3.0, 4.0], 1), &SquaredEuclidean)
            .unwrap());
        assert_eq!(g.len(), 1);
        assert_eq!(g.registry.lock().node_count, 2);
        assert!(g.store.get(0).unwrap().is_deleted());
        assert_eq!(g.get(&1).unwrap().vector, vec![3.0, 4.0]);
    }

    #[test]
    fn capacity_error_leaves_state_untouched() {
        let g = graph(2, 4, false);
        add(&g, 1, [0.0, 0.0]);
        add(&g, 2, [1.0, 0.0]);
        let err = g.add(Item::new(3, vec![2.0, 0.0]), &SquaredEuclidean);
        assert!(matches!(err, Err(Error::SizeLimitExceeded { capacity: 2 })));
        assert_eq!(g.len(), 2);
        assert_eq!(g.registry.lock().node_count, 2);
    }

    #[test]
    fn remove_is_version_gated() {
        let g = graph(8, 4, true);
        g.add(Item::with_version(1, vec![0.0, 0.0], 5), &SquaredEuclidean)
            .unwrap();
        assert!(!g.remove(&1, 4));
        assert_eq!(g.len(), 1);
        assert!(g.remove(&1, 5));
        assert_eq!(g.len(), 0);
        assert_eq!(g.registry.lock().tombstones.get(&1), Some(&5));
    }

    #[test]
    fn tombstone_version_gates_reinsert() {
        let g = graph(8, 4, true);
        g.add(Item::with_version(1, vec![0.0, 0.0], 5), &SquaredEuclidean)
            .unwrap();
        assert!(g.remove(&1, 5));
        assert!(!g
            .add(Item::with_version(1, vec![1.0, 1.0], 3), &SquaredEuclidean)
            .unwrap());
        assert!(g
            .add(Item::with_version(1, vec![1.0, 1.0], 6), &SquaredEuclidean)
            .unwrap());
        assert!(g.registry.lock().tombstones.is_empty());
    }

    #[test]
    fn removed_nodes_stay_reachable_but_unreported() {
        let g = graph(8, 4, true);
        add(&g, 1, [0.0, 0.0]);
        add(&g, 2, [1.0, 0.0]);
        add(&g, 3, [2.0, 0.0]);
        assert!(g.remove(&2, 0));
        // Edges through the tombstone are intact…
        let mid = g.store.get(1).unwrap();
        assert!(!mid.links.lock()[0].is_empty());
        // …but it never shows up in results.
        let hits = g.knn(&[1.0, 0.0], 3, 10, &SquaredEuclidean);
        assert!(hits.iter().all(|(_, item)| item.id != 2));
    }

    #[test]
    fn selection_prefers_diverse_neighbours() {
        let g = graph(8, 2, false);
        // Query at origin; two near-duplicates and one far outlier.
        add(&g, 0, [1.0, 0.0]);
        add(&g, 1, [1.1, 0.0]);
        add(&g, 2, [0.0, 4.0]);
        let m = SquaredEuclidean;
        let q = [0.0, 0.0];
        let scored: Vec<Scored> = (0..3)
            .map(|id| {
                let node = g.store.get(id).unwrap();
                (OrderedFloat(m.distance(&node.item().vector, &q)), id)
            })
            .collect();
        let picked = g.select_neighbors(scored, 2, &m);
        let ids: Vec<NodeId> = picked.iter().map(|n| n.id).collect();
        // The second near-duplicate is dominated by the first.
        assert_eq!(ids, vec![0, 2]);
    }
}
