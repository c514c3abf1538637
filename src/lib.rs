//! smallworld — concurrent in-process HNSW vector index.
//!
//! * Hierarchical navigable small-world graph (Malkov & Yashunin) with
//!   multi-threaded insertion and lock-free item reads
//! * Soft deletion with versioned tombstones; deleted nodes keep routing
//! * Pluggable distance metrics; optional AVX2 fast-path behind
//!   `--features simd`
//! * Snapshot save/load over any byte stream
//!
//! ## Quick-start
//! ```rust
//! use smallworld::{HnswBuilder, Item, SquaredEuclidean};
//!
//! let index = HnswBuilder::new(SquaredEuclidean)
//!     .dims(16)
//!     .max_items(1_000)
//!     .build::<u64>();
//!
//! index.add(Item::new(42, vec![1.0; 16])).unwrap();
//! let hits = index.search(&vec![1.0; 16], 1).unwrap();
//! assert_eq!(hits[0].item.id, 42);
//! ```

mod errors;
mod exact;
mod graph;
mod math;
mod node;
mod params;
mod rand_level;
mod serialize;
mod store;
mod visited;

use std::fmt::Debug;
use std::hash::Hash;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use errors::{Error, Result};
pub use exact::ExactView;
pub use math::{Cosine, Dot, Euclidean, Manhattan, Metric, SquaredEuclidean};
pub use node::Item;
pub use params::HnswBuilder;

/// Bound on external identifiers: hashable, cloneable, shareable across
/// threads and encodable into snapshots. Blanket-implemented; `u64`,
/// `String`, uuids and friends all qualify.
pub trait Key:
    Clone + Eq + Hash + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> Key for T where
    T: Clone + Eq + Hash + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// One search result: the distance to the query and the matching item.
#[derive(Debug, Clone)]
pub struct SearchHit<K> {
    pub distance: f32,
    pub item: Arc<Item<K>>,
}

/// Main index structure.
///
/// All methods take `&self`; the index is safe to share across threads
/// (wrap it in an `Arc` or hand out references).
pub struct Hnsw<K: Key, M: Metric = Cosine> {
    pub(crate) metric: M,
    pub(crate) ef: AtomicUsize,
    pub(crate) graph: graph::Graph<K>,
}

impl<K: Key, M: Metric> Hnsw<K, M> {
    /// Return the embedding dimensionality this index was built for.
    #[inline]
    pub fn dims(&self) -> usize {
        self.graph.params.dims
    }

    /// Target neighbours per layer (`M`), fixed at construction.
    #[inline]
    pub fn m(&self) -> usize {
        self.graph.params.m
    }

    /// Current query-time beam width.
    #[inline]
    pub fn ef(&self) -> usize {
        self.ef.load(Ordering::Relaxed)
    }

    /// Set query-time ef. The only knob that stays mutable after build.
    #[inline]
    pub fn set_ef(&self, ef: usize) {
        self.ef.store(ef.max(1), Ordering::Relaxed);
    }

    /// Insert (or version-gated upsert) an item.
    ///
    /// Returns `Ok(false)` when the insert is rejected without touching
    /// the index: the id is already live and removals are disabled, or
    /// the incoming version loses against the stored node or a tombstone.
    /// Fails with [`Error::DimensionMismatch`] or
    /// [`Error::SizeLimitExceeded`].
    pub fn add(&self, item: Item<K>) -> Result<bool> {
        self.graph.add(item, &self.metric)
    }

    /// Parallel bulk insert across `num_threads` workers.
    ///
    /// `progress(done, total)` fires every `interval` completed inserts
    /// and once at the end. The first failing insert aborts the bulk
    /// operation and its error is returned on the calling thread; items
    /// already inserted stay in the index.
    pub fn add_all<F>(
        &self,
        items: Vec<Item<K>>,
        num_threads: usize,
        progress: F,
        interval: usize,
    ) -> Result<()>
    where
        F: Fn(usize, usize) + Sync,
    {
        let total = items.len();
        let interval = interval.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| Error::Bulk(e.to_string()))?;

        let done = AtomicUsize::new(0);
        pool.install(|| {
            items.into_par_iter().try_for_each(|item| {
                self.add(item)?;
                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                if n % interval == 0 {
                    progress(n, total);
                }
                Ok::<(), Error>(())
            })
        })?;
        progress(total, total);
        Ok(())
    }

    /// Version-gated soft delete. Returns false when removals are
    /// disabled, the id is unknown, or the stored version is newer.
    pub fn remove(&self, id: &K, version: u64) -> bool {
        self.graph.remove(id, version)
    }

    /// Whether `id` is live (tombstoned ids report false).
    pub fn contains(&self, id: &K) -> bool {
        self.graph.contains(id)
    }

    /// The live item stored under `id`.
    pub fn get(&self, id: &K) -> Option<Arc<Item<K>>> {
        self.graph.get(id)
    }

    /// Count of live items.
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live items, in insertion-slot order.
    pub fn items(&self) -> Vec<Arc<Item<K>>> {
        self.graph.items()
    }

    /// k-nearest neighbour search; results ascend by distance.
    /// An empty index yields an empty result, not an error.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit<K>>> {
        if query.len() != self.dims() {
            return Err(Error::DimensionMismatch {
                expected: self.dims(),
                found: query.len(),
            });
        }
        let hits = self.graph.knn(query, k, self.ef(), &self.metric);
        Ok(hits
            .into_iter()
            .map(|(distance, item)| SearchHit { distance, item })
            .collect())
    }

    /// Neighbours of a stored item: `search` around its vector with the
    /// item itself filtered out, capped at `k`. Unknown ids yield an
    /// empty result.
    pub fn find_neighbors(&self, id: &K, k: usize) -> Result<Vec<SearchHit<K>>> {
        let Some(item) = self.get(id) else {
            return Ok(Vec::new());
        };
        let hits = self.search(&item.vector, k + 1)?;
        Ok(hits
            .into_iter()
            .filter(|hit| hit.item.id != *id)
            .take(k)
            .collect())
    }

    /// Brute-force view over the same store, for recall evaluation.
    pub fn as_exact(&self) -> ExactView<'_, K, M> {
        ExactView::new(self)
    }

    /// Grow the node capacity. Returns false when `new_max` does not
    /// exceed the current capacity; shrinking is not supported.
    pub fn resize(&self, new_max: usize) -> bool {
        self.graph.resize(new_max)
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Serialise the full index state into `writer`.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        serialize::save(self, writer)
    }

    /// Restore an index from `reader`. The metric is a type, not data,
    /// so the caller supplies it again here.
    pub fn load<R: Read>(reader: &mut R, metric: M) -> Result<Self> {
        serialize::load(reader, metric)
    }
}

// ----------------------------------------------------------------------
// Smoke-tests (compile-time verified)
// ----------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;

    fn small_index() -> Hnsw<u64, SquaredEuclidean> {
        HnswBuilder::new(SquaredEuclidean)
            .dims(2)
            .max_items(8)
            .m(4)
            .ef_search(10)
            .ef_construction(10)
            .build::<u64>()
    }

    #[test]
    fn smoke_insert_search() {
        let h = small_index();
        h.add(Item::new(1, vec![0.25, 0.75])).unwrap();
        let res = h.search(&[0.25, 0.75], 1).unwrap();
        assert_eq!(res[0].item.id, 1);
        assert!(res[0].distance.abs() < 1e-6);
    }

    #[test]
    fn empty_index_yields_empty_results() {
        let h = small_index();
        assert!(h.search(&[0.0, 0.0], 5).unwrap().is_empty());
        assert!(h.is_empty());
    }

    #[test]
    fn query_dims_are_checked() {
        let h = small_index();
        let err = h.search(&[0.0, 0.0, 0.0], 1);
        assert!(matches!(
            err,
            Err(Error::DimensionMismatch { expected: 2, found: 3 })
        ));
    }

    #[test]
    fn find_neighbors_excludes_self() {
        let h = small_index();
        h.add(Item::new(1, vec![0.0, 0.0])).unwrap();
        h.add(Item::new(2, vec![1.0, 0.0])).unwrap();
        h.add(Item::new(3, vec![0.0, 1.0])).unwrap();
        let hits = h.find_neighbors(&1, 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|hit| hit.item.id != 1));
    }

    #[test]
    fn set_ef_clamps_to_one() {
        let h = small_index();
        h.set_ef(0);
        assert_eq!(h.ef(), 1);
    }

    #[test]
    fn snapshot_roundtrip() {
        let h = small_index();
        h.add(Item::new(7, vec![0.5, 0.5])).unwrap();
        let mut buf = Vec::new();
        h.save(&mut buf).unwrap();
        let h2 = Hnsw::<u64, SquaredEuclidean>::load(
            &mut std::io::Cursor::new(&buf),
            SquaredEuclidean,
        )
        .unwrap();
        assert_eq!(h2.search(&[0.5, 0.5], 1).unwrap()[0].item.id, 7);
    }
}
