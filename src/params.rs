//! params.rs — builder for configuring an `Hnsw<K, M>` instance.

use std::sync::atomic::AtomicUsize;

use crate::{
    graph::Graph,
    math::{Cosine, Metric},
    Hnsw, Key,
};

/// Reasonable defaults from the HNSW paper (Malkov, 2018).
const DEF_M: usize               = 10;
const DEF_EF_CONSTRUCTION: usize = 200;
const DEF_EF_SEARCH: usize       = 10;

/// Frozen construction parameters; everything except the query-time `ef`
/// is immutable once the index exists.
#[derive(Debug, Clone)]
pub(crate) struct Params {
    pub(crate) dims: usize,
    pub(crate) max_items: usize,
    pub(crate) m: usize,
    pub(crate) max_m: usize,
    pub(crate) max_m0: usize,
    pub(crate) ef_construction: usize,
    pub(crate) level_lambda: f64,
    pub(crate) remove_enabled: bool,
}

impl Params {
    /// Derive the dependent knobs from `m`: `max_m = m`, `max_m0 = 2m`,
    /// `level_lambda = 1 / ln(m)`. The effective construction beam is
    /// never narrower than `m`.
    pub(crate) fn derive(
        dims: usize,
        max_items: usize,
        m: usize,
        ef_construction: usize,
        remove_enabled: bool,
    ) -> Self {
        let m = m.max(2);
        Self {
            dims,
            max_items,
            m,
            max_m: m,
            max_m0: m * 2,
            ef_construction: ef_construction.max(m),
            level_lambda: 1.0 / (m as f64).ln(),
            remove_enabled,
        }
    }
}

/// Builder pattern for `Hnsw`.
pub struct HnswBuilder<M: Metric = Cosine> {
    dims:             Option<usize>,
    max_items:        Option<usize>,
    m:                usize,
    ef_construction:  usize,
    ef_search:        usize,
    remove_enabled:   bool,
    metric:           M,
}

impl<M: Metric> HnswBuilder<M> {
    /// Create with defaults (dims and max_items are `None`; must be set).
    #[must_use]
    pub fn new(metric: M) -> Self {
        Self {
            dims: None,
            max_items: None,
            m: DEF_M,
            ef_construction: DEF_EF_CONSTRUCTION,
            ef_search: DEF_EF_SEARCH,
            remove_enabled: false,
            metric,
        }
    }

    /// Set dimensionality (required).
    #[inline]
    #[must_use]
    pub fn dims(mut self, d: usize) -> Self {
        self.dims = Some(d);
        self
    }

    /// Set the hard cap on stored nodes, live and tombstoned (required).
    #[inline]
    #[must_use]
    pub fn max_items(mut self, n: usize) -> Self {
        self.max_items = Some(n);
        self
    }

    /// Set `M` (target neighbours per layer).
    /// Clamped to at least 2 (typical HNSW assumption).
    #[inline]
    #[must_use]
    pub fn m(mut self, m: usize) -> Self {
        self.m = m.max(2);
        self
    }

    /// Set efConstruction (controls build recall vs. build-time).
    /// Clamped to at least 1; the effective value is never below `M`.
    #[inline]
    #[must_use]
    pub fn ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef.max(1);
        self
    }

    /// Set efSearch (default query beam width).
    /// Clamped to at least 1.
    #[inline]
    #[must_use]
    pub fn ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef.max(1);
        self
    }

    /// Allow `remove` and upsert-with-replace. Off by default.
    #[inline]
    #[must_use]
    pub fn remove_enabled(mut self, enabled: bool) -> Self {
        self.remove_enabled = enabled;
        self
    }

    /// Swap metric type (handy when starting from default builder).
    #[inline]
    #[must_use]
    pub fn metric<T: Metric>(self, metric: T) -> HnswBuilder<T> {
        HnswBuilder {
            dims: self.dims,
            max_items: self.max_items,
            m: self.m,
            ef_construction: self.ef_construction,
            ef_search: self.ef_search,
            remove_enabled: self.remove_enabled,
            metric,
        }
    }

    /// Finish and obtain an `Hnsw`.
    ///
    /// Does **not** panic. If `dims()` or `max_items()` was not set, this
    /// builds an empty index with the missing value at 0; any subsequent
    /// `add` will fail with `DimensionMismatch` or `SizeLimitExceeded`.
    #[must_use]
    pub fn build<K: Key>(self) -> Hnsw<K, M> {
        let dims = self.dims.unwrap_or(0);
        let max_items = self.max_items.unwrap_or(0);
        debug_assert!(dims > 0, "HnswBuilder: call .dims() before build()");
        debug_assert!(max_items > 0, "HnswBuilder: call .max_items() before build()");

        let params = Params::derive(
            dims,
            max_items,
            self.m,
            self.ef_construction,
            self.remove_enabled,
        );
        Hnsw {
            metric: self.metric,
            ef: AtomicUsize::new(self.ef_search),
            graph: Graph::new(params),
        }
    }
}

impl Default for HnswBuilder<Cosine> {
    fn default() -> Self {
        Self::new(Cosine)
    }
}
