//! rand_level.rs — draw the layer for a new HNSW node.
//!
//! Follows the distribution from the original HNSW paper:
//! P(level ≥ l) = `exp(-l / λ)`, where `λ = 1 / ln(M)`.
//!
//! The draw is **deterministic**: the uniform variate is derived from a
//! fixed-seed hash of the external id, so rebuilding an index from the
//! same insertion order reproduces the same layer structure, and no
//! per-thread RNG state is needed under concurrent insertion.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

/// Levels above this never occur in practice (P < e⁻⁶⁴); the cap only
/// guards against pathological id hash collisions near zero.
const MAX_LEVEL: usize = 64;

/// Deterministically assign a top level to the given external id.
///
/// `lambda` is the level multiplier `1 / ln(M)`. The hash is mapped to a
/// uniform variate in `(0, 1]` — never exactly zero, so `-ln(u)` stays
/// finite and the all-ones hash lands on level 0.
#[inline]
pub(crate) fn assign_level<K: Hash>(id: &K, lambda: f64) -> usize {
    let mut hasher = FxHasher::default();
    id.hash(&mut hasher);
    let bits = hasher.finish();

    // Top 53 bits into (0, 1]: add one so u > 0.
    let unit = ((bits >> 11) as f64 + 1.0) / (1u64 << 53) as f64;
    let level = (-unit.ln() * lambda) as usize;
    level.min(MAX_LEVEL)
}
