//! errors.rs — error type for smallworld.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced at the index boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// An item or query vector did not match the index dimensionality.
    #[error("dimension mismatch: expected {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    /// The node store is full; grow it with `resize` before inserting more.
    #[error("index is full: capacity of {capacity} items reached")]
    SizeLimitExceeded { capacity: usize },

    /// A bulk insert could not start or one of its workers failed.
    #[error("bulk insert failed: {0}")]
    Bulk(String),

    /// I/O failure while writing or reading a snapshot stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An id or item payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The snapshot stream is malformed or of an unsupported version.
    #[error("snapshot error: {0}")]
    Snapshot(String),
}
