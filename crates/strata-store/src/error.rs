//! Error types for cache store operations.

use std::path::PathBuf;
use std::sync::Arc;

use strata_types::ActionId;

/// Errors from the local store and the single-flight layer around it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store rejected the request because it has been closed.
    #[error("cache store is closed")]
    Closed,

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A streamed body did not match its declared size.
    #[error("body size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: i64, actual: i64 },

    /// Stored metadata names a different action than the one looked up.
    #[error("action id mismatch: expected {expected}, got {actual}")]
    ActionIdMismatch { expected: ActionId, actual: ActionId },

    /// The output path exists but is a directory.
    #[error("output path is a directory, expected a file: {0}")]
    OutputIsDirectory(PathBuf),

    /// The outcome of a single-flight execution this caller joined.
    #[error(transparent)]
    Shared(Arc<StoreError>),
}
