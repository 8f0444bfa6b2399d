//! Error types for the blob backend.

use std::time::Duration;

use strata_types::ActionId;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The backend rejected the request because it has been closed.
    #[error("blob store is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store error: {0}")]
    Remote(#[from] object_store::Error),

    #[error("invalid bucket url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error(transparent)]
    Store(#[from] strata_store::StoreError),

    #[error(transparent)]
    Bundle(#[from] strata_bundle::BundleError),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The backend lifecycle was cancelled while the operation ran.
    #[error("operation cancelled")]
    Cancelled,

    /// A remote object's embedded metadata names a different action.
    #[error("action id mismatch: expected {expected}, got {actual}")]
    ActionIdMismatch { expected: ActionId, actual: ActionId },

    #[error("actionID must be specified")]
    EmptyActionId,

    #[error("bucket is not accessible: {0}")]
    NotAccessible(String),
}
