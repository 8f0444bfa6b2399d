//! Error types for bundle archives.

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// An entry's data did not match its declared size.
    #[error("size mismatch for entry {name}: expected {expected}, got {actual}")]
    SizeMismatch {
        name: String,
        expected: i64,
        actual: i64,
    },

    /// An entry's embedded metadata could not be parsed, or disagreed with
    /// the entry's payload.
    #[error("corrupted bundle entry {name}: {reason}")]
    Corrupted { name: String, reason: String },
}
