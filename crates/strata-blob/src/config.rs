//! Blob backend configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    /// Bucket URL: `s3://…`, `gs://…`, `azure://…`, `file:///…`, or
    /// `memory:///` for tests.
    pub url: String,
    /// Background upload workers.
    pub upload_concurrency: usize,
    /// Work directory holding the local disk cache and bundle copies.
    /// Comes from the daemon, not from a config file.
    #[serde(skip)]
    pub work_dir: PathBuf,
}

impl Default for BlobConfig {
    fn default() -> BlobConfig {
        BlobConfig {
            url: String::new(),
            upload_concurrency: 50,
            work_dir: PathBuf::new(),
        }
    }
}
