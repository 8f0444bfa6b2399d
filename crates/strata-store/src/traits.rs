//! The cache backend capability.
//!
//! The daemon serves whichever backend it is handed through this trait;
//! the local store and the blob backend are the two implementations.
//! Composed code (the blob backend writing through the local store) uses
//! the concrete types directly.

use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

use strata_types::records::{GetRequest, GetResponse, PutRequest, PutResponse};

/// A streamed put body. Boxed so requests can cross task boundaries.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// Options for a cache store.
pub struct PutOpts {
    pub req: PutRequest,
    pub body: BodyReader,
    /// Use this as the entry's time instead of the current time. Set when
    /// one backend materializes an entry obtained from another.
    pub override_time: Option<DateTime<Utc>>,
    /// Whether this request is issued by the compaction job, for statistics.
    pub in_compaction: bool,
}

impl PutOpts {
    pub fn new(req: PutRequest, body: BodyReader) -> PutOpts {
        PutOpts {
            req,
            body,
            override_time: None,
            in_compaction: false,
        }
    }
}

/// Options for a cache lookup.
#[derive(Clone, Debug, Default)]
pub struct GetOpts {
    pub req: GetRequest,
    /// Whether this request is issued by the compaction job, for statistics.
    pub in_compaction: bool,
}

impl GetOpts {
    pub fn new(req: GetRequest) -> GetOpts {
        GetOpts {
            req,
            in_compaction: false,
        }
    }
}

/// The narrow capability a cache backend exposes.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    /// Look up an entry. A backend never reports internal failures here;
    /// anything unexpected is downgraded to a miss.
    async fn get(&self, opts: GetOpts) -> anyhow::Result<GetResponse>;

    /// Store an entry. The response is returned once the entry is durable
    /// locally; remote propagation may continue in the background.
    async fn put(&self, opts: PutOpts) -> anyhow::Result<PutResponse>;

    /// Reject new requests and release resources. Idempotent.
    async fn close(&self) -> anyhow::Result<()>;

    /// Rebuild remote bundles, where the backend supports it.
    async fn compact(&self) -> anyhow::Result<()> {
        anyhow::bail!("this backend does not support compaction")
    }
}
