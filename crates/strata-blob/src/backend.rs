//! The blob cache backend.
//!
//! Serves gets from a four-level hierarchy — bundle fast path for empty
//! entries, local disk, bundle slow path, remote download — and persists
//! puts locally before uploading them in the background. Gets are
//! single-flighted per action id; uploads are de-duplicated per action id
//! and run on a bounded, non-blocking pool.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use strata_store::{CacheBackend, FlightGroup, GetOpts, KeyGate, LocalStore, PutOpts};
use strata_types::metrics::{CounterExt, Metrics};
use strata_types::records::{GetResponse, PutRequest, PutResponse};
use strata_types::{ActionId, EntryMeta, Keyspace, key};

use crate::bucket::Bucket;
use crate::bundle_store::BundleStore;
use crate::compact::CompactionJob;
use crate::config::BlobConfig;
use crate::deadline::bounded;
use crate::error::BlobError;

pub const INITIAL_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);
const CLOSE_GRACE: Duration = Duration::from_secs(3);

const CONTENT_TYPE: &str = "application/octet-stream";

type FlightResult = Result<GetResponse, Arc<BlobError>>;

struct Inner {
    config: BlobConfig,
    closed: AtomicBool,
    cancel: CancellationToken,
    bucket: Bucket,
    disk: LocalStore,
    bundles: Arc<BundleStore>,
    uploads: TaskTracker,
    upload_slots: Arc<tokio::sync::Semaphore>,
    get_flights: FlightGroup<ActionId, FlightResult>,
    upload_gate: KeyGate<ActionId>,
    metrics: Arc<Metrics>,
}

/// The two-tier cache backend. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct BlobBackend {
    inner: Arc<Inner>,
}

impl BlobBackend {
    /// Open the backend: local store, bucket (with an accessibility
    /// probe), bundle store, and a detached compaction pass over all
    /// keyspaces. Tears down cleanly when the bucket is unreachable.
    pub async fn open(config: BlobConfig, metrics: Arc<Metrics>) -> Result<BlobBackend, BlobError> {
        let bucket = Bucket::open(&config.url)?;
        Self::open_with_bucket(config, bucket, metrics).await
    }

    /// Like [`open`](Self::open) with an already-built bucket; tests use
    /// this with an in-memory store.
    pub async fn open_with_bucket(
        config: BlobConfig,
        bucket: Bucket,
        metrics: Arc<Metrics>,
    ) -> Result<BlobBackend, BlobError> {
        let disk = LocalStore::open(&config.work_dir).await?;

        match tokio::time::timeout(INITIAL_CHECK_TIMEOUT, bucket.is_accessible()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                disk.close();
                return Err(err);
            }
            Err(_) => {
                disk.close();
                return Err(BlobError::Timeout(INITIAL_CHECK_TIMEOUT));
            }
        }

        let cancel = CancellationToken::new();
        let bundles = match BundleStore::open(
            &config.work_dir,
            bucket.clone(),
            cancel.clone(),
            Arc::clone(&metrics),
            false,
        )
        .await
        {
            Ok(bundles) => bundles,
            Err(err) => {
                disk.close();
                return Err(err);
            }
        };

        let backend = BlobBackend {
            inner: Arc::new(Inner {
                upload_slots: Arc::new(tokio::sync::Semaphore::new(
                    config.upload_concurrency.max(1),
                )),
                config,
                closed: AtomicBool::new(false),
                cancel,
                bucket,
                disk,
                bundles,
                uploads: TaskTracker::new(),
                get_flights: FlightGroup::new(),
                upload_gate: KeyGate::new(),
                metrics,
            }),
        };

        // Compaction runs alongside normal traffic and stops with the
        // backend lifecycle.
        let compacting = backend.clone();
        tokio::spawn(async move {
            let _ = compacting.compact_all().await;
        });

        info!(url = %backend.inner.config.url, "blob store opened");
        Ok(backend)
    }

    /// The counters this backend reports into.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Run a compaction job for every keyspace concurrently.
    pub async fn compact_all(&self) -> Result<(), BlobError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BlobError::Closed);
        }
        info!("starting parallel compaction");
        let mut jobs = JoinSet::new();
        for keyspace in Keyspace::ALL {
            let job = CompactionJob::new(
                keyspace,
                Arc::clone(&self.inner.bundles),
                self.clone(),
                self.inner.bucket.clone(),
                self.inner.cancel.clone(),
                Arc::clone(&self.inner.metrics),
            );
            jobs.spawn(job.run());
        }
        while jobs.join_next().await.is_some() {}
        info!("parallel compaction finished");
        Ok(())
    }

    /// Look up an entry. Single-flighted per action id; any internal
    /// failure is logged and reported as a miss.
    pub async fn get(&self, opts: GetOpts) -> Result<GetResponse, BlobError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BlobError::Closed);
        }
        let action_id = opts.req.action_id.clone();
        let inner = Arc::clone(&self.inner);
        let result = self
            .inner
            .get_flights
            .run(action_id.clone(), async move {
                get_inner(inner, opts).await.map_err(Arc::new)
            })
            .await;
        match result {
            Ok(resp) => Ok(resp),
            Err(err) => {
                warn!(
                    action_id = %action_id,
                    object = %key::entity_key(&action_id),
                    error = %err,
                    "get from blob store failed",
                );
                Ok(GetResponse::miss())
            }
        }
    }

    /// Store an entry: synchronously on local disk, then an upload in the
    /// background. The returned path is usable immediately.
    pub async fn put(&self, opts: PutOpts) -> Result<PutResponse, BlobError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BlobError::Closed);
        }
        let req = opts.req.clone();
        let override_time = opts.override_time;
        let in_compaction = opts.in_compaction;

        let disk_resp = self.inner.disk.put(opts).await?;
        self.spawn_upload(req, override_time, in_compaction, disk_resp.disk_path.clone());
        Ok(disk_resp)
    }

    /// Queue a background upload unless one is already pending for this
    /// action id. Submission never blocks: workers are bounded, the queue
    /// is not.
    fn spawn_upload(
        &self,
        req: PutRequest,
        override_time: Option<DateTime<Utc>>,
        in_compaction: bool,
        disk_path: String,
    ) {
        let action_id = req.action_id.clone();
        if !self.inner.upload_gate.try_acquire(&action_id) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.uploads.spawn(async move {
            let acquired = Arc::clone(&inner.upload_slots).acquire_owned().await;
            if acquired.is_ok() {
                do_upload(&inner, &req, override_time, in_compaction, &disk_path).await;
            }
            inner.upload_gate.release(&action_id);
        });
    }

    /// Reject new requests, drain in-flight uploads for up to
    /// [`MAX_CLOSE_TIMEOUT`], then pull the lifecycle and give stragglers a
    /// short grace before returning.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.uploads.close();

        info!(
            remaining = self.inner.uploads.len(),
            "closing blob store, waiting for ongoing uploads",
        );
        if tokio::time::timeout(MAX_CLOSE_TIMEOUT, self.inner.uploads.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.inner.uploads.len(),
                "timed out waiting for uploads, cancelling them",
            );
            self.inner.cancel.cancel();
            if tokio::time::timeout(CLOSE_GRACE, self.inner.uploads.wait())
                .await
                .is_err()
            {
                warn!(
                    remaining = self.inner.uploads.len(),
                    "failed to cancel ongoing uploads, quitting anyway",
                );
            }
        }

        self.inner.cancel.cancel();
        self.inner.disk.close();
        info!("blob store closed");
    }
}

#[async_trait::async_trait]
impl CacheBackend for BlobBackend {
    async fn get(&self, opts: GetOpts) -> anyhow::Result<GetResponse> {
        Ok(BlobBackend::get(self, opts).await?)
    }

    async fn put(&self, opts: PutOpts) -> anyhow::Result<PutResponse> {
        Ok(BlobBackend::put(self, opts).await?)
    }

    async fn close(&self) -> anyhow::Result<()> {
        BlobBackend::close(self).await;
        Ok(())
    }

    async fn compact(&self) -> anyhow::Result<()> {
        Ok(self.compact_all().await?)
    }
}

/// The four-level get hierarchy.
async fn get_inner(inner: Arc<Inner>, opts: GetOpts) -> Result<GetResponse, BlobError> {
    let action_id = opts.req.action_id.clone();
    if action_id.is_empty() {
        return Err(BlobError::EmptyActionId);
    }
    let keyspace = action_id.keyspace();
    let tier = inner.metrics.tier(opts.in_compaction);

    // 1. Empty entries are served straight from the bundle index; no body
    //    to materialize.
    let bundled = inner.bundles.blob(keyspace, &action_id);
    if let Some(entry) = &bundled
        && entry.meta.size == 0
    {
        let empty_path = inner.disk.ensure_empty_output_file().await?;
        tier.get_by_bundle.inc();
        return Ok(GetResponse {
            miss: false,
            output_id: entry.meta.output_id.clone(),
            size: 0,
            time: Some(entry.meta.time),
            disk_path: empty_path.to_string_lossy().into_owned(),
        });
    }

    // 2. Local disk.
    let disk_resp = inner.disk.get(opts.clone()).await?;
    if !disk_resp.miss {
        tier.get_by_local.inc();
        return Ok(disk_resp);
    }

    // 3. Bundle slow path: copy the bundled body onto the local disk so
    //    the next get is a local hit.
    if let Some(entry) = bundled {
        let body = entry.read_body().await?;
        let put_resp = inner
            .disk
            .put(PutOpts {
                req: PutRequest {
                    action_id: entry.meta.action_id.clone(),
                    output_id: entry.meta.output_id.clone(),
                    body_size: entry.meta.size,
                },
                body: Box::new(Cursor::new(body)),
                override_time: Some(entry.meta.time),
                in_compaction: opts.in_compaction,
            })
            .await?;
        tier.get_by_bundle.inc();
        tier.bundle_to_local_files.inc();
        tier.bundle_to_local_bytes.add(entry.meta.size as u64);
        return Ok(GetResponse {
            miss: false,
            output_id: entry.meta.output_id.clone(),
            size: entry.meta.size,
            time: Some(entry.meta.time),
            disk_path: put_resp.disk_path,
        });
    }

    // 4. Remote download, materialized through the local store.
    let started = Instant::now();
    let object_key = key::entity_key(&action_id);
    let downloaded = bounded(&inner.cancel, MAX_DOWNLOAD_TIMEOUT, async {
        let Some(mut reader) = inner.bucket.reader(&object_key).await? else {
            return Ok(None);
        };
        tier.get_by_download.inc();
        let meta = EntryMeta::read_from(&mut reader).await.map_err(BlobError::Io)?;
        if meta.action_id != action_id {
            return Err(BlobError::ActionIdMismatch {
                expected: action_id.clone(),
                actual: meta.action_id,
            });
        }
        let put_resp = inner
            .disk
            .put(PutOpts {
                req: PutRequest {
                    action_id: meta.action_id.clone(),
                    output_id: meta.output_id.clone(),
                    body_size: meta.size,
                },
                body: Box::new(reader),
                override_time: Some(meta.time),
                in_compaction: opts.in_compaction,
            })
            .await?;
        tier.download_bytes.add(meta.size as u64);
        Ok(Some((meta, put_resp.disk_path)))
    })
    .await?;

    match downloaded {
        None => {
            debug!(action_id = %action_id, "miss in blob store");
            Ok(GetResponse::miss())
        }
        Some((meta, disk_path)) => {
            debug!(
                action_id = %action_id,
                object = %object_key,
                size = meta.size,
                cost = ?started.elapsed(),
                "hit, downloaded from blob store",
            );
            Ok(GetResponse {
                miss: false,
                output_id: meta.output_id,
                size: meta.size,
                time: Some(meta.time),
                disk_path,
            })
        }
    }
}

/// Upload `EntryMeta ‖ body-from-disk` to the entry's standalone key.
/// Failures are logged and counted; nobody is waiting on the result.
async fn do_upload(
    inner: &Inner,
    req: &PutRequest,
    override_time: Option<DateTime<Utc>>,
    in_compaction: bool,
    disk_path: &str,
) {
    let object_key = key::entity_key(&req.action_id);
    let started = Instant::now();
    let meta = EntryMeta {
        action_id: req.action_id.clone(),
        output_id: req.output_id.clone(),
        size: req.body_size,
        time: override_time.unwrap_or_else(Utc::now),
    };
    let meta_len = meta.encoded_len();

    let result = bounded(&inner.cancel, MAX_UPLOAD_TIMEOUT, async {
        let head = Cursor::new(meta.encode());
        if req.body_size > 0 {
            let body = tokio::fs::File::open(disk_path).await?;
            inner
                .bucket
                .upload(&object_key, head.chain(body), CONTENT_TYPE)
                .await
        } else {
            inner.bucket.upload(&object_key, head, CONTENT_TYPE).await
        }
    })
    .await;

    match result {
        Ok(()) => {
            let tier = inner.metrics.tier(in_compaction);
            tier.uploaded_files.inc();
            tier.uploaded_bytes.add(req.body_size as u64 + meta_len as u64);
            debug!(
                action_id = %req.action_id,
                object = %object_key,
                cost = ?started.elapsed(),
                "uploaded file to blob store",
            );
        }
        Err(err) => {
            error!(
                action_id = %req.action_id,
                object = %object_key,
                disk_path = %disk_path,
                error = %err,
                "failed to upload file to blob store",
            );
        }
    }
}
