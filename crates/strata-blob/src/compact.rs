//! Per-keyspace bundle compaction.
//!
//! Workflow:
//!
//! 1. refresh the keyspace's bundle from the bucket (best-effort),
//! 2. list the small standalone objects under `b/k`,
//! 3. diff against the current bundle; skip unless enough new objects
//!    showed up,
//! 4. fetch every listed object through the blob backend (which makes each
//!    one locally available as a side effect) and write a fresh bundle,
//! 5. ingest the bundle locally and upload it, last-writer-wins.
//!
//! Objects that disappeared from the bucket are dropped from the new
//! bundle, so bucket lifecycle rules (say, delete-after-30-days) shrink
//! bundles too. Concurrent runs for one keyspace are allowed; the later
//! upload simply wins.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strata_store::GetOpts;
use strata_types::metrics::{CounterExt, Metrics};
use strata_types::records::{GetRequest, GetResponse};
use strata_types::{ActionId, EntryMeta, Keyspace, key};

use crate::backend::BlobBackend;
use crate::bucket::Bucket;
use crate::bundle_store::BundleStore;
use crate::deadline::bounded;
use crate::error::BlobError;

/// Only objects below this size are bundled; the limit covers the
/// metadata header as well as the body.
pub const SMALL_BLOB_LIMIT: i64 = 1024 * 1024;
/// A keyspace is only rebuilt once this many unbundled objects exist.
pub const MIN_ADDED_FILES: usize = 10;
pub const LIST_PAGE_TIMEOUT: Duration = Duration::from_secs(20);

const GET_CONCURRENCY: usize = 32;

struct CompactItem {
    action_id: ActionId,
    object_key: String,
    /// Size in the bucket, metadata header included.
    object_size: i64,
}

enum Outcome {
    Skipped { planned: usize, added: usize },
    Compacted { planned: usize, included: usize },
}

/// One compaction run for one keyspace.
pub struct CompactionJob {
    keyspace: Keyspace,
    bundles: Arc<BundleStore>,
    backend: BlobBackend,
    bucket: Bucket,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl CompactionJob {
    pub fn new(
        keyspace: Keyspace,
        bundles: Arc<BundleStore>,
        backend: BlobBackend,
        bucket: Bucket,
        cancel: CancellationToken,
        metrics: Arc<Metrics>,
    ) -> CompactionJob {
        CompactionJob {
            keyspace,
            bundles,
            backend,
            bucket,
            cancel,
            metrics,
        }
    }

    /// Run the job to completion, recording the outcome in the metrics and
    /// the log. Never panics the caller; failures are contained here.
    pub async fn run(self) {
        self.metrics.compactor.total.inc();
        let started = Instant::now();
        match self.work().await {
            Ok(Outcome::Skipped { planned, added }) => {
                self.metrics.compactor.skip.inc();
                info!(
                    keyspace = %self.keyspace,
                    planned,
                    added,
                    min_required = MIN_ADDED_FILES,
                    cost = ?started.elapsed(),
                    "not enough new small objects, compaction skipped",
                );
            }
            Ok(Outcome::Compacted { planned, included }) => {
                self.metrics.compactor.success.inc();
                info!(
                    keyspace = %self.keyspace,
                    planned,
                    included,
                    cost = ?started.elapsed(),
                    "compaction finished",
                );
            }
            Err(err) => {
                self.metrics.compactor.fail.inc();
                error!(
                    keyspace = %self.keyspace,
                    cost = ?started.elapsed(),
                    error = %err,
                    "compaction failed",
                );
            }
        }
    }

    async fn work(&self) -> Result<Outcome, BlobError> {
        debug!(keyspace = %self.keyspace, "starting compaction");
        if let Err(err) = self.bundles.sync_from_remote(self.keyspace).await {
            warn!(keyspace = %self.keyspace, error = %err, "failed to refresh bundle before compaction");
        }

        let planned = self.find_small_objects().await?;
        if planned.is_empty() {
            return Ok(Outcome::Skipped { planned: 0, added: 0 });
        }

        let (added, added_bytes, removed) = self.diff_against_bundle(&planned);
        if added < MIN_ADDED_FILES {
            return Ok(Outcome::Skipped {
                planned: planned.len(),
                added,
            });
        }
        self.metrics.compactor.add_files.add(added as u64);
        self.metrics.compactor.add_bytes.add(added_bytes as u64);
        self.metrics.compactor.remove_files.add(removed as u64);
        info!(
            keyspace = %self.keyspace,
            planned = planned.len(),
            added,
            added_bytes,
            removed,
            "finished listing small objects",
        );

        let planned_count = planned.len();
        let (bundle_path, included) = self.build_bundle(planned).await?;
        self.bundles
            .ingest_new_archive(self.keyspace, &bundle_path)
            .await?;
        // The temp file is removed when `bundle_path` drops, on success and
        // failure alike.
        Ok(Outcome::Compacted {
            planned: planned_count,
            included,
        })
    }

    /// List every small standalone object of this keyspace. The bucket
    /// lists path segments, so the keyspace fans out over its 16 `b/kX`
    /// shard directories.
    async fn find_small_objects(&self) -> Result<Vec<CompactItem>, BlobError> {
        let mut items = Vec::new();
        for shard in 0..16u8 {
            let prefix = format!("{}{shard:x}", key::list_prefix(self.keyspace));
            let mut stream = self.bucket.list(&prefix);
            loop {
                let next = bounded(&self.cancel, LIST_PAGE_TIMEOUT, async {
                    stream.next().await.transpose().map_err(BlobError::from)
                })
                .await?;
                let Some(object) = next else { break };
                let object_size = object.size as i64;
                if object_size >= SMALL_BLOB_LIMIT {
                    continue;
                }
                let object_key = object.location.to_string();
                let Some(action_id) = key::decode_entity_key(&object_key) else {
                    warn!(object = %object_key, "skipping object that does not look like a cache entry");
                    continue;
                };
                debug!(
                    object = %object_key,
                    size = object_size,
                    action_id = %action_id,
                    "adding small object to compact list",
                );
                items.push(CompactItem {
                    action_id,
                    object_key,
                    object_size,
                });
            }
        }
        Ok(items)
    }

    /// How many listed objects are missing from the current bundle, their
    /// total listed size, and how many bundle entries the listing no longer
    /// contains.
    fn diff_against_bundle(&self, planned: &[CompactItem]) -> (usize, i64, usize) {
        let Some(archive) = self.bundles.archive(self.keyspace) else {
            let total: i64 = planned.iter().map(|item| item.object_size).sum();
            return (planned.len(), total, 0);
        };

        let mut added = 0usize;
        let mut added_bytes = 0i64;
        for item in planned {
            if !archive.contains(&key::entity_name_in_archive(&item.action_id)) {
                added += 1;
                added_bytes += item.object_size;
            }
        }
        let listed: HashSet<String> = planned
            .iter()
            .map(|item| key::entity_name_in_archive(&item.action_id))
            .collect();
        let removed = archive
            .names()
            .into_iter()
            .filter(|name| !listed.contains(name))
            .count();
        (added, added_bytes, removed)
    }

    /// Fetch every planned object through the blob backend and write the
    /// new bundle. Gets run on a bounded pool; a single writer thread
    /// drains them, because the bundle has exactly one writer.
    async fn build_bundle(
        &self,
        planned: Vec<CompactItem>,
    ) -> Result<(tempfile::TempPath, usize), BlobError> {
        let tmp = tempfile::Builder::new()
            .prefix("strata_compact.")
            .suffix(".zip")
            .tempfile()?;
        let (bundle_file, bundle_path) = tmp.into_parts();

        let (tx, rx) = mpsc::channel::<(CompactItem, GetResponse)>(GET_CONCURRENCY);
        let writer_metrics = Arc::clone(&self.metrics);
        let writer = tokio::task::spawn_blocking(move || {
            fill_bundle(bundle_file, rx, &writer_metrics)
        });

        let slots = Arc::new(Semaphore::new(GET_CONCURRENCY));
        let mut gets = JoinSet::new();
        for item in planned {
            let backend = self.backend.clone();
            let cancel = self.cancel.clone();
            let metrics = Arc::clone(&self.metrics);
            let slots = Arc::clone(&slots);
            let tx = tx.clone();
            gets.spawn(async move {
                let Ok(_permit) = slots.acquire_owned().await else {
                    return;
                };
                if cancel.is_cancelled() {
                    return;
                }
                let resp = backend
                    .get(GetOpts {
                        req: GetRequest {
                            action_id: item.action_id.clone(),
                        },
                        in_compaction: true,
                    })
                    .await;
                match resp {
                    Err(err) => {
                        warn!(object = %item.object_key, error = %err, "failed to get object for compaction");
                        metrics.compactor.skip_other.inc();
                    }
                    Ok(resp) if resp.miss => {
                        // Deleted between LIST and GET, most likely.
                        warn!(object = %item.object_key, "object listed but not found, skipping");
                        metrics.compactor.skip_missing.inc();
                    }
                    Ok(resp) => {
                        let _ = tx.send((item, resp)).await;
                    }
                }
            });
        }
        drop(tx);
        while gets.join_next().await.is_some() {}

        let included = writer
            .await
            .map_err(|err| BlobError::Io(std::io::Error::other(err)))??;
        Ok((bundle_path, included))
    }
}

/// The single writer: validate each fetched entry and add it to the
/// bundle. Per-item failures are counted and skipped, never fatal.
fn fill_bundle(
    bundle_file: std::fs::File,
    mut rx: mpsc::Receiver<(CompactItem, GetResponse)>,
    metrics: &Metrics,
) -> Result<usize, BlobError> {
    let mut writer = strata_bundle::ArWriter::new(bundle_file);
    let mut included = 0usize;

    while let Some((item, resp)) = rx.blocking_recv() {
        let data = match std::fs::read(&resp.disk_path) {
            Ok(data) => data,
            Err(err) => {
                warn!(object = %item.object_key, disk_path = %resp.disk_path, error = %err,
                    "failed to read local file for bundling");
                metrics.compactor.skip_io_failure.inc();
                continue;
            }
        };
        if data.len() as i64 != resp.size {
            warn!(object = %item.object_key, size_in_meta = resp.size, actual = data.len(),
                "corrupted local file, size disagrees with metadata");
            metrics.compactor.skip_corrupted.inc();
            continue;
        }
        let meta = EntryMeta {
            action_id: item.action_id.clone(),
            output_id: resp.output_id.clone(),
            size: resp.size,
            time: resp.time.unwrap_or(chrono::DateTime::UNIX_EPOCH),
        };
        // This is about to be uploaded for everyone; cross-check against
        // the size the bucket reported at list time.
        let local_object_size = meta.encoded_len() as i64 + data.len() as i64;
        if local_object_size != item.object_size {
            warn!(object = %item.object_key, size_in_remote = item.object_size, actual = local_object_size,
                "corrupted local file, size disagrees with listed object");
            metrics.compactor.skip_corrupted.inc();
            continue;
        }
        if let Err(err) = writer.add(&key::entity_name_in_archive(&item.action_id), &meta, &data) {
            warn!(object = %item.object_key, error = %err, "failed to add entry to new bundle");
            metrics.compactor.skip_io_failure.inc();
            continue;
        }
        included += 1;
    }

    writer.finish()?;
    Ok(included)
}
