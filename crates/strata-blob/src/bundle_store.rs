//! Syncs per-keyspace bundles between the bucket and the local store.
//!
//! One shared access point for both the read path and the compactor, so a
//! bundle downloaded for one is immediately visible to the other.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use strata_bundle::{ArEntry, ArReader, BundleLocalStore};
use strata_types::metrics::{CounterExt, Metrics};
use strata_types::{ActionId, Keyspace, key};

use crate::bucket::Bucket;
use crate::deadline::bounded;
use crate::error::BlobError;

/// Skip a sync when the keyspace was synced this recently.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(5);
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

const CONTENT_TYPE: &str = "application/octet-stream";

/// Bundle access point coupling the local reader store with the bucket.
pub struct BundleStore {
    local: BundleLocalStore,
    bucket: Bucket,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
    last_sync: Mutex<HashMap<Keyspace, Instant>>,
}

impl BundleStore {
    /// Construct the store, load every keyspace's bundle from local disk in
    /// parallel, then (unless skipped) sync every keyspace from the bucket
    /// in parallel. Per-keyspace failures are logged, never fatal.
    pub async fn open(
        work_dir: impl AsRef<Path>,
        bucket: Bucket,
        cancel: CancellationToken,
        metrics: Arc<Metrics>,
        skip_initial_sync: bool,
    ) -> Result<Arc<BundleStore>, BlobError> {
        let store = Arc::new(BundleStore {
            local: BundleLocalStore::new(work_dir)?,
            bucket,
            cancel,
            metrics,
            last_sync: Mutex::new(HashMap::new()),
        });

        let mut loads = JoinSet::new();
        for keyspace in Keyspace::ALL {
            let store = Arc::clone(&store);
            loads.spawn(async move {
                store.metrics.bundle_store.load_total.inc();
                if let Err(err) = store.local.load_local(keyspace).await {
                    store.metrics.bundle_store.load_fail.inc();
                    warn!(keyspace = %keyspace, error = %err, "failed to load local bundle");
                }
            });
        }
        while loads.join_next().await.is_some() {}

        if !skip_initial_sync {
            let mut syncs = JoinSet::new();
            for keyspace in Keyspace::ALL {
                let store = Arc::clone(&store);
                syncs.spawn(async move {
                    if let Err(err) = store.sync_from_remote(keyspace).await {
                        warn!(keyspace = %keyspace, error = %err, "failed to sync bundle from remote");
                    }
                });
            }
            while syncs.join_next().await.is_some() {}
        }

        info!("bundle store opened");
        Ok(store)
    }

    /// Download the keyspace's bundle from the bucket into the local store.
    /// Rate-limited per keyspace; a bucket without a bundle is a no-op.
    pub async fn sync_from_remote(&self, keyspace: Keyspace) -> Result<(), BlobError> {
        {
            let last_sync = self.last_sync.lock().expect("last-sync lock poisoned");
            if let Some(at) = last_sync.get(&keyspace)
                && at.elapsed() < MIN_SYNC_INTERVAL
            {
                return Ok(());
            }
        }

        self.metrics.bundle_store.download_total.inc();
        let result = bounded(&self.cancel, DOWNLOAD_TIMEOUT, async {
            match self.bucket.reader(&key::archive_key(keyspace)).await? {
                None => Ok(None),
                Some(stream) => Ok(Some(self.local.put(keyspace, stream).await?)),
            }
        })
        .await;

        match result {
            Ok(None) => {
                self.metrics.bundle_store.download_skip.inc();
                Ok(())
            }
            Ok(Some(bytes)) => {
                self.metrics.bundle_store.download_bytes.add(bytes);
                self.record_sync(keyspace);
                Ok(())
            }
            Err(err) => {
                self.metrics.bundle_store.download_fail.inc();
                Err(err)
            }
        }
    }

    /// Install a freshly built bundle locally, then upload it to the
    /// bucket. Remote replacement is last-writer-wins by design.
    pub async fn ingest_new_archive(
        &self,
        keyspace: Keyspace,
        bundle_path: &Path,
    ) -> Result<(), BlobError> {
        // Local first, which also validates the file before it can clobber
        // the remote copy.
        let file = tokio::fs::File::open(bundle_path).await?;
        self.local.put(keyspace, file).await?;

        let file = tokio::fs::File::open(bundle_path).await?;
        bounded(
            &self.cancel,
            UPLOAD_TIMEOUT,
            self.bucket
                .upload(&key::archive_key(keyspace), file, CONTENT_TYPE),
        )
        .await?;
        self.record_sync(keyspace);
        Ok(())
    }

    /// The current reader for a keyspace, if one is loaded.
    pub fn archive(&self, keyspace: Keyspace) -> Option<Arc<ArReader>> {
        self.local.get(keyspace)
    }

    /// Resolve one entry inside the keyspace's current bundle, verifying
    /// that the embedded action id matches. Corruption is logged and
    /// treated as absent.
    pub fn blob(&self, keyspace: Keyspace, action_id: &ActionId) -> Option<ArEntry> {
        let reader = self.local.get(keyspace)?;
        let entry = reader.get(&key::entity_name_in_archive(action_id))?;
        if entry.meta.action_id != *action_id {
            error!(
                keyspace = %keyspace,
                action_id = %action_id,
                embedded = %entry.meta.action_id,
                "corrupted bundle entry",
            );
            return None;
        }
        Some(entry)
    }

    fn record_sync(&self, keyspace: Keyspace) {
        self.last_sync
            .lock()
            .expect("last-sync lock poisoned")
            .insert(keyspace, Instant::now());
    }
}
