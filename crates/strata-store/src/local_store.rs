//! Content-addressed local disk store.
//!
//! Layout under `<work_dir>/data`:
//!
//! - `XX/HEX.action` — the [`EntryMeta`] header for one action, where `XX`
//!   is the first id byte in hex and `HEX` the full id.
//! - `XX/HEX.output` — the body, keyed by output id.
//! - `_empty.output` — one shared zero-length file referenced by every
//!   entry with an empty body.
//!
//! Writes go to a uniquely-named temp file in the target directory and are
//! renamed into place, so a torn file is never observable under its final
//! name. Gets and puts are each single-flighted by action id.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use strata_types::records::{GetResponse, PutResponse};
use strata_types::{ActionId, EntryMeta, OutputId};

use crate::error::StoreError;
use crate::flight::FlightGroup;
use crate::traits::{CacheBackend, GetOpts, PutOpts};

/// Bump a file's last-access marker only when it is at least this stale.
const MARK_USED_THRESHOLD: Duration = Duration::from_secs(3600);

type FlightResult<T> = Result<T, Arc<StoreError>>;

/// The local on-disk cache backend.
pub struct LocalStore {
    dir: PathBuf,
    closed: AtomicBool,
    get_flights: FlightGroup<ActionId, FlightResult<GetResponse>>,
    put_flights: FlightGroup<ActionId, FlightResult<PutResponse>>,
}

impl LocalStore {
    /// Open the store under `work_dir`, pre-creating the 256 shard
    /// directories and the shared empty output file. Idempotent.
    pub async fn open(work_dir: impl AsRef<Path>) -> Result<LocalStore, StoreError> {
        let dir = work_dir.as_ref().join("data");
        for i in 0..256u16 {
            fs::create_dir_all(dir.join(format!("{i:02x}"))).await?;
        }
        ensure_empty_output_file(&dir).await?;
        info!(dir = %dir.display(), "local cache store opened");
        Ok(LocalStore {
            dir,
            closed: AtomicBool::new(false),
            get_flights: FlightGroup::new(),
            put_flights: FlightGroup::new(),
        })
    }

    /// Path of the shared zero-length output file, creating it if needed.
    pub async fn ensure_empty_output_file(&self) -> Result<PathBuf, StoreError> {
        ensure_empty_output_file(&self.dir).await
    }

    fn action_path(&self, action_id: &ActionId) -> PathBuf {
        let first = action_id.as_bytes().first().copied().unwrap_or(0);
        self.dir
            .join(format!("{first:02x}"))
            .join(format!("{action_id}.action"))
    }

    fn output_path(&self, output_id: &OutputId) -> PathBuf {
        let first = output_id.as_bytes().first().copied().unwrap_or(0);
        self.dir
            .join(format!("{first:02x}"))
            .join(format!("{output_id}.output"))
    }

    /// Look up an entry. Every internal failure is logged and reported as
    /// a miss: a miss is always safe, a stale hit is not.
    pub async fn get(&self, opts: GetOpts) -> Result<GetResponse, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let action_id = opts.req.action_id.clone();
        let dir = self.dir.clone();
        let flight_id = action_id.clone();
        let result = self
            .get_flights
            .run(action_id.clone(), async move {
                get_inner(dir, flight_id).await.map_err(Arc::new)
            })
            .await;
        match result {
            Ok(resp) => Ok(resp),
            Err(err) => {
                warn!(action_id = %action_id, error = %err, "failed to get from local cache");
                Ok(GetResponse::miss())
            }
        }
    }

    /// Store an entry. I/O failures propagate; the partially-written temp
    /// file is discarded.
    pub async fn put(&self, opts: PutOpts) -> Result<PutResponse, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let action_id = opts.req.action_id.clone();
        let action_path = self.action_path(&action_id);
        let output_path = self.output_path(&opts.req.output_id);
        let dir = self.dir.clone();
        let result = self
            .put_flights
            .run(action_id.clone(), async move {
                put_inner(dir, action_path, output_path, opts)
                    .await
                    .map_err(Arc::new)
            })
            .await;
        match result {
            Ok(resp) => {
                debug!(action_id = %action_id, disk_path = %resp.disk_path, "put in local cache");
                Ok(resp)
            }
            Err(err) => {
                warn!(action_id = %action_id, error = %err, "failed to put in local cache");
                Err(StoreError::Shared(err))
            }
        }
    }

    /// Reject further requests.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        info!("local cache store closed");
    }
}

#[async_trait::async_trait]
impl CacheBackend for LocalStore {
    async fn get(&self, opts: GetOpts) -> anyhow::Result<GetResponse> {
        Ok(LocalStore::get(self, opts).await?)
    }

    async fn put(&self, opts: PutOpts) -> anyhow::Result<PutResponse> {
        Ok(LocalStore::put(self, opts).await?)
    }

    async fn close(&self) -> anyhow::Result<()> {
        LocalStore::close(self);
        Ok(())
    }
}

async fn ensure_empty_output_file(dir: &Path) -> Result<PathBuf, StoreError> {
    let path = dir.join("_empty.output");
    match fs::metadata(&path).await {
        Ok(md) if md.is_file() && md.len() == 0 => return Ok(path),
        _ => {}
    }
    fs::create_dir_all(dir).await?;
    fs::write(&path, b"").await?;
    Ok(path)
}

async fn get_inner(dir: PathBuf, action_id: ActionId) -> Result<GetResponse, StoreError> {
    let first = action_id.as_bytes().first().copied().unwrap_or(0);
    let action_path = dir
        .join(format!("{first:02x}"))
        .join(format!("{action_id}.action"));

    let mut action_file = match fs::File::open(&action_path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(action_id = %action_id, "miss in local cache");
            return Ok(GetResponse::miss());
        }
        Err(err) => return Err(StoreError::Io(err)),
    };
    let meta = EntryMeta::read_from(&mut action_file).await?;
    drop(action_file);

    if meta.action_id != action_id {
        return Err(StoreError::ActionIdMismatch {
            expected: action_id,
            actual: meta.action_id,
        });
    }

    let output_path = if meta.size == 0 {
        ensure_empty_output_file(&dir).await?
    } else {
        let first = meta.output_id.as_bytes().first().copied().unwrap_or(0);
        let output_path = dir
            .join(format!("{first:02x}"))
            .join(format!("{}.output", meta.output_id));
        match fs::metadata(&output_path).await {
            Err(err) => {
                let _ = fs::remove_file(&action_path).await;
                return Err(StoreError::Io(err));
            }
            Ok(md) if md.is_dir() => {
                let _ = fs::remove_file(&action_path).await;
                let _ = fs::remove_dir_all(&output_path).await;
                return Err(StoreError::OutputIsDirectory(output_path));
            }
            Ok(md) if md.len() as i64 != meta.size => {
                let _ = fs::remove_file(&action_path).await;
                let _ = fs::remove_file(&output_path).await;
                return Err(StoreError::SizeMismatch {
                    expected: meta.size,
                    actual: md.len() as i64,
                });
            }
            Ok(_) => output_path,
        }
    };

    mark_recently_used(&action_path);
    if meta.size > 0 {
        mark_recently_used(&output_path);
    }

    debug!(action_id = %action_id, "hit in local cache");
    Ok(GetResponse {
        miss: false,
        output_id: meta.output_id,
        size: meta.size,
        time: Some(meta.time),
        disk_path: output_path.to_string_lossy().into_owned(),
    })
}

async fn put_inner(
    dir: PathBuf,
    action_path: PathBuf,
    output_path: PathBuf,
    opts: PutOpts,
) -> Result<PutResponse, StoreError> {
    let PutOpts {
        req,
        mut body,
        override_time,
        ..
    } = opts;

    // Body first, so a hit can never observe a meta without its output.
    let output_path = if req.body_size > 0 {
        let parent = output_path.parent().unwrap_or(&dir);
        fs::create_dir_all(parent).await?;
        let file_name = output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = tempfile::Builder::new()
            .prefix(&format!("{file_name}.tmp."))
            .tempfile_in(parent)?;
        let (std_file, tmp_path) = tmp.into_parts();
        let mut file = fs::File::from_std(std_file);
        let copied = tokio::io::copy(&mut body, &mut file).await?;
        if copied as i64 != req.body_size {
            return Err(StoreError::SizeMismatch {
                expected: req.body_size,
                actual: copied as i64,
            });
        }
        file.flush().await?;
        drop(file);
        tmp_path.persist(&output_path).map_err(|e| e.error)?;
        output_path
    } else {
        ensure_empty_output_file(&dir).await?
    };

    let meta = EntryMeta {
        action_id: req.action_id,
        output_id: req.output_id,
        size: req.body_size,
        time: override_time.unwrap_or_else(chrono::Utc::now),
    };
    {
        let parent = action_path.parent().unwrap_or(&dir);
        fs::create_dir_all(parent).await?;
        let file_name = action_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = tempfile::Builder::new()
            .prefix(&format!("{file_name}.tmp."))
            .tempfile_in(parent)?;
        let (std_file, tmp_path) = tmp.into_parts();
        let mut file = fs::File::from_std(std_file);
        file.write_all(&meta.encode()).await?;
        file.flush().await?;
        drop(file);
        tmp_path.persist(&action_path).map_err(|e| e.error)?;
    }

    // No fsync: this is a cache, the filesystem's durability is enough.

    Ok(PutResponse {
        disk_path: output_path.to_string_lossy().into_owned(),
    })
}

/// Follow the toolchain's own trick for approximating last-access time:
/// bump mtime, but only once per hour to keep hits cheap.
fn mark_recently_used(path: &Path) {
    let Ok(md) = std::fs::metadata(path) else {
        return;
    };
    let Ok(modified) = md.modified() else {
        return;
    };
    let now = SystemTime::now();
    let stale = now
        .duration_since(modified)
        .map_or(false, |age| age >= MARK_USED_THRESHOLD);
    if stale && let Ok(file) = std::fs::File::options().append(true).open(path) {
        let _ = file.set_modified(now);
    }
}
