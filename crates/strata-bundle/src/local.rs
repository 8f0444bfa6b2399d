//! Local store of the current bundle reader per keyspace.
//!
//! Replacement protocol, designed so readers and the writer never contend:
//!
//! 1. write the incoming bundle to a uniquely-named temp file,
//! 2. open it as an [`ArReader`] to validate it,
//! 3. rename it over the final path (UNIX rename keeps already-open
//!    handles, and therefore previously handed-out readers, fully usable),
//! 4. install the new reader in the map.
//!
//! A replaced reader is never closed here; it closes when the last
//! outstanding `Arc` handle drops.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

use strata_types::{Keyspace, key};

use crate::ar::ArReader;
use crate::error::BundleError;

/// Concurrent map of keyspace → current bundle reader.
pub struct BundleLocalStore {
    work_dir: PathBuf,
    readers: RwLock<HashMap<Keyspace, Arc<ArReader>>>,
}

impl BundleLocalStore {
    /// Create the store, preparing the `blobar` directory under `work_dir`.
    pub fn new(work_dir: impl AsRef<Path>) -> Result<BundleLocalStore, BundleError> {
        let work_dir = work_dir.as_ref().to_path_buf();
        let ar_dir = key::archive_file_path(&work_dir, Keyspace::ALL[0])
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| work_dir.clone());
        std::fs::create_dir_all(&ar_dir)?;
        Ok(BundleLocalStore {
            work_dir,
            readers: RwLock::new(HashMap::new()),
        })
    }

    /// Open the bundle file for `keyspace` if one exists on disk and make
    /// it the current reader. An absent file is success with no change.
    pub async fn load_local(&self, keyspace: Keyspace) -> Result<(), BundleError> {
        let path = key::archive_file_path(&self.work_dir, keyspace);
        match fs::metadata(&path).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(BundleError::Io(err)),
            Ok(_) => {}
        }
        let reader = open_reader(path).await?;
        self.install(keyspace, reader);
        Ok(())
    }

    /// Ingest a new bundle from a stream: temp write, validate, rename,
    /// install. Returns the number of bytes written.
    pub async fn put<R: AsyncRead + Unpin>(
        &self,
        keyspace: Keyspace,
        mut stream: R,
    ) -> Result<u64, BundleError> {
        let final_path = key::archive_file_path(&self.work_dir, keyspace);
        let dir = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.work_dir.clone());
        fs::create_dir_all(&dir).await?;

        let tmp = tempfile::Builder::new()
            .prefix(&format!("{keyspace}.zip.tmp."))
            .tempfile_in(&dir)?;
        let (std_file, tmp_path) = tmp.into_parts();
        let mut file = fs::File::from_std(std_file);
        let written = tokio::io::copy(&mut stream, &mut file).await?;
        file.flush().await?;
        drop(file);

        // Validate before the rename so a broken download never replaces a
        // good bundle.
        let reader = open_reader(tmp_path.to_path_buf()).await?;
        tmp_path.persist(&final_path).map_err(|e| e.error)?;

        debug!(keyspace = %keyspace, entries = reader.len(), bytes = written, "installed bundle");
        self.install(keyspace, reader);
        Ok(written)
    }

    /// The current reader for `keyspace`, if any.
    pub fn get(&self, keyspace: Keyspace) -> Option<Arc<ArReader>> {
        self.readers
            .read()
            .expect("bundle reader map lock poisoned")
            .get(&keyspace)
            .cloned()
    }

    fn install(&self, keyspace: Keyspace, reader: Arc<ArReader>) {
        let mut map = self.readers.write().expect("bundle reader map lock poisoned");
        // The old reader stays open for whoever still holds a handle.
        map.insert(keyspace, reader);
    }
}

async fn open_reader(path: PathBuf) -> Result<Arc<ArReader>, BundleError> {
    let reader = tokio::task::spawn_blocking(move || ArReader::open(path))
        .await
        .map_err(|err| BundleError::Io(std::io::Error::other(err)))??;
    Ok(Arc::new(reader))
}
