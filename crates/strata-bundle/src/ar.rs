//! Bundle archive reader and writer.
//!
//! The writer accepts whole entries (a buffer, not a stream) so the size
//! can be checked against the metadata before anything lands in the
//! archive; bundles only ever hold small entries, so buffering is fine.
//!
//! The reader parses every entry's metadata once at open time and serves
//! random-access lookups from a name-keyed map. It is safe for concurrent
//! use; the underlying zip handle is serialized with a mutex and entry
//! bodies are small, so reads hold it only briefly.

use std::collections::HashMap;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use strata_types::EntryMeta;

use crate::error::BundleError;

/// Writes a bundle archive to any seekable sink.
pub struct ArWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
}

impl<W: Write + Seek> ArWriter<W> {
    pub fn new(sink: W) -> ArWriter<W> {
        ArWriter {
            zip: ZipWriter::new(sink),
        }
    }

    /// Append one entry. `data.len()` must equal `meta.size`.
    pub fn add(&mut self, name: &str, meta: &EntryMeta, data: &[u8]) -> Result<(), BundleError> {
        if data.len() as i64 != meta.size {
            return Err(BundleError::SizeMismatch {
                name: name.to_string(),
                expected: meta.size,
                actual: data.len() as i64,
            });
        }
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        self.zip.start_file(name, options)?;
        self.zip.write_all(&meta.encode())?;
        self.zip.write_all(data)?;
        Ok(())
    }

    /// Finalize the central directory and hand back the sink.
    pub fn finish(self) -> Result<W, BundleError> {
        Ok(self.zip.finish()?)
    }
}

struct IndexedEntry {
    index: usize,
    meta: EntryMeta,
}

/// A read handle on one bundle file.
///
/// Handed out as `Arc<ArReader>`; entry handles keep their reader alive, so
/// a bundle replaced in the local store stays readable until the last
/// consumer lets go.
pub struct ArReader {
    path: PathBuf,
    entries: HashMap<String, IndexedEntry>,
    zip: Mutex<ZipArchive<std::fs::File>>,
}

impl ArReader {
    /// Open a bundle and parse every entry's metadata head. Fails if any
    /// entry's metadata cannot be parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<ArReader, BundleError> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path)?;
        let mut zip = ZipArchive::new(file)?;

        let mut entries = HashMap::with_capacity(zip.len());
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index)?;
            let name = entry.name().to_string();
            let meta = EntryMeta::read_from_sync(&mut entry).map_err(|err| {
                BundleError::Corrupted {
                    name: name.clone(),
                    reason: format!("unreadable entry metadata: {err}"),
                }
            })?;
            drop(entry);
            entries.insert(name, IndexedEntry { index, meta });
        }

        Ok(ArReader {
            path,
            entries,
            zip: Mutex::new(zip),
        })
    }

    /// O(1) lookup of an entry by name.
    pub fn get(self: &Arc<Self>, name: &str) -> Option<ArEntry> {
        let indexed = self.entries.get(name)?;
        Some(ArEntry {
            meta: indexed.meta.clone(),
            index: indexed.index,
            reader: Arc::clone(self),
        })
    }

    /// Whether an entry with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// All entry names, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The file this reader was opened from. May have been renamed over
    /// since; the open handle stays valid regardless.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_body_blocking(&self, index: usize, meta: &EntryMeta) -> Result<Bytes, BundleError> {
        let mut zip = self.zip.lock().expect("bundle zip lock poisoned");
        let mut entry = zip.by_index(index)?;
        let name = entry.name().to_string();

        let mut head = vec![0u8; meta.encoded_len()];
        entry.read_exact(&mut head).map_err(|err| BundleError::Corrupted {
            name: name.clone(),
            reason: format!("entry shorter than its metadata head: {err}"),
        })?;
        let mut body = Vec::with_capacity(meta.size.max(0) as usize);
        entry.read_to_end(&mut body)?;
        if body.len() as i64 != meta.size {
            return Err(BundleError::Corrupted {
                name,
                reason: format!(
                    "payload size {} does not match metadata size {}",
                    body.len(),
                    meta.size
                ),
            });
        }
        Ok(Bytes::from(body))
    }
}

/// One entry resolved inside a bundle. Cheap to clone; holds its reader
/// alive.
#[derive(Clone)]
pub struct ArEntry {
    pub meta: EntryMeta,
    index: usize,
    reader: Arc<ArReader>,
}

impl ArEntry {
    /// Read the entry's body, verifying it against the metadata size.
    pub async fn read_body(&self) -> Result<Bytes, BundleError> {
        let reader = Arc::clone(&self.reader);
        let index = self.index;
        let meta = self.meta.clone();
        tokio::task::spawn_blocking(move || reader.read_body_blocking(index, &meta))
            .await
            .map_err(|err| BundleError::Io(std::io::Error::other(err)))?
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use strata_types::{ActionId, OutputId};
    use tempfile::TempDir;

    use super::*;

    fn meta(action: &[u8], size: i64) -> EntryMeta {
        EntryMeta {
            action_id: ActionId::from(action),
            output_id: OutputId::from(&[0xee; 2][..]),
            size,
            time: Utc.timestamp_nanos(1_000_000_000),
        }
    }

    fn write_bundle(path: &Path, entries: &[(&str, EntryMeta, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = ArWriter::new(file);
        for (name, meta, data) in entries {
            writer.add(name, meta, data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.zip");
        let m = meta(&[0xaa, 0xbb], 5);
        write_bundle(&path, &[("aabb", m.clone(), b"hello")]);

        let reader = Arc::new(ArReader::open(&path).unwrap());
        let entry = reader.get("aabb").unwrap();
        assert_eq!(entry.meta, m);
        assert_eq!(entry.read_body().await.unwrap(), Bytes::from_static(b"hello"));
        assert!(reader.get("ccdd").is_none());
    }

    #[test]
    fn test_empty_bundle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.zip");
        write_bundle(&path, &[]);

        let reader = Arc::new(ArReader::open(&path).unwrap());
        assert!(reader.is_empty());
        assert!(reader.names().is_empty());
        assert!(reader.get("anything").is_none());
    }

    #[test]
    fn test_add_rejects_size_mismatch() {
        let dir = TempDir::new().unwrap();
        let file = std::fs::File::create(dir.path().join("bad.zip")).unwrap();
        let mut writer = ArWriter::new(file);
        let err = writer.add("aabb", &meta(&[0xaa, 0xbb], 9), b"short").unwrap_err();
        assert!(matches!(
            err,
            BundleError::SizeMismatch {
                expected: 9,
                actual: 5,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_zero_size_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zero.zip");
        write_bundle(&path, &[("00ff", meta(&[0x00, 0xff], 0), b"")]);

        let reader = Arc::new(ArReader::open(&path).unwrap());
        let entry = reader.get("00ff").unwrap();
        assert_eq!(entry.meta.size, 0);
        assert!(entry.read_body().await.unwrap().is_empty());
    }

    #[test]
    fn test_open_rejects_unparseable_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.zip");
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = ZipWriter::new(file);
        zip.start_file("aabb", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"no").unwrap();
        zip.finish().unwrap();

        assert!(matches!(
            ArReader::open(&path),
            Err(BundleError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_open_rejects_non_zip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not.zip");
        std::fs::write(&path, b"this is not an archive").unwrap();
        assert!(matches!(ArReader::open(&path), Err(BundleError::Zip(_))));
    }

    #[tokio::test]
    async fn test_concurrent_reads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("many.zip");
        let mut entries = Vec::new();
        for i in 0..20u8 {
            entries.push((format!("{i:02x}00"), meta(&[i, 0x00], 4)));
        }
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut writer = ArWriter::new(file);
            for (name, m) in &entries {
                writer.add(name, m, b"data").unwrap();
            }
            writer.finish().unwrap();
        }

        let reader = Arc::new(ArReader::open(&path).unwrap());
        let mut tasks = Vec::new();
        for (name, _) in entries {
            let reader = Arc::clone(&reader);
            tasks.push(tokio::spawn(async move {
                reader.get(&name).unwrap().read_body().await.unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), Bytes::from_static(b"data"));
        }
    }
}
