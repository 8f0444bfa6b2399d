//! The remote bucket seam.
//!
//! A thin wrapper over [`object_store`], pinned to the four capabilities
//! the cache needs: streaming reads with not-found detection, uploads with
//! a content type, prefix listing, and an accessibility probe. The concrete
//! store is chosen by URL (`s3://`, `gs://`, `azure://`, `file://`,
//! `memory:///`), optionally nested under a base prefix.

use futures::StreamExt;
use futures::stream::BoxStream;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::prefix::PrefixStore;
use object_store::{Attribute, Attributes, ObjectMeta, ObjectStore};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::StreamReader;

use crate::error::BlobError;

/// A handle on the remote object store.
#[derive(Clone)]
pub struct Bucket {
    store: Arc<dyn ObjectStore>,
}

impl Bucket {
    /// Open a bucket from its URL. Any path component of the URL becomes a
    /// base prefix under which all keys nest.
    pub fn open(url: &str) -> Result<Bucket, BlobError> {
        let parsed = url::Url::parse(url)?;
        let (store, prefix) = object_store::parse_url(&parsed)?;
        let store: Arc<dyn ObjectStore> = if prefix.as_ref().is_empty() {
            Arc::from(store)
        } else {
            Arc::new(PrefixStore::new(store, prefix))
        };
        Ok(Bucket { store })
    }

    /// Wrap an already-built store. Used by tests with an in-memory store.
    pub fn from_store(store: Arc<dyn ObjectStore>) -> Bucket {
        Bucket { store }
    }

    /// Open a streaming reader on an object. `None` means the key does not
    /// exist — never an error.
    pub async fn reader(
        &self,
        key: &str,
    ) -> Result<Option<impl AsyncRead + Send + Unpin + use<>>, BlobError> {
        let result = match self.store.get(&ObjectPath::from(key)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let stream = result
            .into_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        Ok(Some(StreamReader::new(stream)))
    }

    /// Fetch a whole object. `None` means the key does not exist.
    pub async fn get_bytes(&self, key: &str) -> Result<Option<bytes::Bytes>, BlobError> {
        match self.store.get(&ObjectPath::from(key)).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Upload an object from a stream, overwriting any previous version.
    pub async fn upload<R: AsyncRead + Unpin>(
        &self,
        key: &str,
        mut body: R,
        content_type: &str,
    ) -> Result<(), BlobError> {
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());
        let mut writer = BufWriter::new(Arc::clone(&self.store), ObjectPath::from(key))
            .with_attributes(attributes);
        tokio::io::copy(&mut body, &mut writer).await?;
        writer.shutdown().await?;
        Ok(())
    }

    /// List objects under a path prefix. The stream yields keys relative
    /// to the bucket root (base prefix already stripped).
    pub fn list(&self, prefix: &str) -> BoxStream<'static, Result<ObjectMeta, object_store::Error>> {
        self.store.list(Some(&ObjectPath::from(prefix)))
    }

    /// Probe whether the bucket can be reached at all. Listing nothing is
    /// fine; failing to list is not.
    pub async fn is_accessible(&self) -> Result<(), BlobError> {
        let mut stream = self.store.list(None);
        match stream.next().await {
            None | Some(Ok(_)) => Ok(()),
            Some(Err(object_store::Error::NotFound { .. })) => Ok(()),
            Some(Err(err)) => Err(BlobError::NotAccessible(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;

    use super::*;

    fn memory_bucket() -> Bucket {
        Bucket::from_store(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn test_upload_then_read_back() {
        let bucket = memory_bucket();
        bucket
            .upload("b/ab/abcd", &b"hello object"[..], "application/octet-stream")
            .await
            .unwrap();

        let bytes = bucket.get_bytes("b/ab/abcd").await.unwrap().unwrap();
        assert_eq!(bytes.as_ref(), b"hello object");

        let mut reader = bucket.reader("b/ab/abcd").await.unwrap().unwrap();
        let mut content = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut content)
            .await
            .unwrap();
        assert_eq!(content, b"hello object");
    }

    #[tokio::test]
    async fn test_absent_key_is_none() {
        let bucket = memory_bucket();
        assert!(bucket.reader("nope").await.unwrap().is_none());
        assert!(bucket.get_bytes("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upload_overwrites() {
        let bucket = memory_bucket();
        bucket.upload("k", &b"one"[..], "text/plain").await.unwrap();
        bucket.upload("k", &b"two"[..], "text/plain").await.unwrap();
        assert_eq!(bucket.get_bytes("k").await.unwrap().unwrap().as_ref(), b"two");
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let bucket = memory_bucket();
        for key in ["b/a0/a001", "b/a0/a002", "b/b0/b001"] {
            bucket.upload(key, &b"x"[..], "text/plain").await.unwrap();
        }
        let mut listed: Vec<String> = bucket
            .list("b/a0")
            .map(|item| item.unwrap().location.to_string())
            .collect::<Vec<_>>()
            .await;
        listed.sort();
        assert_eq!(listed, vec!["b/a0/a001", "b/a0/a002"]);
    }

    #[tokio::test]
    async fn test_empty_bucket_is_accessible() {
        memory_bucket().is_accessible().await.unwrap();
    }
}
