//! Bounded byte pipe with error-close semantics.
//!
//! The engine's read loop writes decoded body chunks into the writer end;
//! the put handler consumes the reader end as plain `AsyncRead`. Dropping
//! the writer is a clean EOF; closing it with an error surfaces that error
//! to the reader.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// Create a pipe buffering up to `capacity` chunks.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            current: None,
            failed: false,
        },
    )
}

/// Producer end.
pub struct PipeWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl PipeWriter {
    /// Send one chunk, waiting for capacity. Fails with `BrokenPipe` once
    /// the reader is gone.
    pub async fn write(&self, chunk: Bytes) -> io::Result<()> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"))
    }

    /// Close the pipe with an error; the reader observes it after any
    /// buffered chunks.
    pub async fn close_with_error(self, err: io::Error) {
        let _ = self.tx.send(Err(err)).await;
    }
}

/// Consumer end; plain `AsyncRead`.
pub struct PipeReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Option<Bytes>,
    failed: bool,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.failed {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe already failed",
                )));
            }
            if let Some(chunk) = &mut self.current {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk.split_to(n));
                if chunk.is_empty() {
                    self.current = None;
                }
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    if !chunk.is_empty() {
                        self.current = Some(chunk);
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    self.failed = true;
                    return Poll::Ready(Err(err));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn test_write_then_read() {
        let (writer, mut reader) = pipe(4);
        tokio::spawn(async move {
            writer.write(Bytes::from_static(b"hello ")).await.unwrap();
            writer.write(Bytes::from_static(b"world")).await.unwrap();
        });
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_drop_writer_is_eof() {
        let (writer, mut reader) = pipe(4);
        drop(writer);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_error_close_surfaces_after_buffered_data() {
        let (writer, mut reader) = pipe(4);
        writer.write(Bytes::from_static(b"head")).await.unwrap();
        writer
            .close_with_error(io::Error::new(io::ErrorKind::ConnectionAborted, "upstream died"))
            .await;

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"head");
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_write_after_reader_drop_fails() {
        let (writer, reader) = pipe(1);
        drop(reader);
        let err = writer.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_bounded_capacity_applies_backpressure() {
        let (writer, mut reader) = pipe(1);
        let producer = tokio::spawn(async move {
            for _ in 0..8 {
                writer.write(Bytes::from_static(b"abcd")).await.unwrap();
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!producer.is_finished(), "producer must block on capacity");

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 32);
        producer.await.unwrap();
    }
}
