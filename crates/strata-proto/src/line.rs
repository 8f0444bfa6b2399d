//! Chunked line reading.
//!
//! Reads lines without materializing them: a line that fits the buffer
//! comes back as one final chunk, a longer line as a series of
//! continuation chunks. Header lines must fit in one chunk (the caller
//! enforces that); body lines may be arbitrarily long and are streamed.
//! Empty lines between records are skipped.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

const DEFAULT_CAPACITY: usize = 4096;
/// Consecutive empty lines tolerated before giving up on the stream.
const MAX_EMPTY_LINES: usize = 10;

/// One piece of a line. `is_last` marks the end of the line.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub data: Bytes,
    pub is_last: bool,
}

/// Buffered chunked line reader.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    /// Whether the previous chunk left a line unfinished.
    mid_line: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> LineReader<R> {
        LineReader::with_capacity(inner, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: R, capacity: usize) -> LineReader<R> {
        LineReader {
            inner,
            buf: vec![0u8; capacity],
            start: 0,
            end: 0,
            mid_line: false,
        }
    }

    /// The next chunk of the current (or next non-empty) line. `None`
    /// means clean end of input at a line boundary.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Chunk>> {
        let mut empty_lines = 0usize;
        loop {
            if let Some(pos) = self.buf[self.start..self.end]
                .iter()
                .position(|&b| b == b'\n')
            {
                let mut line = &self.buf[self.start..self.start + pos];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                let chunk = Bytes::copy_from_slice(line);
                self.start += pos + 1;
                if self.start == self.end {
                    self.start = 0;
                    self.end = 0;
                }
                if chunk.is_empty() && !self.mid_line {
                    empty_lines += 1;
                    if empty_lines >= MAX_EMPTY_LINES {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "no progress: too many consecutive empty lines",
                        ));
                    }
                    continue;
                }
                self.mid_line = false;
                return Ok(Some(Chunk {
                    data: chunk,
                    is_last: true,
                }));
            }

            // No newline buffered. A full buffer becomes a continuation
            // chunk; otherwise read more.
            if self.end - self.start == self.buf.len() {
                let chunk = Bytes::copy_from_slice(&self.buf[self.start..self.end]);
                self.start = 0;
                self.end = 0;
                self.mid_line = true;
                return Ok(Some(Chunk {
                    data: chunk,
                    is_last: false,
                }));
            }
            if self.start > 0 {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            }
            let n = self.inner.read(&mut self.buf[self.end..]).await?;
            if n == 0 {
                if self.start == self.end {
                    return Ok(None);
                }
                // Input ended mid-line; treat what is buffered as the
                // final chunk.
                let chunk = Bytes::copy_from_slice(&self.buf[self.start..self.end]);
                self.start = 0;
                self.end = 0;
                self.mid_line = false;
                return Ok(Some(Chunk {
                    data: chunk,
                    is_last: true,
                }));
            }
            self.end += n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_lines(input: &[u8]) -> Vec<(Vec<u8>, bool)> {
        let mut reader = LineReader::with_capacity(input, 8);
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            chunks.push((chunk.data.to_vec(), chunk.is_last));
        }
        chunks
    }

    #[tokio::test]
    async fn test_short_lines() {
        let chunks = collect_lines(b"one\ntwo\n").await;
        assert_eq!(
            chunks,
            vec![(b"one".to_vec(), true), (b"two".to_vec(), true)]
        );
    }

    #[tokio::test]
    async fn test_empty_lines_skipped() {
        let chunks = collect_lines(b"\n\none\n\ntwo\n").await;
        assert_eq!(
            chunks,
            vec![(b"one".to_vec(), true), (b"two".to_vec(), true)]
        );
    }

    #[tokio::test]
    async fn test_crlf_stripped() {
        let chunks = collect_lines(b"one\r\ntwo\r\n").await;
        assert_eq!(
            chunks,
            vec![(b"one".to_vec(), true), (b"two".to_vec(), true)]
        );
    }

    #[tokio::test]
    async fn test_long_line_streams_in_chunks() {
        // 20 bytes through an 8-byte buffer: 8 + 8 + 4.
        let chunks = collect_lines(b"abcdefghijklmnopqrst\nx\n").await;
        assert_eq!(
            chunks,
            vec![
                (b"abcdefgh".to_vec(), false),
                (b"ijklmnop".to_vec(), false),
                (b"qrst".to_vec(), true),
                (b"x".to_vec(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_eof_mid_line_flushes() {
        let chunks = collect_lines(b"partial").await;
        assert_eq!(chunks, vec![(b"partial".to_vec(), true)]);
    }

    #[tokio::test]
    async fn test_empty_chunk_mid_line_is_not_skipped() {
        // A line of exactly 2x the buffer: the content fills two
        // continuation chunks and the line end arrives with an empty final
        // chunk, which must not be treated as an empty line.
        let chunks = collect_lines(b"abcdefghijklmnop\nz\n").await;
        assert_eq!(
            chunks,
            vec![
                (b"abcdefgh".to_vec(), false),
                (b"ijklmnop".to_vec(), false),
                (b"".to_vec(), true),
                (b"z".to_vec(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_too_many_empty_lines_errors() {
        let input = vec![b'\n'; 64];
        let mut reader = LineReader::with_capacity(input.as_slice(), 8);
        assert!(reader.next_chunk().await.is_err());
    }
}
