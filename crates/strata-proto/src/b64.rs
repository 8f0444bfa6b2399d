//! Streaming base64.
//!
//! Bodies travel as one quoted base64 string on the wire. The decoder
//! consumes arbitrary chunk boundaries without materializing the whole
//! string: it decodes every complete 4-character group as it arrives and
//! carries the remainder into the next chunk. The encoder is its stream
//! counterpart, used when forwarding a body to the daemon.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Incremental base64 decoder.
#[derive(Default)]
pub struct StreamDecoder {
    carry: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> StreamDecoder {
        StreamDecoder::default()
    }

    /// Decode every complete group in `carry ‖ input`; the incomplete tail
    /// is carried over.
    pub fn feed(&mut self, input: &[u8]) -> Result<Vec<u8>, base64::DecodeError> {
        self.carry.extend_from_slice(input);
        let aligned = self.carry.len() / 4 * 4;
        if aligned == 0 {
            return Ok(Vec::new());
        }
        let decoded = BASE64.decode(&self.carry[..aligned])?;
        self.carry.drain(..aligned);
        Ok(decoded)
    }

    /// Decode whatever is left. Valid base64 input always ends on a group
    /// boundary, so a non-empty remainder is an error.
    pub fn finish(self) -> Result<Vec<u8>, base64::DecodeError> {
        if self.carry.is_empty() {
            return Ok(Vec::new());
        }
        BASE64.decode(&self.carry)
    }
}

/// Input bytes per encoded chunk; a multiple of 3 so that padding only
/// appears in the final chunk.
const ENCODE_CHUNK: usize = 48 * 1024;

/// Turn a body reader into a `"<base64>"` byte stream: opening quote,
/// encoded chunks, closing quote.
pub fn encode_quoted_stream<R>(body: R) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static
where
    R: AsyncRead + Send + Unpin + 'static,
{
    enum State<R> {
        Start(R),
        Body(R),
        Done,
    }

    futures::stream::unfold(State::Start(body), |state| async move {
        match state {
            State::Start(body) => Some((Ok(Bytes::from_static(b"\"")), State::Body(body))),
            State::Body(mut body) => {
                let mut buf = vec![0u8; ENCODE_CHUNK];
                let mut filled = 0usize;
                // Fill the whole chunk unless the body ends: a short chunk
                // mid-stream would insert padding mid-string.
                loop {
                    match body.read(&mut buf[filled..]).await {
                        Ok(0) => break,
                        Ok(n) => {
                            filled += n;
                            if filled == buf.len() {
                                break;
                            }
                        }
                        Err(err) => return Some((Err(err), State::Done)),
                    }
                }
                if filled == 0 {
                    return Some((Ok(Bytes::from_static(b"\"")), State::Done));
                }
                let encoded = BASE64.encode(&buf[..filled]);
                if filled < buf.len() {
                    // Body exhausted; append the closing quote right away.
                    let mut tail = encoded.into_bytes();
                    tail.push(b'"');
                    Some((Ok(Bytes::from(tail)), State::Done))
                } else {
                    Some((Ok(Bytes::from(encoded)), State::Body(body)))
                }
            }
            State::Done => None,
        }
    })
}
