//! Binary entry-metadata codec.
//!
//! Every standalone remote object is `EntryMeta ‖ body`, every local
//! `.action` file is a bare `EntryMeta`, and every bundle entry embeds the
//! same header at the front of its payload. Layout (little-endian, fixed):
//!
//! ```text
//! u32 len(ActionID) | u32 len(OutputID) | ActionID | OutputID | i64 size | i64 time_nanos
//! ```

use std::io::{self, Read};

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{ActionId, OutputId};

/// Upper bound on either id length. Ids are hashes in practice; anything
/// beyond this is a corrupted or hostile header.
const MAX_ID_LEN: usize = 1 << 20;

/// Metadata describing one cache entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryMeta {
    pub action_id: ActionId,
    pub output_id: OutputId,
    /// Body size in bytes, `0..2^63`.
    pub size: i64,
    /// When the entry was put into the cache. Nanosecond resolution on the
    /// wire; `time_nanos == 0` round-trips to the epoch.
    pub time: DateTime<Utc>,
}

impl EntryMeta {
    /// Exact number of bytes [`encode`](Self::encode) produces.
    pub fn encoded_len(&self) -> usize {
        4 + 4 + self.action_id.len() + self.output_id.len() + 8 + 8
    }

    /// Serialize into the fixed binary layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(self.action_id.len() as u32);
        buf.put_u32_le(self.output_id.len() as u32);
        buf.put_slice(self.action_id.as_bytes());
        buf.put_slice(self.output_id.as_bytes());
        buf.put_i64_le(self.size);
        buf.put_i64_le(self.time.timestamp_nanos_opt().unwrap_or(0));
        buf.freeze()
    }

    /// Read one header from a blocking reader, consuming exactly
    /// [`encoded_len`](Self::encoded_len) bytes.
    pub fn read_from_sync<R: Read>(r: &mut R) -> io::Result<EntryMeta> {
        let mut len_hdr = [0u8; 8];
        r.read_exact(&mut len_hdr)?;
        let (len_a, len_o) = decode_len_header(&len_hdr)?;
        let mut rest = vec![0u8; len_a + len_o + 16];
        r.read_exact(&mut rest)?;
        Ok(decode_rest(&rest, len_a, len_o))
    }

    /// Read one header from an async reader, e.g. the head of a remote
    /// object stream.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<EntryMeta> {
        let mut len_hdr = [0u8; 8];
        r.read_exact(&mut len_hdr).await?;
        let (len_a, len_o) = decode_len_header(&len_hdr)?;
        let mut rest = vec![0u8; len_a + len_o + 16];
        r.read_exact(&mut rest).await?;
        Ok(decode_rest(&rest, len_a, len_o))
    }
}

fn decode_len_header(len_hdr: &[u8; 8]) -> io::Result<(usize, usize)> {
    let len_a = u32::from_le_bytes([len_hdr[0], len_hdr[1], len_hdr[2], len_hdr[3]]) as usize;
    let len_o = u32::from_le_bytes([len_hdr[4], len_hdr[5], len_hdr[6], len_hdr[7]]) as usize;
    if len_a > MAX_ID_LEN || len_o > MAX_ID_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unreasonable id lengths in entry metadata: {len_a}/{len_o}"),
        ));
    }
    Ok((len_a, len_o))
}

fn decode_rest(rest: &[u8], len_a: usize, len_o: usize) -> EntryMeta {
    let action_id = ActionId::from(&rest[..len_a]);
    let output_id = OutputId::from(&rest[len_a..len_a + len_o]);
    let tail = &rest[len_a + len_o..];
    let size = i64::from_le_bytes(tail[..8].try_into().expect("8-byte size field"));
    let nanos = i64::from_le_bytes(tail[8..16].try_into().expect("8-byte time field"));
    EntryMeta {
        action_id,
        output_id,
        size,
        time: Utc.timestamp_nanos(nanos),
    }
}
