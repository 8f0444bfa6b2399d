//! Remote object-key scheme and local bundle paths.
//!
//! Standalone entries live at `b/XX/HEX` (XX = first id byte in hex, HEX =
//! full id in hex); the per-keyspace bundle for keyspace `k` lives at
//! `blobar/k.zip` both remotely and under the local work directory.

use std::path::{Path, PathBuf};

use crate::id::hex_to_bytes;
use crate::{ActionId, Keyspace};

/// Remote key of a standalone cache entry: `b/XX/HEX`.
pub fn entity_key(action_id: &ActionId) -> String {
    let first = action_id.as_bytes().first().copied().unwrap_or(0);
    format!("b/{first:02x}/{action_id}")
}

/// Parse a remote key back into an `ActionId`.
///
/// Strict: the decoded id must re-encode to exactly the input key, so stray
/// objects under the `b/` prefix are rejected rather than misread.
pub fn decode_entity_key(key: &str) -> Option<ActionId> {
    let hex = key.strip_prefix("b/")?.get(3..)?;
    let action_id = ActionId::new(hex_to_bytes(hex)?);
    if entity_key(&action_id) != key {
        return None;
    }
    Some(action_id)
}

/// Name of an entry inside a bundle: the full id in lowercase hex.
pub fn entity_name_in_archive(action_id: &ActionId) -> String {
    action_id.to_hex()
}

/// Remote key of the bundle for one keyspace: `blobar/k.zip`.
pub fn archive_key(keyspace: Keyspace) -> String {
    format!("blobar/{keyspace}.zip")
}

/// Listing prefix covering all standalone entries of one keyspace.
pub fn list_prefix(keyspace: Keyspace) -> String {
    format!("b/{keyspace}")
}

/// On-disk path of the local copy of a keyspace's bundle.
pub fn archive_file_path(work_dir: &Path, keyspace: Keyspace) -> PathBuf {
    work_dir.join("blobar").join(format!("{keyspace}.zip"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_layout() {
        let id = ActionId::new(vec![0xab, 0xcd, 0xef]);
        assert_eq!(entity_key(&id), "b/ab/abcdef");
    }

    #[test]
    fn test_decode_entity_key_roundtrip() {
        let id = ActionId::new(vec![0x0f, 0x33, 0x77]);
        assert_eq!(decode_entity_key(&entity_key(&id)), Some(id));
    }

    #[test]
    fn test_decode_entity_key_rejects_strays() {
        assert_eq!(decode_entity_key("b/ab"), None, "too short");
        assert_eq!(decode_entity_key("x/ab/abcd"), None, "wrong prefix");
        assert_eq!(decode_entity_key("b/ab/zzzz"), None, "bad hex");
        assert_eq!(
            decode_entity_key("b/ff/abcd"),
            None,
            "shard dir disagrees with id"
        );
        assert_eq!(decode_entity_key("b/ab/ABCD"), None, "uppercase hex");
    }

    #[test]
    fn test_archive_keys() {
        let k = Keyspace::from_char('a').unwrap();
        assert_eq!(archive_key(k), "blobar/a.zip");
        assert_eq!(list_prefix(k), "b/a");
        assert_eq!(
            archive_file_path(Path::new("/work"), k),
            PathBuf::from("/work/blobar/a.zip")
        );
    }
}
