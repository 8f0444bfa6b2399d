//! Opaque byte-string identifiers.
//!
//! The toolchain hands us an action fingerprint and an output content id as
//! raw byte strings (typically 32 bytes, but the cache never assumes a
//! length). On the JSON wire they travel base64-encoded, matching how the
//! toolchain marshals byte arrays; in logs and on disk they appear as
//! lowercase hex.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Bytes);

        impl $name {
            /// Wrap raw id bytes.
            pub fn new(bytes: impl Into<Bytes>) -> Self {
                Self(bytes.into())
            }

            /// Parse a lowercase hex string back into an id.
            pub fn from_hex(hex: &str) -> Option<Self> {
                Some(Self(Bytes::from(hex_to_bytes(hex)?)))
            }

            /// Raw id bytes.
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn len(&self) -> usize {
                self.0.len()
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            /// Lowercase hex rendering, same as `Display`.
            pub fn to_hex(&self) -> String {
                self.to_string()
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(bytes: Vec<u8>) -> Self {
                Self(Bytes::from(bytes))
            }
        }

        impl From<&[u8]> for $name {
            fn from(bytes: &[u8]) -> Self {
                Self(Bytes::copy_from_slice(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in self.0.iter() {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&BASE64.encode(&self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let encoded = String::deserialize(deserializer)?;
                let bytes = BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|e| D::Error::custom(format!("invalid base64 id: {e}")))?;
                Ok(Self(Bytes::from(bytes)))
            }
        }
    };
}

define_id!(
    /// Fingerprint of a build step's inputs; the primary cache key.
    ActionId
);

define_id!(
    /// Content id of the artifact a build step produced.
    OutputId
);

impl ActionId {
    /// The keyspace this action shards into: the high nibble of the first
    /// byte. An empty id maps to keyspace `0`; callers reject empty ids
    /// before any storage operation.
    pub fn keyspace(&self) -> Keyspace {
        Keyspace(self.0.first().copied().unwrap_or(0) >> 4)
    }
}

/// One of the 16 shard buckets `0..f`, derived from `ActionId[0]`'s high
/// nibble. Listings, bundles, and compaction jobs are partitioned by it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Keyspace(u8);

impl Keyspace {
    /// All 16 keyspaces, in order.
    pub const ALL: [Keyspace; 16] = {
        let mut all = [Keyspace(0); 16];
        let mut i = 0;
        while i < 16 {
            all[i] = Keyspace(i as u8);
            i += 1;
        }
        all
    };

    /// The lowercase hex digit naming this keyspace.
    pub fn as_char(&self) -> char {
        HEX_DIGITS[self.0 as usize] as char
    }

    pub fn from_char(c: char) -> Option<Keyspace> {
        c.to_digit(16).map(|d| Keyspace(d as u8))
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl fmt::Debug for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keyspace({})", self.as_char())
    }
}

/// Decode a lowercase/uppercase hex string of any even length.
pub(crate) fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let raw = hex.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len() / 2);
    for pair in raw.chunks_exact(2) {
        bytes.push((hex_nibble(pair[0])? << 4) | hex_nibble(pair[1])?);
    }
    Some(bytes)
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_display_roundtrip() {
        let id = ActionId::new(vec![0xab, 0xcd, 0x01]);
        assert_eq!(id.to_string(), "abcd01");
        assert_eq!(ActionId::from_hex("abcd01"), Some(id));
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert_eq!(ActionId::from_hex("abc"), None, "odd length");
        assert_eq!(ActionId::from_hex("zz"), None, "non-hex digit");
        assert_eq!(ActionId::from_hex(""), Some(ActionId::default()));
    }

    #[test]
    fn test_keyspace_is_high_nibble() {
        assert_eq!(ActionId::new(vec![0x00]).keyspace().as_char(), '0');
        assert_eq!(ActionId::new(vec![0x9f]).keyspace().as_char(), '9');
        assert_eq!(ActionId::new(vec![0xf0]).keyspace().as_char(), 'f');
        assert_eq!(ActionId::default().keyspace().as_char(), '0');
    }

    #[test]
    fn test_keyspace_all_covers_every_bucket() {
        let chars: String = Keyspace::ALL.iter().map(|k| k.as_char()).collect();
        assert_eq!(chars, "0123456789abcdef");
    }

    #[test]
    fn test_serde_is_base64() {
        let id = ActionId::new(vec![1, 2, 3, 4]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"AQIDBA==\"");
        let back: ActionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
