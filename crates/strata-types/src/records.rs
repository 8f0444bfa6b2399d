//! JSON wire records.
//!
//! Two carriers share these shapes: the line-framed cache-program protocol
//! the toolchain speaks on the adapter's stdin/stdout, and the daemon's
//! loopback HTTP API. Field names and omit-when-empty behavior follow the
//! toolchain's conventions (PascalCase names, base64 byte strings).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ActionId, OutputId};

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Cache lookup request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetRequest {
    #[serde(rename = "ActionID", skip_serializing_if = "ActionId::is_empty")]
    pub action_id: ActionId,
}

/// Cache lookup response. `miss == true` carries no other fields.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetResponse {
    #[serde(rename = "Miss", skip_serializing_if = "is_false")]
    pub miss: bool,
    #[serde(rename = "OutputID", skip_serializing_if = "OutputId::is_empty")]
    pub output_id: OutputId,
    #[serde(rename = "Size", skip_serializing_if = "is_zero")]
    pub size: i64,
    #[serde(rename = "Time", skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Absolute path of the body on the daemon's disk.
    #[serde(rename = "DiskPath", skip_serializing_if = "String::is_empty")]
    pub disk_path: String,
}

impl GetResponse {
    /// The canonical miss response.
    pub fn miss() -> GetResponse {
        GetResponse {
            miss: true,
            ..GetResponse::default()
        }
    }
}

/// Cache store request; the body travels out of band.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PutRequest {
    #[serde(rename = "ActionID", skip_serializing_if = "ActionId::is_empty")]
    pub action_id: ActionId,
    #[serde(rename = "OutputID", skip_serializing_if = "OutputId::is_empty")]
    pub output_id: OutputId,
    /// Number of body bytes. Zero means the entry has no body.
    #[serde(rename = "BodySize", skip_serializing_if = "is_zero")]
    pub body_size: i64,
}

/// Cache store response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PutResponse {
    #[serde(rename = "DiskPath", skip_serializing_if = "String::is_empty")]
    pub disk_path: String,
}

/// Commands of the cache-program protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cmd {
    Get,
    Put,
    Close,
    /// Anything this build does not know; answered with a per-record error.
    #[serde(other, skip_serializing)]
    Unknown,
}

/// One request record on the cache-program stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgRequest {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "Command")]
    pub command: Cmd,
    #[serde(rename = "ActionID", skip_serializing_if = "ActionId::is_empty")]
    pub action_id: ActionId,
    #[serde(rename = "OutputID", skip_serializing_if = "OutputId::is_empty")]
    pub output_id: OutputId,
    #[serde(rename = "BodySize", skip_serializing_if = "is_zero")]
    pub body_size: i64,
}

impl Default for ProgRequest {
    fn default() -> Self {
        ProgRequest {
            id: 0,
            command: Cmd::Unknown,
            action_id: ActionId::default(),
            output_id: OutputId::default(),
            body_size: 0,
        }
    }
}

/// One response record on the cache-program stream. `id == 0` is reserved
/// for the capability announcement sent before any request is read.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgResponse {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "Err", skip_serializing_if = "String::is_empty")]
    pub err: String,
    #[serde(rename = "KnownCommands", skip_serializing_if = "Vec::is_empty")]
    pub known_commands: Vec<Cmd>,
    #[serde(rename = "Miss", skip_serializing_if = "is_false")]
    pub miss: bool,
    #[serde(rename = "OutputID", skip_serializing_if = "OutputId::is_empty")]
    pub output_id: OutputId,
    #[serde(rename = "Size", skip_serializing_if = "is_zero")]
    pub size: i64,
    #[serde(rename = "Time", skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(rename = "DiskPath", skip_serializing_if = "String::is_empty")]
    pub disk_path: String,
}

impl ProgResponse {
    /// Wrap a backend response for the given request id.
    pub fn from_get(id: u64, resp: GetResponse) -> ProgResponse {
        ProgResponse {
            id,
            miss: resp.miss,
            output_id: resp.output_id,
            size: resp.size,
            time: resp.time,
            disk_path: resp.disk_path,
            ..ProgResponse::default()
        }
    }

    pub fn from_put(id: u64, resp: PutResponse) -> ProgResponse {
        ProgResponse {
            id,
            disk_path: resp.disk_path,
            ..ProgResponse::default()
        }
    }

    pub fn from_err(id: u64, err: impl ToString) -> ProgResponse {
        ProgResponse {
            id,
            err: err.to_string(),
            ..ProgResponse::default()
        }
    }
}

/// `GET /ping` response from the daemon.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PingResponse {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Pid")]
    pub pid: u32,
    #[serde(rename = "Config")]
    pub config: serde_json::Value,
}

/// JSON error payload used by the daemon for every failed request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorResponse {
    #[serde(rename = "Error")]
    pub error: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ShutdownResponse {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatsClearResponse {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_response_is_minimal() {
        let json = serde_json::to_string(&GetResponse::miss()).unwrap();
        assert_eq!(json, r#"{"Miss":true}"#);
    }

    #[test]
    fn test_hit_response_omits_miss() {
        let resp = GetResponse {
            miss: false,
            output_id: OutputId::new(vec![0x10]),
            size: 3,
            time: None,
            disk_path: "/tmp/x".into(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"OutputID":"EA==","Size":3,"DiskPath":"/tmp/x"}"#);
    }

    #[test]
    fn test_prog_request_parses_toolchain_record() {
        let line = r#"{"ID":1,"Command":"put","ActionID":"q80=","OutputID":"EjQ=","BodySize":9}"#;
        let req: ProgRequest = serde_json::from_str(line).unwrap();
        assert_eq!(req.id, 1);
        assert_eq!(req.command, Cmd::Put);
        assert_eq!(req.action_id.as_bytes(), &[0xab, 0xcd]);
        assert_eq!(req.output_id.as_bytes(), &[0x12, 0x34]);
        assert_eq!(req.body_size, 9);
    }

    #[test]
    fn test_unknown_command_still_parses() {
        let line = r#"{"ID":7,"Command":"frobnicate"}"#;
        let req: ProgRequest = serde_json::from_str(line).unwrap();
        assert_eq!(req.command, Cmd::Unknown);
        assert_eq!(req.id, 7);
    }

    #[test]
    fn test_capability_announcement_shape() {
        let resp = ProgResponse {
            id: 0,
            known_commands: vec![Cmd::Put, Cmd::Get, Cmd::Close],
            ..ProgResponse::default()
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"ID":0,"KnownCommands":["put","get","close"]}"#);
    }

    #[test]
    fn test_time_roundtrips_through_json() {
        let time = chrono::TimeZone::timestamp_nanos(&Utc, 1_700_000_000_123_456_789);
        let resp = GetResponse {
            time: Some(time),
            size: 1,
            ..GetResponse::default()
        };
        let back: GetResponse = serde_json::from_str(&serde_json::to_string(&resp).unwrap()).unwrap();
        assert_eq!(back.time, Some(time));
    }
}
