//! Adapter ↔ daemon round trips over a real loopback socket.

use std::io::Cursor;
use std::sync::Arc;

use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
use tokio::task::JoinHandle;

use strata_daemon::{Client, ClientConfig, DaemonHandler, Server};
use strata_store::LocalStore;
use strata_types::metrics::{CounterExt, Metrics};
use strata_types::records::{GetRequest, PutRequest};
use strata_types::{ActionId, OutputId};

struct Daemon {
    client: Client,
    metrics: Arc<Metrics>,
    server: JoinHandle<std::io::Result<()>>,
    _work_dir: tempfile::TempDir,
}

async fn start_daemon() -> Daemon {
    let work_dir = tempfile::TempDir::new().unwrap();
    let store = LocalStore::open(work_dir.path()).await.unwrap();
    let metrics = Arc::new(Metrics::new());
    let server = Server::new(
        Arc::new(store),
        Arc::clone(&metrics),
        serde_json::json!({ "work_dir": work_dir.path() }),
    );

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(server.serve(listener));

    let client = Client::new(ClientConfig { daemon_port: port }).unwrap();
    Daemon {
        client,
        metrics,
        server,
        _work_dir: work_dir,
    }
}

fn put_req(action: &[u8], output: &[u8], body_size: i64) -> PutRequest {
    PutRequest {
        action_id: ActionId::from(action),
        output_id: OutputId::from(output),
        body_size,
    }
}

fn get_req(action: &[u8]) -> GetRequest {
    GetRequest {
        action_id: ActionId::from(action),
    }
}

#[tokio::test]
async fn test_ping() {
    let daemon = start_daemon().await;
    let pong = daemon.client.ping().await.unwrap();
    assert_eq!(pong.status, "ok");
    assert_eq!(pong.pid, std::process::id());
}

#[tokio::test]
async fn test_put_then_get() {
    let daemon = start_daemon().await;

    let put = daemon
        .client
        .call_put(
            put_req(&[0xaa, 0x01], &[0xbb, 0x01], 5),
            Cursor::new(&b"hello"[..]),
        )
        .await
        .unwrap();
    assert_eq!(std::fs::read(&put.disk_path).unwrap(), b"hello");

    let got = daemon.client.call_get(get_req(&[0xaa, 0x01])).await.unwrap();
    assert!(!got.miss);
    assert_eq!(got.size, 5);
    assert_eq!(got.output_id, OutputId::from(&[0xbb, 0x01][..]));
    assert_eq!(std::fs::read(&got.disk_path).unwrap(), b"hello");
    assert_eq!(daemon.metrics.get_hit.get(), 1);
}

#[tokio::test]
async fn test_get_miss() {
    let daemon = start_daemon().await;
    let got = daemon.client.call_get(get_req(&[0x42])).await.unwrap();
    assert!(got.miss);
    assert_eq!(daemon.metrics.get_miss.get(), 1);
}

#[tokio::test]
async fn test_zero_body_put() {
    let daemon = start_daemon().await;

    let put = daemon
        .client
        .call_put(put_req(&[0x11], &[0x12], 0), Cursor::new(&b""[..]))
        .await
        .unwrap();
    assert!(put.disk_path.ends_with("_empty.output"));

    let got = daemon.client.call_get(get_req(&[0x11])).await.unwrap();
    assert!(!got.miss);
    assert_eq!(got.size, 0);
    assert_eq!(std::fs::metadata(&got.disk_path).unwrap().len(), 0);
}

#[tokio::test]
async fn test_size_mismatch_is_an_error() {
    let daemon = start_daemon().await;

    let err = daemon
        .client
        .call_put(put_req(&[0x21], &[0x22], 10), Cursor::new(&b"short"[..]))
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("size mismatch"),
        "unexpected error: {err}"
    );
    assert_eq!(daemon.metrics.put_error.get(), 1);

    let got = daemon.client.call_get(get_req(&[0x21])).await.unwrap();
    assert!(got.miss, "a failed put leaves no entry behind");
}

#[tokio::test]
async fn test_stats_clear() {
    let daemon = start_daemon().await;
    daemon.client.call_get(get_req(&[0x31])).await.unwrap();
    assert_eq!(daemon.metrics.get_total.get(), 1);

    daemon.client.stats_clear().await.unwrap();
    assert_eq!(daemon.metrics.get_total.get(), 0);
}

#[tokio::test]
async fn test_shutdown_stops_server() {
    let daemon = start_daemon().await;
    daemon.client.shutdown().await.unwrap();
    daemon.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_engine_through_daemon() {
    let daemon = start_daemon().await;
    let handler = Arc::new(DaemonHandler::new(daemon.client));

    let (mut toolchain, adapter) = duplex(1 << 20);
    let (adapter_read, adapter_write) = tokio::io::split(adapter);
    let engine = tokio::spawn(
        strata_proto::CacheProg::new(handler).run(adapter_read, adapter_write),
    );

    // The toolchain side: put an entry, read it back, close.
    let action_b64 = base64::engine::general_purpose::STANDARD.encode([0xabu8, 0xcd]);
    let output_b64 = base64::engine::general_purpose::STANDARD.encode([0x10u8]);
    let body_b64 = base64::engine::general_purpose::STANDARD.encode(b"test-body");
    let input = format!(
        "{{\"ID\":1,\"Command\":\"put\",\"ActionID\":\"{action_b64}\",\"OutputID\":\"{output_b64}\",\"BodySize\":9}}\n\
         \"{body_b64}\"\n\
         {{\"ID\":2,\"Command\":\"get\",\"ActionID\":\"{action_b64}\"}}\n\
         {{\"ID\":3,\"Command\":\"close\"}}\n"
    );
    toolchain.write_all(input.as_bytes()).await.unwrap();
    toolchain.shutdown().await.unwrap();

    let mut raw = Vec::new();
    toolchain.read_to_end(&mut raw).await.unwrap();
    engine.await.unwrap().unwrap();

    let responses: Vec<serde_json::Value> = raw
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).unwrap())
        .collect();

    assert_eq!(responses[0]["ID"], 0, "capability line comes first");

    let put_resp = responses.iter().find(|r| r["ID"] == 1).unwrap();
    let disk_path = put_resp["DiskPath"].as_str().unwrap();
    assert_eq!(std::fs::read(disk_path).unwrap(), b"test-body");

    let get_resp = responses.iter().find(|r| r["ID"] == 2).unwrap();
    assert!(get_resp.get("Miss").is_none());
    assert_eq!(get_resp["Size"], 9);
    assert_eq!(get_resp["OutputID"], output_b64);
}
