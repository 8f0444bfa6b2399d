//! The daemon's HTTP server.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::TryStreamExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use strata_proto::b64::StreamDecoder;
use strata_proto::pipe;
use strata_store::{CacheBackend, GetOpts, PutOpts};
use strata_types::metrics::{CounterExt, Metrics};
use strata_types::records::{
    GetRequest, PingResponse, PutRequest, PutResponse, ShutdownResponse, StatsClearResponse,
};

use crate::error::ApiError;

/// Longest accepted `put` request line (the JSON record, not the body).
const MAX_PUT_HEADER: u64 = 1 << 20;

#[derive(Clone)]
struct AppState {
    backend: Arc<dyn CacheBackend>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    config: serde_json::Value,
}

/// The daemon's HTTP face, serving one [`CacheBackend`] on loopback.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        metrics: Arc<Metrics>,
        config: serde_json::Value,
    ) -> Server {
        Server {
            state: AppState {
                backend,
                metrics,
                shutdown: CancellationToken::new(),
                config,
            },
        }
    }

    /// Cancelled when a shutdown request arrives; the embedding process
    /// closes the backend once [`serve`](Self::serve) returns.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ping", get(handle_ping))
            .route("/shutdown", post(handle_shutdown))
            .route("/stats/clear", post(handle_stats_clear))
            .route("/cacheprog/get", post(handle_get))
            .route("/cacheprog/put", post(handle_put))
            .with_state(self.state.clone())
    }

    /// Serve until the shutdown token fires; in-flight requests finish.
    pub async fn serve(self, listener: tokio::net::TcpListener) -> io::Result<()> {
        let shutdown = self.state.shutdown.clone();
        info!(addr = ?listener.local_addr(), "daemon listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    }
}

// GET /ping
async fn handle_ping(State(state): State<AppState>) -> Json<PingResponse> {
    debug!("/ping");
    Json(PingResponse {
        status: "ok".into(),
        pid: std::process::id(),
        config: state.config.clone(),
    })
}

// POST /shutdown — answer first, stop accepting right after.
async fn handle_shutdown(State(state): State<AppState>) -> Json<ShutdownResponse> {
    info!("/shutdown");
    state.shutdown.cancel();
    Json(ShutdownResponse {})
}

// POST /stats/clear
async fn handle_stats_clear(State(state): State<AppState>) -> Json<StatsClearResponse> {
    info!("/stats/clear");
    state.metrics.clear();
    Json(StatsClearResponse {})
}

// POST /cacheprog/get
async fn handle_get(
    State(state): State<AppState>,
    Json(req): Json<GetRequest>,
) -> Result<Json<strata_types::records::GetResponse>, ApiError> {
    state.metrics.get_total.inc();
    match state.backend.get(GetOpts::new(req)).await {
        Ok(resp) => {
            if resp.miss {
                state.metrics.get_miss.inc();
            } else {
                state.metrics.get_hit.inc();
            }
            Ok(Json(resp))
        }
        Err(err) => {
            state.metrics.get_error.inc();
            Err(ApiError::internal(err))
        }
    }
}

// POST /cacheprog/put — `<json>\n"<base64>"`; the body is decoded while
// the store consumes it.
async fn handle_put(
    State(state): State<AppState>,
    body: Body,
) -> Result<Json<PutResponse>, ApiError> {
    state.metrics.put_total.inc();

    let stream = body.into_data_stream().map_err(io::Error::other);
    let mut reader = StreamReader::new(stream);

    let mut header = Vec::new();
    (&mut reader)
        .take(MAX_PUT_HEADER)
        .read_until(b'\n', &mut header)
        .await
        .map_err(|err| ApiError::bad_request(format!("failed to read put request: {err}")))?;
    let req: PutRequest = serde_json::from_slice(&header)
        .map_err(|err| ApiError::bad_request(format!("failed to parse put request: {err}")))?;

    let result = if req.body_size == 0 {
        // An absent body is fine for a zero-size entry.
        state
            .backend
            .put(PutOpts::new(req, Box::new(io::Cursor::new(Bytes::new()))))
            .await
    } else {
        let (pipe_writer, pipe_reader) = pipe(32);
        let put = state.backend.put(PutOpts::new(req, Box::new(pipe_reader)));
        let decode = decode_quoted_body(&mut reader, pipe_writer);
        let (put_result, decode_result) = tokio::join!(put, decode);
        if let Err(err) = decode_result
            && put_result.is_ok()
        {
            state.metrics.put_error.inc();
            return Err(ApiError::bad_request(err.to_string()));
        }
        put_result
    };

    match result {
        Ok(resp) => {
            debug!(disk_path = %resp.disk_path, "/cacheprog/put");
            Ok(Json(resp))
        }
        Err(err) => {
            state.metrics.put_error.inc();
            Err(ApiError::internal(err))
        }
    }
}

/// Consume `"<base64>"` from the reader into the pipe. The leading quote
/// opens the body; the first unescaped quote ends it.
async fn decode_quoted_body<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    writer: strata_proto::PipeWriter,
) -> Result<(), ApiError> {
    let fail = |writer: strata_proto::PipeWriter, message: String| async move {
        writer
            .close_with_error(io::Error::new(io::ErrorKind::InvalidData, message.clone()))
            .await;
        Err(ApiError::bad_request(message))
    };

    let mut first = [0u8; 1];
    if let Err(err) = reader.read_exact(&mut first).await {
        return fail(writer, format!("failed to read put body: {err}")).await;
    }
    if first[0] != b'"' {
        return fail(writer, format!("unexpected put body first byte: 0x{:02x}", first[0])).await;
    }

    let mut writer = Some(writer);
    let mut decoder = StreamDecoder::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                if let Some(writer) = writer.take() {
                    return fail(writer, format!("failed to read put body: {err}")).await;
                }
                return Err(ApiError::bad_request(format!("failed to read put body: {err}")));
            }
        };
        if n == 0 {
            let message = "put body ended without a closing quote".to_string();
            if let Some(writer) = writer.take() {
                return fail(writer, message).await;
            }
            return Err(ApiError::bad_request(message));
        }

        let data = &buf[..n];
        let (encoded, done) = match data.iter().position(|&b| b == b'"') {
            Some(pos) => (&data[..pos], true),
            None => (data, false),
        };

        let decoded = match decoder.feed(encoded) {
            Ok(decoded) => decoded,
            Err(err) => {
                let message = format!("invalid base64 in put body: {err}");
                if let Some(writer) = writer.take() {
                    return fail(writer, message).await;
                }
                return Err(ApiError::bad_request(message));
            }
        };
        send_chunk(&mut writer, decoded).await;

        if done {
            let tail = match std::mem::take(&mut decoder).finish() {
                Ok(tail) => tail,
                Err(err) => {
                    let message = format!("invalid base64 in put body: {err}");
                    if let Some(writer) = writer.take() {
                        return fail(writer, message).await;
                    }
                    return Err(ApiError::bad_request(message));
                }
            };
            send_chunk(&mut writer, tail).await;
            drop(writer);
            return Ok(());
        }
    }
}

async fn send_chunk(writer: &mut Option<strata_proto::PipeWriter>, data: Vec<u8>) {
    if data.is_empty() {
        return;
    }
    if let Some(active) = writer
        && active.write(Bytes::from(data)).await.is_err()
    {
        // The store bailed; keep draining the request body.
        *writer = None;
    }
}
