//! The request/response engine.
//!
//! One reader task consumes request records; `get` and `put` handlers run
//! on background tasks, so responses may complete out of order, each
//! carrying its request id. Put bodies stream through a bounded pipe from
//! the read loop into the handler. Protocol-level failures terminate the
//! engine; handler failures become per-record `Err` responses.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::debug;

use strata_types::records::{Cmd, GetRequest, ProgRequest, ProgResponse, PutRequest};

use crate::b64::StreamDecoder;
use crate::error::ProtoError;
use crate::line::LineReader;
use crate::pipe::{PipeReader, PipeWriter, pipe};

/// Chunks buffered between the read loop and a put handler.
const PIPE_CAPACITY: usize = 32;

/// The seam between the engine and whatever serves the cache: an
/// in-process backend, or a client talking to the daemon.
#[async_trait::async_trait]
pub trait CacheHandler: Send + Sync {
    async fn get(&self, req: GetRequest) -> anyhow::Result<strata_types::records::GetResponse>;

    /// `body` delivers exactly `req.body_size` decoded bytes unless the
    /// upstream fails, in which case the read errors.
    async fn put(
        &self,
        req: PutRequest,
        body: PipeReader,
    ) -> anyhow::Result<strata_types::records::PutResponse>;
}

struct ResponseWriter<W> {
    out: Mutex<W>,
    /// First sink failure; the read loop checks this and terminates.
    failed: OnceLock<std::io::Error>,
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    async fn write(&self, resp: ProgResponse) {
        let mut line = match serde_json::to_vec(&resp) {
            Ok(line) => line,
            Err(err) => {
                // Not expressible as JSON; report that per-record instead.
                serde_json::to_vec(&ProgResponse::from_err(
                    resp.id,
                    format!("failed to encode response: {err}"),
                ))
                .expect("error response serializes")
            }
        };
        line.push(b'\n');
        let mut out = self.out.lock().await;
        if let Err(err) = out.write_all(&line).await {
            let _ = self.failed.set(err);
        } else {
            let _ = out.flush().await.map_err(|err| {
                let _ = self.failed.set(err);
            });
        }
    }
}

/// The cache-program engine: runs the protocol over one input/output pair
/// until a `close` record, end of input, or a protocol error.
pub struct CacheProg<H> {
    handler: Arc<H>,
}

impl<H: CacheHandler + 'static> CacheProg<H> {
    pub fn new(handler: Arc<H>) -> CacheProg<H> {
        CacheProg { handler }
    }

    pub async fn run<R, W>(self, input: R, output: W) -> Result<(), ProtoError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer = Arc::new(ResponseWriter {
            out: Mutex::new(output),
            failed: OnceLock::new(),
        });

        // Capability announcement before any request is read. Id zero is
        // reserved for it.
        writer
            .write(ProgResponse {
                id: 0,
                known_commands: vec![Cmd::Put, Cmd::Get, Cmd::Close],
                ..ProgResponse::default()
            })
            .await;

        let mut reader = LineReader::new(input);
        let mut handlers: JoinSet<()> = JoinSet::new();

        let result = loop {
            if let Some(err) = writer.failed.get() {
                break Err(ProtoError::WriteSink(std::io::Error::new(
                    err.kind(),
                    err.to_string(),
                )));
            }

            let chunk = match reader.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break Ok(()),
                Err(err) => break Err(ProtoError::Io(err)),
            };
            if !chunk.is_last {
                break Err(ProtoError::OversizedHeader);
            }
            let req: ProgRequest = match serde_json::from_slice(&chunk.data) {
                Ok(req) => req,
                Err(err) => break Err(ProtoError::Decode(err)),
            };
            debug!(id = req.id, command = ?req.command, "request");

            match req.command {
                Cmd::Close => break Ok(()),
                Cmd::Get => {
                    let handler = Arc::clone(&self.handler);
                    let writer = Arc::clone(&writer);
                    handlers.spawn(async move {
                        let resp = match handler.get(GetRequest {
                            action_id: req.action_id,
                        })
                        .await
                        {
                            Ok(resp) => ProgResponse::from_get(req.id, resp),
                            Err(err) => ProgResponse::from_err(req.id, err),
                        };
                        writer.write(resp).await;
                    });
                }
                Cmd::Put => {
                    let (pipe_writer, pipe_reader) = pipe(PIPE_CAPACITY);
                    let handler = Arc::clone(&self.handler);
                    let writer = Arc::clone(&writer);
                    let put_req = PutRequest {
                        action_id: req.action_id.clone(),
                        output_id: req.output_id.clone(),
                        body_size: req.body_size,
                    };
                    handlers.spawn(async move {
                        let resp = match handler.put(put_req, pipe_reader).await {
                            Ok(resp) => ProgResponse::from_put(req.id, resp),
                            Err(err) => ProgResponse::from_err(req.id, err),
                        };
                        writer.write(resp).await;
                    });

                    if req.body_size == 0 {
                        drop(pipe_writer);
                    } else if let Err(err) = stream_body(&mut reader, pipe_writer).await {
                        break Err(err);
                    }
                }
                Cmd::Unknown => {
                    let writer = Arc::clone(&writer);
                    handlers.spawn(async move {
                        writer
                            .write(ProgResponse::from_err(req.id, "unknown command"))
                            .await;
                    });
                }
            }
        };

        // A close (or a failure) stops reads; outstanding handlers still
        // get to answer.
        while handlers.join_next().await.is_some() {}
        result
    }
}

/// Stream one quoted-base64 body line into the pipe, decoding on the fly.
///
/// Pipe write failures are ignored here — the handler already failed and
/// will answer with its own error — but the body is still consumed so the
/// stream stays in sync. Framing violations terminate the engine; the pipe
/// is closed with an error so the handler does not mistake them for a
/// clean end of body.
async fn stream_body<R: AsyncRead + Unpin>(
    reader: &mut LineReader<R>,
    pipe_writer: PipeWriter,
) -> Result<(), ProtoError> {
    let mut decoder = StreamDecoder::new();
    let mut at_start = true;
    let mut closed = false;
    let mut pipe_writer = Some(pipe_writer);

    let failed = |pipe_writer: Option<PipeWriter>, err: ProtoError| async move {
        if let Some(writer) = pipe_writer {
            writer
                .close_with_error(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "request stream failed mid-body",
                ))
                .await;
        }
        Err(err)
    };

    loop {
        let chunk = match reader.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                return failed(
                    pipe_writer,
                    ProtoError::BadBody("input ended before the body".into()),
                )
                .await;
            }
            Err(err) => return failed(pipe_writer, ProtoError::Io(err)).await,
        };

        let mut data = chunk.data.as_ref();
        if at_start {
            match data.first() {
                Some(b'"') => data = &data[1..],
                Some(other) => {
                    return failed(
                        pipe_writer,
                        ProtoError::BadBody(format!("body must open with a quote, got 0x{other:02x}")),
                    )
                    .await;
                }
                // An empty continuation chunk; keep waiting for content.
                None => {}
            }
            if data.is_empty() && chunk.data.is_empty() {
                if chunk.is_last {
                    return failed(pipe_writer, ProtoError::BadBody("body line is empty".into()))
                        .await;
                }
                continue;
            }
            at_start = false;
        }

        if !closed {
            let encoded = match data.iter().position(|&b| b == b'"') {
                Some(pos) => {
                    closed = true;
                    &data[..pos]
                }
                None => data,
            };
            let decoded = match decoder.feed(encoded) {
                Ok(decoded) => decoded,
                Err(err) => {
                    return failed(pipe_writer, ProtoError::BadBody(err.to_string())).await;
                }
            };
            write_to_pipe(&mut pipe_writer, decoded).await;
            if closed {
                let tail = match std::mem::take(&mut decoder).finish() {
                    Ok(tail) => tail,
                    Err(err) => {
                        return failed(pipe_writer, ProtoError::BadBody(err.to_string())).await;
                    }
                };
                write_to_pipe(&mut pipe_writer, tail).await;
            }
        }

        if chunk.is_last {
            if !closed {
                return failed(
                    pipe_writer,
                    ProtoError::BadBody("body line ended without a closing quote".into()),
                )
                .await;
            }
            drop(pipe_writer);
            return Ok(());
        }
    }
}

async fn write_to_pipe(pipe_writer: &mut Option<PipeWriter>, data: Vec<u8>) {
    if data.is_empty() {
        return;
    }
    if let Some(writer) = pipe_writer
        && writer.write(Bytes::from(data)).await.is_err()
    {
        // Handler bailed early; keep consuming the body without a sink.
        *pipe_writer = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use strata_types::records::{GetResponse, PutResponse};
    use strata_types::{ActionId, OutputId};

    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        gets: StdMutex<Vec<GetRequest>>,
        puts: StdMutex<Vec<(PutRequest, Vec<u8>)>>,
        fail_puts: bool,
    }

    #[async_trait::async_trait]
    impl CacheHandler for RecordingHandler {
        async fn get(&self, req: GetRequest) -> anyhow::Result<GetResponse> {
            self.gets.lock().unwrap().push(req);
            Ok(GetResponse::miss())
        }

        async fn put(&self, req: PutRequest, mut body: PipeReader) -> anyhow::Result<PutResponse> {
            let mut buf = Vec::new();
            body.read_to_end(&mut buf).await?;
            if self.fail_puts {
                anyhow::bail!("disk full");
            }
            self.puts.lock().unwrap().push((req, buf));
            Ok(PutResponse {
                disk_path: "/cache/entry".into(),
            })
        }
    }

    async fn run_engine(
        input: Vec<u8>,
        handler: Arc<RecordingHandler>,
    ) -> (Result<(), ProtoError>, Vec<serde_json::Value>) {
        let (mut client, server) = duplex(1 << 20);
        let (server_read, server_write) = tokio::io::split(server);
        let engine = tokio::spawn(CacheProg::new(handler).run(server_read, server_write));

        client.write_all(&input).await.unwrap();
        client.shutdown().await.unwrap();
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        let result = engine.await.unwrap();

        let responses = raw
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).unwrap())
            .collect();
        (result, responses)
    }

    fn put_line(id: u64, action: &[u8], output: &[u8], body_size: i64) -> String {
        let mut line = serde_json::to_string(&ProgRequest {
            id,
            command: Cmd::Put,
            action_id: ActionId::from(action),
            output_id: OutputId::from(output),
            body_size,
        })
        .unwrap();
        line.push('\n');
        line
    }

    fn get_line(id: u64, action: &[u8]) -> String {
        let mut line = serde_json::to_string(&ProgRequest {
            id,
            command: Cmd::Get,
            action_id: ActionId::from(action),
            ..ProgRequest::default()
        })
        .unwrap();
        line.push('\n');
        line
    }

    const CLOSE: &str = "{\"ID\":99,\"Command\":\"close\"}\n";

    fn find_response(responses: &[serde_json::Value], id: u64) -> &serde_json::Value {
        responses
            .iter()
            .find(|resp| resp["ID"] == id)
            .unwrap_or_else(|| panic!("no response with id {id}"))
    }

    #[tokio::test]
    async fn test_capability_announced_first() {
        let handler = Arc::new(RecordingHandler::default());
        let (result, responses) = run_engine(CLOSE.into(), handler).await;
        result.unwrap();

        assert_eq!(responses[0]["ID"], 0);
        assert_eq!(
            responses[0]["KnownCommands"],
            serde_json::json!(["put", "get", "close"])
        );
    }

    #[tokio::test]
    async fn test_put_with_base64_body() {
        let handler = Arc::new(RecordingHandler::default());
        let mut input = put_line(1, &[0xab], &[0xcd], 9);
        input.push_str("\"dGVzdC1ib2R5\"\n");
        input.push_str(CLOSE);

        let (result, responses) = run_engine(input.into(), Arc::clone(&handler)).await;
        result.unwrap();

        let puts = handler.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0.body_size, 9);
        assert_eq!(puts[0].1, b"test-body");

        let resp = find_response(&responses, 1);
        assert_eq!(resp["DiskPath"], "/cache/entry");
        assert!(resp.get("Err").is_none());
    }

    #[tokio::test]
    async fn test_put_with_zero_body() {
        let handler = Arc::new(RecordingHandler::default());
        let mut input = put_line(3, &[0x01], &[0x02], 0);
        input.push_str(CLOSE);

        let (result, responses) = run_engine(input.into(), Arc::clone(&handler)).await;
        result.unwrap();

        let puts = handler.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert!(puts[0].1.is_empty());
        find_response(&responses, 3);
    }

    #[tokio::test]
    async fn test_get_miss() {
        let handler = Arc::new(RecordingHandler::default());
        let mut input = get_line(2, &[0x0f, 0x0e]);
        input.push_str(CLOSE);

        let (result, responses) = run_engine(input.into(), Arc::clone(&handler)).await;
        result.unwrap();

        let resp = find_response(&responses, 2);
        assert_eq!(resp["Miss"], true);
        let gets = handler.gets.lock().unwrap();
        assert_eq!(gets[0].action_id, ActionId::from(&[0x0f, 0x0e][..]));
    }

    #[tokio::test]
    async fn test_unknown_command_gets_err_response() {
        let handler = Arc::new(RecordingHandler::default());
        let mut input = String::from("{\"ID\":5,\"Command\":\"frobnicate\"}\n");
        input.push_str(&get_line(6, &[0x01]));
        input.push_str(CLOSE);

        let (result, responses) = run_engine(input.into(), handler).await;
        result.unwrap();

        let resp = find_response(&responses, 5);
        assert!(
            resp["Err"].as_str().unwrap().contains("unknown command"),
            "got: {resp}"
        );
        // The engine keeps serving after an unknown command.
        find_response(&responses, 6);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_err_response() {
        let handler = Arc::new(RecordingHandler {
            fail_puts: true,
            ..RecordingHandler::default()
        });
        let mut input = put_line(7, &[0xaa], &[0xbb], 3);
        input.push_str("\"YWJj\"\n");
        input.push_str(&get_line(8, &[0x01]));
        input.push_str(CLOSE);

        let (result, responses) = run_engine(input.into(), handler).await;
        result.unwrap();

        let resp = find_response(&responses, 7);
        assert!(resp["Err"].as_str().unwrap().contains("disk full"));
        // The body was consumed and the next record still parsed.
        find_response(&responses, 8);
    }

    #[tokio::test]
    async fn test_large_body_streams_through() {
        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let encoded = {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD.encode(&body)
        };

        let handler = Arc::new(RecordingHandler::default());
        let mut input = put_line(9, &[0x42], &[0x43], body.len() as i64);
        input.push('"');
        input.push_str(&encoded);
        input.push_str("\"\n");
        input.push_str(CLOSE);

        let (result, _) = run_engine(input.into(), Arc::clone(&handler)).await;
        result.unwrap();

        let puts = handler.puts.lock().unwrap();
        assert_eq!(puts[0].1, body, "a multi-chunk body arrives intact");
    }

    #[tokio::test]
    async fn test_empty_lines_between_records_ignored() {
        let handler = Arc::new(RecordingHandler::default());
        let mut input = String::from("\n\n");
        input.push_str(&get_line(4, &[0x09]));
        input.push('\n');
        input.push_str(CLOSE);

        let (result, responses) = run_engine(input.into(), handler).await;
        result.unwrap();
        find_response(&responses, 4);
    }

    #[tokio::test]
    async fn test_oversized_header_terminates_engine() {
        let handler = Arc::new(RecordingHandler::default());
        let mut input = vec![b'a'; 5000];
        input.push(b'\n');

        let (result, _) = run_engine(input, handler).await;
        assert!(matches!(result, Err(ProtoError::OversizedHeader)));
    }

    #[tokio::test]
    async fn test_malformed_record_terminates_engine() {
        let handler = Arc::new(RecordingHandler::default());
        let (result, _) = run_engine(b"not json\n".to_vec(), handler).await;
        assert!(matches!(result, Err(ProtoError::Decode(_))));
    }

    #[tokio::test]
    async fn test_body_without_closing_quote_terminates_engine() {
        let handler = Arc::new(RecordingHandler::default());
        let mut input = put_line(1, &[0x01], &[0x02], 3);
        input.push_str("\"YWJj\n");
        input.push_str(CLOSE);

        let (result, _) = run_engine(input.into(), handler).await;
        assert!(matches!(result, Err(ProtoError::BadBody(_))));
    }

    #[tokio::test]
    async fn test_end_of_input_without_close_is_clean() {
        let handler = Arc::new(RecordingHandler::default());
        let (result, responses) = run_engine(get_line(1, &[0x01]).into(), handler).await;
        result.unwrap();
        find_response(&responses, 1);
    }
}
