//! HTTP client for the daemon, used by adapter processes and the CLI.

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use serde::de::DeserializeOwned;
use tokio::io::AsyncRead;

use strata_proto::b64::encode_quoted_stream;
use strata_types::records::{
    ErrorResponse, GetRequest, GetResponse, PingResponse, PutRequest, PutResponse,
    ShutdownResponse, StatsClearResponse,
};

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub daemon_port: u16,
}

/// Talks to a daemon on loopback.
pub struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    pub fn new(config: ClientConfig) -> anyhow::Result<Client> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Client {
            http,
            base: format!("http://127.0.0.1:{}", config.daemon_port),
        })
    }

    pub async fn ping(&self) -> anyhow::Result<PingResponse> {
        let resp = self.http.get(format!("{}/ping", self.base)).send().await?;
        expect_json(resp).await
    }

    pub async fn shutdown(&self) -> anyhow::Result<ShutdownResponse> {
        let resp = self
            .http
            .post(format!("{}/shutdown", self.base))
            .send()
            .await?;
        expect_json(resp).await
    }

    pub async fn stats_clear(&self) -> anyhow::Result<StatsClearResponse> {
        let resp = self
            .http
            .post(format!("{}/stats/clear", self.base))
            .send()
            .await?;
        expect_json(resp).await
    }

    pub async fn call_get(&self, req: GetRequest) -> anyhow::Result<GetResponse> {
        let resp = self
            .http
            .post(format!("{}/cacheprog/get", self.base))
            .json(&req)
            .send()
            .await?;
        expect_json(resp).await
    }

    /// Send a put as `<json>\n"<base64>"`, streaming the body through the
    /// encoder rather than buffering it.
    pub async fn call_put<R>(&self, req: PutRequest, body: R) -> anyhow::Result<PutResponse>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut header = serde_json::to_vec(&req)?;
        header.push(b'\n');
        let head = stream::iter([Ok(Bytes::from(header))]);
        let wire: reqwest::Body = if req.body_size > 0 {
            reqwest::Body::wrap_stream(head.chain(encode_quoted_stream(body)))
        } else {
            reqwest::Body::wrap_stream(head.boxed())
        };

        let resp = self
            .http
            .post(format!("{}/cacheprog/put", self.base))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(wire)
            .send()
            .await?;
        expect_json(resp).await
    }
}

async fn expect_json<T: DeserializeOwned>(resp: reqwest::Response) -> anyhow::Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let err: ErrorResponse = resp.json().await.unwrap_or_default();
    anyhow::bail!("daemon request failed ({status}): {}", err.error)
}
