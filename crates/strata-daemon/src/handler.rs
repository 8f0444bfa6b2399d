//! The adapter-side cache handler: forwards every engine request to the
//! daemon over HTTP.

use strata_proto::{CacheHandler, PipeReader};
use strata_types::records::{GetRequest, GetResponse, PutRequest, PutResponse};

use crate::client::Client;

pub struct DaemonHandler {
    client: Client,
}

impl DaemonHandler {
    pub fn new(client: Client) -> DaemonHandler {
        DaemonHandler { client }
    }
}

#[async_trait::async_trait]
impl CacheHandler for DaemonHandler {
    async fn get(&self, req: GetRequest) -> anyhow::Result<GetResponse> {
        self.client.call_get(req).await
    }

    async fn put(&self, req: PutRequest, body: PipeReader) -> anyhow::Result<PutResponse> {
        self.client.call_put(req, body).await
    }
}
