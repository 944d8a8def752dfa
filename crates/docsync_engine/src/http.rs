//! HTTP transport implementation over `reqwest`.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{PullBatch, SyncTransport};
use async_trait::async_trait;
use docsync_protocol::{
    BootstrapResponse, CompactResponse, CursorRepresentation, ErrorResponse, NewChange,
    PullQuery, PullResponse, Snapshot, SubmitResponse,
};
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

/// HTTP-based sync transport.
///
/// Uses JSON bodies. Pull responses are decoded record by record so that a
/// malformed entry does not fail the whole page.
pub struct HttpTransport {
    /// Base URL of the sync server (e.g., "https://sync.example.com").
    base_url: String,
    client: Client,
    last_error: RwLock<Option<String>>,
}

impl HttpTransport {
    /// Creates a transport for `config.server_url` with the configured
    /// request timeout.
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SyncError::transport_fatal(format!("building http client: {e}")))?;
        Ok(Self::with_client(config.server_url.clone(), client))
    }

    /// Creates a transport using an existing client.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self {
            base_url,
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the message of the last failed request.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> SyncResult<Response> {
        let result = match request.send().await {
            Ok(response) => check_status(response).await,
            Err(e) => Err(map_reqwest_error(e)),
        };
        match &result {
            Ok(_) => *self.last_error.write() = None,
            Err(e) => *self.last_error.write() = Some(e.to_string()),
        }
        result
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> SyncResult<T> {
        let response = self.send(request).await?;
        response.json::<T>().await.map_err(map_reqwest_error)
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn bootstrap(&self) -> SyncResult<Option<Snapshot>> {
        let response: BootstrapResponse = self
            .send_json(self.client.get(self.url("/bootstrap")))
            .await?;
        Ok(response.snapshot)
    }

    async fn submit(&self, change: &NewChange) -> SyncResult<SubmitResponse> {
        self.send_json(self.client.post(self.url("/changes")).json(change))
            .await
    }

    async fn pull(&self, cursor: &CursorRepresentation, limit: usize) -> SyncResult<PullBatch> {
        let query = PullQuery::new(cursor, limit);
        let body: serde_json::Value = self
            .send_json(self.client.get(self.url("/changes")).query(&query))
            .await?;
        let (response, malformed) = PullResponse::decode_lenient(body)?;
        Ok(PullBatch {
            response,
            malformed,
        })
    }

    async fn compact(&self) -> SyncResult<CompactResponse> {
        self.send_json(self.client.post(self.url("/compact"))).await
    }
}

async fn check_status(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|body| body.error)
        .unwrap_or(text);
    Err(SyncError::Server {
        status: status.as_u16(),
        message,
    })
}

fn map_reqwest_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout
    } else if e.is_decode() {
        SyncError::Protocol(e.to_string())
    } else if e.is_builder() {
        SyncError::transport_fatal(e.to_string())
    } else {
        SyncError::transport_retryable(e.to_string())
    }
}
