//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use docsync_protocol::{
    BootstrapResponse, CompactResponse, CursorRepresentation, MalformedRecord, NewChange,
    PullQuery, PullResponse, Snapshot, SubmitResponse,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// One page returned by [`SyncTransport::pull`].
#[derive(Debug, Clone)]
pub struct PullBatch {
    /// Decoded response; `changes` holds only the records that decoded.
    pub response: PullResponse,
    /// Entries of the page that could not be decoded.
    pub malformed: Vec<MalformedRecord>,
}

/// A sync transport handles network communication with the sync server.
///
/// This trait abstracts the network layer so the engine can run against
/// HTTP or an in-process server.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Fetches the current snapshot, `None` if no compaction has run.
    async fn bootstrap(&self) -> SyncResult<Option<Snapshot>>;

    /// Submits one change. Resubmitting the same id is safe.
    async fn submit(&self, change: &NewChange) -> SyncResult<SubmitResponse>;

    /// Pulls one page of records after `cursor`.
    async fn pull(&self, cursor: &CursorRepresentation, limit: usize) -> SyncResult<PullBatch>;

    /// Asks the server to compact now.
    async fn compact(&self) -> SyncResult<CompactResponse>;
}

/// A request delivered to a [`LoopbackServer`].
#[derive(Debug, Clone)]
pub enum LoopbackRequest {
    /// `GET /bootstrap`.
    Bootstrap,
    /// `POST /changes`.
    Submit(NewChange),
    /// `GET /changes`.
    Pull(PullQuery),
    /// `POST /compact`.
    Compact,
}

/// Server side of an in-process transport.
///
/// Responses are JSON bodies so that they go through the same decoding as
/// the HTTP transport. Errors carry an HTTP-style status code.
pub trait LoopbackServer: Send + Sync {
    /// Handles one request.
    fn handle(&self, request: LoopbackRequest) -> Result<Value, (u16, String)>;
}

/// Transport calling a [`LoopbackServer`] directly, with a switch to
/// simulate going offline.
pub struct LoopbackTransport<S: LoopbackServer> {
    server: Arc<S>,
    online: AtomicBool,
    requests: AtomicU64,
}

impl<S: LoopbackServer> LoopbackTransport<S> {
    /// Creates a transport in the online state.
    pub fn new(server: Arc<S>) -> Self {
        Self {
            server,
            online: AtomicBool::new(true),
            requests: AtomicU64::new(0),
        }
    }

    /// Returns the server.
    pub fn server(&self) -> &Arc<S> {
        &self.server
    }

    /// Simulates connectivity; while offline every call fails with a
    /// retryable transport error.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Returns true if calls are currently delivered.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of requests delivered to the server.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    fn call(&self, request: LoopbackRequest) -> SyncResult<Value> {
        if !self.is_online() {
            return Err(SyncError::transport_retryable("loopback offline"));
        }
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.server
            .handle(request)
            .map_err(|(status, message)| SyncError::Server { status, message })
    }
}

#[async_trait]
impl<S: LoopbackServer + 'static> SyncTransport for LoopbackTransport<S> {
    async fn bootstrap(&self) -> SyncResult<Option<Snapshot>> {
        let body = self.call(LoopbackRequest::Bootstrap)?;
        let response: BootstrapResponse = serde_json::from_value(body)?;
        Ok(response.snapshot)
    }

    async fn submit(&self, change: &NewChange) -> SyncResult<SubmitResponse> {
        let body = self.call(LoopbackRequest::Submit(change.clone()))?;
        Ok(serde_json::from_value(body)?)
    }

    async fn pull(&self, cursor: &CursorRepresentation, limit: usize) -> SyncResult<PullBatch> {
        let body = self.call(LoopbackRequest::Pull(PullQuery::new(cursor, limit)))?;
        let (response, malformed) = PullResponse::decode_lenient(body)?;
        Ok(PullBatch {
            response,
            malformed,
        })
    }

    async fn compact(&self) -> SyncResult<CompactResponse> {
        let body = self.call(LoopbackRequest::Compact)?;
        Ok(serde_json::from_value(body)?)
    }
}
