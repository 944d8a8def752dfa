//! In-process server shared by the integration tests.

#![allow(dead_code)]

use docsync_engine::{
    LoopbackRequest, LoopbackServer, LoopbackTransport, MemoryDocumentStore, RetryConfig,
    SyncConfig, SyncEngine,
};
use docsync_protocol::Payload;
use docsync_server::{HandlerContext, RequestHandler, ServerConfig, ServerError};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// A request handler that can be swapped out to simulate a server restart.
pub struct InProcessServer {
    handler: RwLock<Arc<RequestHandler>>,
}

impl InProcessServer {
    pub fn new(context: HandlerContext) -> Arc<Self> {
        Arc::new(Self {
            handler: RwLock::new(Arc::new(RequestHandler::new(Arc::new(context)))),
        })
    }

    pub fn in_memory(config: ServerConfig) -> Arc<Self> {
        Self::new(HandlerContext::in_memory(config))
    }

    pub fn handler(&self) -> Arc<RequestHandler> {
        Arc::clone(&self.handler.read())
    }

    /// Replaces the handler, returning the old one.
    pub fn restart(&self, context: HandlerContext) -> Arc<RequestHandler> {
        let next = Arc::new(RequestHandler::new(Arc::new(context)));
        std::mem::replace(&mut *self.handler.write(), next)
    }
}

impl LoopbackServer for InProcessServer {
    fn handle(&self, request: LoopbackRequest) -> Result<Value, (u16, String)> {
        let handler = self.handler();
        let result = match request {
            LoopbackRequest::Bootstrap => handler.handle_bootstrap().map(to_json),
            LoopbackRequest::Submit(change) => handler.handle_submit(change).map(to_json),
            LoopbackRequest::Pull(query) => handler.handle_pull(&query).map(to_json),
            LoopbackRequest::Compact => handler.handle_compact().map(to_json),
        };
        result.map_err(|e| {
            let status = match &e {
                ServerError::CompactionInProgress => 409,
                e if e.is_client_error() => 400,
                _ => 500,
            };
            (status, e.to_string())
        })
    }
}

fn to_json<T: serde::Serialize>(body: T) -> Value {
    serde_json::to_value(body).unwrap()
}

pub type Transport = LoopbackTransport<InProcessServer>;

pub fn transport(server: &Arc<InProcessServer>) -> Arc<Transport> {
    Arc::new(LoopbackTransport::new(Arc::clone(server)))
}

pub fn client_config(name: &str) -> SyncConfig {
    SyncConfig::new("loopback://")
        .with_client_id(name)
        .with_poll_interval(Duration::from_millis(20))
        .with_retry(
            RetryConfig::new(5)
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(20))
                .with_jitter(false),
        )
}

pub fn client(name: &str, transport: Arc<Transport>) -> SyncEngine {
    SyncEngine::new(
        client_config(name),
        transport,
        Arc::new(MemoryDocumentStore::new()),
    )
    .unwrap()
}

pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().unwrap()
}

pub async fn wait_until_acked(engine: &SyncEngine) {
    for _ in 0..2000 {
        if engine.pending_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("submissions were not acknowledged");
}
