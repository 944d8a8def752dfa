//! HTTP surface of the docsync server.
//!
//! | method | path | body |
//! |---|---|---|
//! | `GET` | `/bootstrap` | [`BootstrapResponse`] |
//! | `POST` | `/changes` | [`NewChange`] in, [`SubmitResponse`] out |
//! | `GET` | `/changes?cursor=&limit=` | [`PullResponse`] |
//! | `POST` | `/compact` | [`CompactResponse`] |
//!
//! Store calls can block on the append gate or on disk, so they run on the
//! blocking thread pool.

use crate::error::{ServerError, ServerResult};
use crate::handler::RequestHandler;
use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use docsync_protocol::{
    BootstrapResponse, CompactResponse, ErrorResponse, NewChange, PullQuery, PullResponse,
    SubmitResponse,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

type AppState = Arc<RequestHandler>;

/// Builds the router for the sync endpoints.
pub fn router(handler: Arc<RequestHandler>) -> Router {
    Router::new()
        .route("/bootstrap", get(bootstrap))
        .route("/changes", get(pull).post(submit))
        .route("/compact", post(compact))
        .route("/healthcheck", get(|| async { "OK" }))
        .with_state(handler)
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::CompactionInProgress => StatusCode::CONFLICT,
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}

impl From<JsonRejection> for ServerError {
    fn from(value: JsonRejection) -> Self {
        ServerError::InvalidRequest(value.body_text())
    }
}

impl From<QueryRejection> for ServerError {
    fn from(value: QueryRejection) -> Self {
        ServerError::InvalidRequest(value.body_text())
    }
}

async fn blocking<T, F>(handler: AppState, f: F) -> ServerResult<Json<T>>
where
    T: Send + 'static,
    F: FnOnce(&RequestHandler) -> ServerResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&handler))
        .await
        .map_err(|e| ServerError::Internal(format!("handler task failed: {e}")))?
        .map(Json)
}

async fn bootstrap(State(handler): State<AppState>) -> ServerResult<Json<BootstrapResponse>> {
    blocking(handler, |h| h.handle_bootstrap()).await
}

async fn submit(
    State(handler): State<AppState>,
    body: Result<Json<NewChange>, JsonRejection>,
) -> ServerResult<Json<SubmitResponse>> {
    let Json(change) = body?;
    blocking(handler, move |h| h.handle_submit(change)).await
}

async fn pull(
    State(handler): State<AppState>,
    query: Result<Query<PullQuery>, QueryRejection>,
) -> ServerResult<Json<PullResponse>> {
    let Query(query) = query?;
    blocking(handler, move |h| h.handle_pull(&query)).await
}

async fn compact(State(handler): State<AppState>) -> ServerResult<Json<CompactResponse>> {
    blocking(handler, |h| h.handle_compact()).await
}

/// A running HTTP listener.
pub struct HttpServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl HttpServer {
    /// Binds `addr` and starts serving `handler`.
    pub async fn spawn(addr: SocketAddr, handler: Arc<RequestHandler>) -> ServerResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let app = router(handler);
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!("HTTP server listening on {local_addr}");
        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for in-flight requests.
    pub async fn shutdown(mut self) -> ServerResult<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.wait().await
    }

    /// Waits until the server stops.
    pub async fn wait(self) -> ServerResult<()> {
        match self.task.await {
            Ok(result) => Ok(result?),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(ServerError::Internal(format!("http task panicked: {e}"))),
        }
    }
}
