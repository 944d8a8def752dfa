//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::http::HttpServer;
use docsync_protocol::unix_millis;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// The docsync server: stores, request handler and compaction scheduling.
///
/// # Example
///
/// ```
/// use docsync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// let status = server.context().status().unwrap();
/// assert_eq!(status.log_len, 0);
/// ```
pub struct SyncServer {
    handler: Arc<RequestHandler>,
}

impl SyncServer {
    /// Creates a server with in-memory stores.
    pub fn new(config: ServerConfig) -> Self {
        Self::from_context(HandlerContext::in_memory(config))
    }

    /// Opens the stores named by the configuration.
    pub fn open(config: ServerConfig) -> ServerResult<Self> {
        Ok(Self::from_context(HandlerContext::open(config)?))
    }

    /// Wraps an existing context.
    pub fn from_context(context: HandlerContext) -> Self {
        let handler = Arc::new(RequestHandler::new(Arc::new(context)));
        Self { handler }
    }

    /// Returns the request handler.
    pub fn handler(&self) -> Arc<RequestHandler> {
        Arc::clone(&self.handler)
    }

    /// Returns the shared context.
    pub fn context(&self) -> &HandlerContext {
        self.handler.context()
    }

    /// Starts the HTTP listener and, unless the policy is manual, the
    /// background compaction task.
    pub async fn spawn(self) -> ServerResult<RunningServer> {
        let addr = self.context().config.bind_addr;
        let http = HttpServer::spawn(addr, self.handler()).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let policy = &self.context().config.compaction;
        let compactor = if policy.is_manual() {
            None
        } else {
            Some(tokio::spawn(run_compaction_policy(
                Arc::clone(self.handler.context()),
                shutdown_rx,
            )))
        };

        Ok(RunningServer {
            http,
            compactor,
            shutdown: shutdown_tx,
            handler: self.handler,
        })
    }
}

/// A server with its listener and background tasks running.
pub struct RunningServer {
    http: HttpServer,
    compactor: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    handler: Arc<RequestHandler>,
}

impl RunningServer {
    /// Returns the bound HTTP address.
    pub fn local_addr(&self) -> SocketAddr {
        self.http.local_addr()
    }

    /// Returns the request handler.
    pub fn handler(&self) -> Arc<RequestHandler> {
        Arc::clone(&self.handler)
    }

    /// Stops the background tasks and the listener.
    pub async fn shutdown(self) -> ServerResult<()> {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.compactor {
            task.await
                .map_err(|e| ServerError::Internal(format!("compaction task failed: {e}")))?;
        }
        self.http.shutdown().await
    }
}

async fn run_compaction_policy(context: Arc<HandlerContext>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(context.config.compaction.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(policy = ?context.config.compaction, "compaction policy active");

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("compaction policy stopping");
                    return;
                }
            }
            _ = ticker.tick() => {
                let context = Arc::clone(&context);
                let result = tokio::task::spawn_blocking(move || context.compact_if_due(unix_millis())).await;
                match result {
                    Ok(Ok(Some(report))) => {
                        info!(folded = report.folded_count, through = %report.compacted_through, "scheduled compaction ran");
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(ServerError::CompactionInProgress)) => {
                        debug!("compaction already running, skipping tick");
                    }
                    Ok(Err(e)) => warn!(error = %e, "scheduled compaction failed"),
                    Err(e) => warn!(error = %e, "scheduled compaction task failed"),
                }
            }
        }
    }
}
