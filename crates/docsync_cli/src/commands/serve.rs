//! Serve command implementation.

use docsync_protocol::IndexMode;
use docsync_server::{ServerConfig, SyncServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

/// Command-line overrides for the server configuration.
#[derive(Debug, Default)]
pub struct ServeOptions {
    /// TOML configuration file.
    pub config: Option<PathBuf>,
    /// Data directory; in-memory stores when neither this nor the file names one.
    pub data_dir: Option<PathBuf>,
    /// Listen address.
    pub bind: Option<SocketAddr>,
    /// Index mode for a new store.
    pub index_mode: Option<IndexMode>,
}

impl ServeOptions {
    /// Resolves the effective configuration. Flags win over the file.
    pub fn resolve(&self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config = config.with_data_dir(dir);
        }
        if let Some(addr) = self.bind {
            config.bind_addr = addr;
        }
        if let Some(mode) = self.index_mode {
            config = config.with_index_mode(mode);
        }
        Ok(config)
    }
}

/// Runs the serve command until interrupted.
pub fn run(options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config = options.resolve()?;
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async move {
        match &config.data_dir {
            Some(dir) => info!(path = %dir.display(), "using data directory"),
            None => info!("no data directory, keeping state in memory"),
        }

        let server = SyncServer::open(config)?.spawn().await?;
        println!("Listening on http://{}", server.local_addr());

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        server.shutdown().await?;
        Ok(())
    })
}
