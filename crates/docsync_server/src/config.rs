//! Server configuration.

use crate::compaction::CompactionPolicy;
use crate::error::{ServerError, ServerResult};
use docsync_protocol::IndexMode;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the docsync server.
///
/// Usually loaded from a TOML file with [`Self::load`]; every field has a
/// default suitable for local development, so a config file only needs the
/// fields it changes:
///
/// ```toml
/// bind_addr = "0.0.0.0:7070"
/// data_dir = "/var/lib/docsync"
/// idempotency_ttl = "7days"
///
/// [compaction]
/// max_log_len = 5000
/// max_age = "1h"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Directory holding the durable stores. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Upper bound on records returned by one pull.
    pub max_pull_batch: usize,
    /// Index representation for a freshly created store.
    ///
    /// An existing data directory keeps the mode recorded in its metadata.
    pub index_mode: IndexMode,
    /// How long accepted change ids are remembered. `None` keeps them forever.
    #[serde(with = "humantime_serde")]
    pub idempotency_ttl: Option<Duration>,
    /// Lifetime of the compaction lease.
    #[serde(with = "humantime_serde")]
    pub compaction_lock_ttl: Duration,
    /// Automatic compaction thresholds.
    pub compaction: CompactionPolicy,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            data_dir: None,
            max_pull_batch: 500,
            index_mode: IndexMode::Ids,
            idempotency_ttl: None,
            compaction_lock_ttl: Duration::from_secs(60),
            compaction: CompactionPolicy::default(),
        }
    }

    /// Loads the configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parses the configuration from TOML text.
    pub fn from_toml(text: &str) -> ServerResult<Self> {
        toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Sets the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Sets the maximum pull batch size.
    pub fn with_max_pull_batch(mut self, size: usize) -> Self {
        self.max_pull_batch = size;
        self
    }

    /// Sets the index mode for new stores.
    pub fn with_index_mode(mut self, mode: IndexMode) -> Self {
        self.index_mode = mode;
        self
    }

    /// Sets the idempotency retention.
    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = Some(ttl);
        self
    }

    /// Sets the compaction lease lifetime.
    pub fn with_compaction_lock_ttl(mut self, ttl: Duration) -> Self {
        self.compaction_lock_ttl = ttl;
        self
    }

    /// Sets the automatic compaction policy.
    pub fn with_compaction(mut self, policy: CompactionPolicy) -> Self {
        self.compaction = policy;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 7070)))
    }
}
