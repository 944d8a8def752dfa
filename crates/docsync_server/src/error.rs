//! Error types for the docsync server.

use docsync_protocol::ProtocolError;
use docsync_storage::StorageError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the docsync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A cursor or change id failed validation.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Another compaction holds the compaction lease.
    #[error("compaction already in progress")]
    CompactionInProgress,

    /// The data directory is locked by another process.
    #[error("data directory is locked by another process: {0}")]
    DirectoryLocked(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// Record or snapshot encoding failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::Protocol(_)
                | ServerError::CompactionInProgress
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Encoding(err.to_string())
    }
}
