//! Error types for the sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server answered with an error status.
    #[error("server returned {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Error text from the response body.
        message: String,
    },

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Reading or writing the local document failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A backup collaborator failed.
    #[error("backup error: {0}")]
    Backup(String),

    /// A named blob or hosted file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A file-host write carried a revision that is no longer current.
    #[error("stale revision for {path}: expected {expected:?}, current {current:?}")]
    RevisionConflict {
        /// Hosted file path.
        path: String,
        /// Revision supplied by the writer.
        expected: Option<String>,
        /// Revision currently stored.
        current: Option<String>,
    },

    /// Caller-supplied input was rejected.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The engine was shut down.
    #[error("engine shut down")]
    ShutDown,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    ///
    /// 5xx responses and 409 (compaction in progress) are transient; other
    /// 4xx responses will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::Server { status, .. } => *status >= 500 || *status == 409,
            _ => false,
        }
    }
}

impl From<docsync_protocol::ProtocolError> for SyncError {
    fn from(e: docsync_protocol::ProtocolError) -> Self {
        SyncError::Protocol(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Protocol(e.to_string())
    }
}
