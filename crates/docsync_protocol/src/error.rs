//! Error types for protocol encoding and validation.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or validating protocol values.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A cursor string could not be parsed.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    /// A change id is not acceptable.
    #[error("invalid change id: {0}")]
    InvalidChangeId(String),
}
