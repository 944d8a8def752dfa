//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Attempted to grow storage through truncation.
    #[error("cannot truncate to {requested} bytes, storage holds {size}")]
    TruncateBeyondEnd {
        /// The requested size.
        requested: u64,
        /// The current storage size.
        size: u64,
    },

    /// A frame failed validation.
    #[error("corrupt frame at offset {offset}: {reason}")]
    CorruptFrame {
        /// Offset of the frame header.
        offset: u64,
        /// What failed.
        reason: String,
    },

    /// A single frame exceeds the format limit.
    #[error("frame of {0} bytes exceeds the u32 length field")]
    FrameTooLarge(usize),
}

impl StorageError {
    /// Creates a corrupt-frame error.
    pub fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptFrame {
            offset,
            reason: reason.into(),
        }
    }
}
