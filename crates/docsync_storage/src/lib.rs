//! # docsync Storage
//!
//! Byte-level persistence for docsync stores.
//!
//! Backends are **opaque byte stores**: they append, read and truncate bytes
//! and know nothing about change records or snapshots. On top of them,
//! [`FrameLog`] provides a checksummed, length-prefixed frame format that the
//! durable change log uses.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral stores
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use docsync_storage::{FrameLog, InMemoryBackend};
//!
//! let mut log = FrameLog::open(InMemoryBackend::new()).unwrap();
//! log.append(b"first").unwrap();
//! log.append(b"second").unwrap();
//!
//! let frames: Vec<_> = log.iter().map(|f| f.unwrap().data).collect();
//! assert_eq!(frames, vec![b"first".to_vec(), b"second".to_vec()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod frame;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use frame::{compute_crc32, Frame, FrameLog, FRAME_HEADER_SIZE, FRAME_MAGIC};
pub use memory::InMemoryBackend;
