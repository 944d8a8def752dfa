//! # docsync Engine
//!
//! Offline-first client for a docsync server.
//!
//! This crate provides:
//! - [`SyncEngine`]: bootstrap from the snapshot, optimistic local
//!   mutations with background submission, periodic pulls
//! - [`LocalDocument`] and its persistence ([`FileDocumentStore`])
//! - transports: [`HttpTransport`] over `reqwest`, [`LoopbackTransport`]
//!   for in-process servers
//! - retry with exponential backoff ([`RetryConfig`])
//! - backups: [`BlobStore`], [`FileHost`], [`RepositoryMirror`] and the
//!   debounced [`BackupScheduler`]
//!
//! ## Sync model
//!
//! 1. Bootstrap loads the latest snapshot and positions the cursor at its
//!    boundary.
//! 2. Local mutations merge into the document at once and are submitted in
//!    the background under a stable id, so retries never duplicate them.
//! 3. Pulls merge records after the cursor in token order. When the log
//!    was compacted past the cursor, or the store only publishes a counter,
//!    the engine reloads from the snapshot instead.
//!
//! ## Key Invariants
//!
//! - A token is never applied twice
//! - Local mutations are never rolled back
//! - Submissions are retried, never cancelled
//! - Nothing that goes wrong with the server is fatal to the client

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backup;
mod config;
mod document;
mod engine;
mod error;
mod http;
mod state;
mod transport;

pub use backup::{
    BackupCatalog, BackupScheduler, BackupTarget, BlobInfo, BlobStore, DirBlobStore, FileHost,
    HostedFile, MemoryBlobStore, MemoryFileHost, NamedBackup, RepositoryMirror,
    BACKUP_CONTENT_TYPE,
};
pub use config::{RetryConfig, SyncConfig};
pub use document::{DocumentStore, FileDocumentStore, LocalDocument, MemoryDocumentStore};
pub use engine::{DocumentSource, PullOutcome, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use http::HttpTransport;
pub use state::{EngineState, SyncStats};
pub use transport::{
    LoopbackRequest, LoopbackServer, LoopbackTransport, PullBatch, SyncTransport,
};
