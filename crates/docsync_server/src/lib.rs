//! # docsync Server
//!
//! The shared side of docsync: a change log, an idempotency guard, a
//! snapshot slot, and the compaction job that folds one into the other.
//!
//! This crate provides:
//! - [`ChangeStore`] with in-memory and file-backed implementations
//! - [`IdempotencyGuard`] so retried submissions are applied once
//! - [`SnapshotStore`] with atomic overwrite
//! - [`CompactionJob`], its [`AppendGate`] and a [`CompactionPolicy`]
//! - request handlers and an axum router for the HTTP surface
//!
//! # Architecture
//!
//! Clients append partial updates to the log and poll for records after
//! their cursor. A compaction folds the log into the snapshot under an
//! exclusive append gate, clears the log and leaves one marker record
//! behind. Clients whose cursor falls before the marker re-bootstrap from
//! the snapshot.
//!
//! # Index modes
//!
//! A store publishes its log either as a list of ids or as a bare counter.
//! A counter index cannot be turned back into a list of records, so clients
//! of a counter-mode store always catch up through the snapshot.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod change_store;
mod compaction;
mod config;
mod dir;
mod error;
mod file_log;
mod handler;
mod http;
mod idempotency;
mod lock;
mod server;
mod snapshot_store;

pub use change_store::{AppendOutcome, ChangeRange, ChangeStore, MemoryChangeStore};
pub use compaction::{AppendGate, CompactionJob, CompactionPolicy, CompactionReport};
pub use config::ServerConfig;
pub use dir::{DataDir, StoreMeta, FORMAT_VERSION};
pub use error::{ServerError, ServerResult};
pub use file_log::FileChangeStore;
pub use handler::{HandlerContext, RequestHandler, StoreStatus};
pub use http::{router, HttpServer};
pub use idempotency::IdempotencyGuard;
pub use lock::{LeaseGuard, LeaseLock};
pub use server::{RunningServer, SyncServer};
pub use snapshot_store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
