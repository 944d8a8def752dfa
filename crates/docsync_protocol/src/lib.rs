//! # docsync Protocol
//!
//! Types shared by the docsync change store, compaction job and client
//! engine.
//!
//! This crate provides:
//! - [`ChangeRecord`], [`ChangeId`] and [`SequenceToken`] for the change log
//! - [`Snapshot`] for compacted state
//! - [`CursorRepresentation`] and [`LogIndex`], the two coexisting ways of
//!   describing how much of the log has been seen
//! - shallow last-writer-wins merging ([`merge_into`], [`fold`])
//! - JSON wire messages for the HTTP surface
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cursor;
mod error;
mod merge;
mod messages;
mod record;
mod snapshot;

pub use cursor::{CursorRepresentation, IndexMode, LogIndex};
pub use error::{ProtocolError, ProtocolResult};
pub use merge::{fold, merge_into};
pub use messages::{
    BootstrapResponse, CompactResponse, ErrorResponse, MalformedRecord, PullQuery, PullResponse,
    SubmitResponse,
};
pub use record::{
    unix_millis, ChangeId, ChangeRecord, DocumentState, NewChange, Payload, RecordKind,
    SequenceToken,
};
pub use snapshot::Snapshot;
