//! Engine lifecycle state and statistics.

use std::time::Instant;

/// Lifecycle of a [`crate::SyncEngine`].
///
/// There is no terminal state: a resync moves the engine back through
/// bootstrap and it keeps pulling afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No snapshot fetched and no saved document loaded yet.
    Uninitialized,
    /// The document has a starting point; no pull has completed yet.
    Bootstrapped,
    /// At least one pull has completed.
    Syncing,
}

impl EngineState {
    /// Returns true once the document has a starting point.
    pub fn is_initialized(&self) -> bool {
        !matches!(self, EngineState::Uninitialized)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Local mutations applied.
    pub mutations: u64,
    /// Submissions acknowledged by the server.
    pub submitted: u64,
    /// Acknowledgements that reported a duplicate.
    pub duplicates: u64,
    /// Failed attempts that were retried.
    pub retries: u64,
    /// Submissions dropped after a permanent error.
    pub rejected: u64,
    /// Records merged from pulls.
    pub records_pulled: u64,
    /// Completed pulls.
    pub pulls: u64,
    /// Times the document was reloaded from a snapshot.
    pub resyncs: u64,
    /// Pulled entries skipped because they did not decode.
    pub malformed_skipped: u64,
    /// Last successful pull.
    pub last_pull_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}
