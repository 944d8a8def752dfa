//! The shared, append-only change log.

use crate::error::ServerResult;
use crate::idempotency::IdempotencyGuard;
use docsync_protocol::{
    unix_millis, ChangeId, ChangeRecord, IndexMode, LogIndex, NewChange, SequenceToken,
};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Token of the record holding the submitted id.
    pub token: SequenceToken,
    /// True if the id had already been accepted and nothing was written.
    pub duplicated: bool,
}

impl AppendOutcome {
    fn appended(token: SequenceToken) -> Self {
        Self {
            token,
            duplicated: false,
        }
    }

    fn duplicate(token: SequenceToken) -> Self {
        Self {
            token,
            duplicated: true,
        }
    }
}

/// A durable, ordered log of change records.
///
/// Tokens are assigned densely from 1 and are never reused, including
/// across [`ChangeStore::clear`]. Implementations are shared by every
/// request handler and the compaction job, so all methods take `&self`.
pub trait ChangeStore: Send + Sync {
    /// Appends a submission.
    ///
    /// Appending an id that was already accepted writes nothing and returns
    /// the existing token with `duplicated` set.
    fn append(&self, change: NewChange) -> ServerResult<AppendOutcome>;

    /// Returns up to `limit` records with `from_exclusive < token <= to_inclusive`,
    /// in ascending token order.
    fn read_range(
        &self,
        from_exclusive: SequenceToken,
        to_inclusive: SequenceToken,
        limit: usize,
    ) -> ServerResult<Vec<ChangeRecord>>;

    /// Looks up a record still in the log by id.
    fn get(&self, id: &ChangeId) -> ServerResult<Option<ChangeRecord>>;

    /// Removes every record and appends a marker for a fold through
    /// `compacted_through`. Returns the marker.
    ///
    /// Only the compaction job calls this, after the snapshot is written.
    fn clear(&self, compacted_through: SequenceToken) -> ServerResult<ChangeRecord>;

    /// Token of the newest record ever appended.
    fn latest(&self) -> SequenceToken;

    /// Highest token removed by the last clear; zero if never cleared.
    fn log_start(&self) -> SequenceToken;

    /// Number of records currently in the log, markers included.
    fn len(&self) -> usize;

    /// Returns true if the log holds no records.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How this store publishes its index.
    fn index_mode(&self) -> IndexMode;

    /// The current index in the store's representation.
    fn index(&self) -> LogIndex;

    /// Forgets idempotency claims older than the configured TTL.
    fn purge_expired(&self) -> usize;
}

/// In-memory view of the log shared by the store implementations.
#[derive(Debug, Default)]
pub(crate) struct LogState {
    records: Vec<ChangeRecord>,
    log_start: SequenceToken,
    latest: SequenceToken,
}

impl LogState {
    /// Rebuilds the view from records in append order.
    ///
    /// `floor` is the boundary of the newest snapshot; the log never starts
    /// below it even if the marker for that snapshot was not written.
    pub(crate) fn from_records(records: Vec<ChangeRecord>, floor: SequenceToken) -> Self {
        let marker_boundary = records
            .iter()
            .filter_map(ChangeRecord::compaction_boundary)
            .max()
            .unwrap_or_default();
        let last = records
            .last()
            .map(|r| r.sequence_token)
            .unwrap_or_default();
        Self {
            records,
            log_start: marker_boundary.max(floor),
            latest: last.max(floor),
        }
    }

    pub(crate) fn next_token(&self) -> SequenceToken {
        self.latest.next()
    }

    pub(crate) fn push(&mut self, record: ChangeRecord) {
        self.latest = self.latest.max(record.sequence_token);
        self.records.push(record);
    }

    pub(crate) fn range(
        &self,
        from_exclusive: SequenceToken,
        to_inclusive: SequenceToken,
        limit: usize,
    ) -> Vec<ChangeRecord> {
        let start = self
            .records
            .partition_point(|r| r.sequence_token <= from_exclusive);
        self.records[start..]
            .iter()
            .take_while(|r| r.sequence_token <= to_inclusive)
            .take(limit)
            .cloned()
            .collect()
    }

    pub(crate) fn find(&self, id: &ChangeId, hint: Option<SequenceToken>) -> Option<&ChangeRecord> {
        if let Some(token) = hint {
            if let Ok(pos) = self
                .records
                .binary_search_by_key(&token, |r| r.sequence_token)
            {
                if self.records[pos].id == *id {
                    return Some(&self.records[pos]);
                }
            }
        }
        self.records.iter().find(|r| r.id == *id)
    }

    pub(crate) fn clear_with_marker(&mut self, marker: ChangeRecord) {
        self.records.clear();
        if let Some(boundary) = marker.compaction_boundary() {
            self.log_start = self.log_start.max(boundary);
        }
        self.push(marker);
    }

    pub(crate) fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub(crate) fn index(&self, mode: IndexMode) -> LogIndex {
        match mode {
            IndexMode::Ids => LogIndex::Ids(self.records.iter().map(|r| r.id.clone()).collect()),
            IndexMode::Counter => LogIndex::Counter(self.latest.as_u64()),
        }
    }

    pub(crate) fn latest(&self) -> SequenceToken {
        self.latest
    }

    pub(crate) fn log_start(&self) -> SequenceToken {
        self.log_start
    }
}

/// Token to report for an id the guard has already seen.
pub(crate) fn existing_token(
    guard: &IdempotencyGuard,
    state: &LogState,
    id: &ChangeId,
) -> SequenceToken {
    let hint = guard.token_of(id);
    hint.or_else(|| state.find(id, None).map(|r| r.sequence_token))
        .unwrap_or_default()
}

/// A change store kept entirely in memory.
///
/// Used for tests and for servers started without a data directory.
#[derive(Debug)]
pub struct MemoryChangeStore {
    state: RwLock<LogState>,
    guard: IdempotencyGuard,
    mode: IndexMode,
}

impl MemoryChangeStore {
    /// Creates an empty store with an id-list index.
    pub fn new() -> Self {
        Self::with_options(IndexMode::Ids, None)
    }

    /// Creates an empty store.
    pub fn with_options(mode: IndexMode, idempotency_ttl: Option<Duration>) -> Self {
        Self {
            state: RwLock::new(LogState::default()),
            guard: IdempotencyGuard::with_ttl(idempotency_ttl),
            mode,
        }
    }
}

impl Default for MemoryChangeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeStore for MemoryChangeStore {
    fn append(&self, change: NewChange) -> ServerResult<AppendOutcome> {
        change.id.validate()?;
        let mut state = self.state.write();

        if !self.guard.claim(&change.id) {
            debug!(id = %change.id, "duplicate submission");
            return Ok(AppendOutcome::duplicate(existing_token(
                &self.guard,
                &state,
                &change.id,
            )));
        }

        let token = state.next_token();
        let id = change.id.clone();
        state.push(ChangeRecord::accepted(change, token, unix_millis()));
        self.guard.assign(&id, token);
        Ok(AppendOutcome::appended(token))
    }

    fn read_range(
        &self,
        from_exclusive: SequenceToken,
        to_inclusive: SequenceToken,
        limit: usize,
    ) -> ServerResult<Vec<ChangeRecord>> {
        Ok(self.state.read().range(from_exclusive, to_inclusive, limit))
    }

    fn get(&self, id: &ChangeId) -> ServerResult<Option<ChangeRecord>> {
        let hint = self.guard.token_of(id);
        Ok(self.state.read().find(id, hint).cloned())
    }

    fn clear(&self, compacted_through: SequenceToken) -> ServerResult<ChangeRecord> {
        let mut state = self.state.write();
        let marker = ChangeRecord::marker(compacted_through, state.next_token(), unix_millis());
        state.clear_with_marker(marker.clone());
        Ok(marker)
    }

    fn latest(&self) -> SequenceToken {
        self.state.read().latest()
    }

    fn log_start(&self) -> SequenceToken {
        self.state.read().log_start()
    }

    fn len(&self) -> usize {
        self.state.read().records().len()
    }

    fn index_mode(&self) -> IndexMode {
        self.mode
    }

    fn index(&self) -> LogIndex {
        self.state.read().index(self.mode)
    }

    fn purge_expired(&self) -> usize {
        self.guard.purge_expired()
    }
}

/// Lazy, finite walk over a token range, fetched a page at a time.
///
/// The walk can be resumed after an error or in a later request by
/// starting a new range at [`ChangeRange::position`].
pub struct ChangeRange<'a> {
    store: &'a dyn ChangeStore,
    position: SequenceToken,
    to_inclusive: SequenceToken,
    page_size: usize,
    page: VecDeque<ChangeRecord>,
    exhausted: bool,
}

impl<'a> ChangeRange<'a> {
    /// Walks `from_exclusive < token <= to_inclusive`.
    pub fn new(
        store: &'a dyn ChangeStore,
        from_exclusive: SequenceToken,
        to_inclusive: SequenceToken,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            position: from_exclusive,
            to_inclusive,
            page_size: page_size.max(1),
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Walks the whole log as of now.
    pub fn all(store: &'a dyn ChangeStore, page_size: usize) -> Self {
        Self::new(store, SequenceToken::BEGINNING, store.latest(), page_size)
    }

    /// Token of the last record yielded.
    pub fn position(&self) -> SequenceToken {
        self.position
    }
}

impl Iterator for ChangeRange<'_> {
    type Item = ServerResult<ChangeRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            match self
                .store
                .read_range(self.position, self.to_inclusive, self.page_size)
            {
                Ok(records) => {
                    self.exhausted = records.len() < self.page_size;
                    self.page.extend(records);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        let record = self.page.pop_front()?;
        self.position = record.sequence_token;
        Some(Ok(record))
    }
}
