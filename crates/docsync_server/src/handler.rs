//! Request handlers for the sync endpoints.

use crate::change_store::{AppendOutcome, ChangeRange, ChangeStore, MemoryChangeStore};
use crate::compaction::{AppendGate, CompactionJob, CompactionReport};
use crate::config::ServerConfig;
use crate::dir::DataDir;
use crate::error::ServerResult;
use crate::file_log::FileChangeStore;
use crate::snapshot_store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
use docsync_protocol::{
    fold, BootstrapResponse, ChangeId, ChangeRecord, CompactResponse, CursorRepresentation,
    IndexMode, LogIndex, NewChange, PullQuery, PullResponse, SequenceToken, Snapshot,
    SubmitResponse,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Page size used when materializing a snapshot for counter-mode stores.
const MATERIALIZE_PAGE_SIZE: usize = 1024;

/// Shared state behind every request.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    changes: Arc<dyn ChangeStore>,
    snapshots: Arc<dyn SnapshotStore>,
    gate: AppendGate,
    compaction: CompactionJob,
    _data_dir: Option<DataDir>,
}

/// Point-in-time summary of the stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStatus {
    /// Published index representation.
    pub index_mode: IndexMode,
    /// Records currently in the log.
    pub log_len: usize,
    /// Newest token ever assigned.
    pub latest: SequenceToken,
    /// Highest token removed by the last truncation.
    pub log_start: SequenceToken,
    /// Boundary of the stored snapshot, if any.
    pub snapshot_through: Option<SequenceToken>,
    /// Number of keys in the stored snapshot.
    pub snapshot_keys: usize,
}

impl HandlerContext {
    /// Creates a context over the given stores.
    pub fn new(
        config: ServerConfig,
        changes: Arc<dyn ChangeStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        let compaction = CompactionJob::new(config.compaction_lock_ttl);
        Self {
            config,
            changes,
            snapshots,
            gate: AppendGate::new(),
            compaction,
            _data_dir: None,
        }
    }

    /// Creates a context with in-memory stores.
    pub fn in_memory(config: ServerConfig) -> Self {
        let changes = Arc::new(MemoryChangeStore::with_options(
            config.index_mode,
            config.idempotency_ttl,
        ));
        Self::new(config, changes, Arc::new(MemorySnapshotStore::new()))
    }

    /// Opens the stores named by the configuration.
    ///
    /// Without a `data_dir` this is the same as [`Self::in_memory`].
    pub fn open(config: ServerConfig) -> ServerResult<Self> {
        let Some(path) = config.data_dir.clone() else {
            return Ok(Self::in_memory(config));
        };

        let dir = DataDir::open(&path)?;
        let meta = dir.load_or_init_meta(config.index_mode)?;
        let snapshots = FileSnapshotStore::new(dir.snapshot_path());
        let floor = snapshots
            .get()?
            .map(|s| s.compacted_through)
            .unwrap_or_default();
        let changes = FileChangeStore::open(
            &dir.changes_path(),
            meta.index_mode,
            config.idempotency_ttl,
            floor,
        )?;

        info!(path = %path.display(), index_mode = %meta.index_mode, "opened data directory");

        let mut context = Self::new(config, Arc::new(changes), Arc::new(snapshots));
        context._data_dir = Some(dir);
        Ok(context)
    }

    /// Returns the change store.
    pub fn changes(&self) -> &dyn ChangeStore {
        self.changes.as_ref()
    }

    /// Returns the snapshot store.
    pub fn snapshots(&self) -> &dyn SnapshotStore {
        self.snapshots.as_ref()
    }

    /// Appends through the append gate.
    pub fn append(&self, change: NewChange) -> ServerResult<AppendOutcome> {
        let _shared = self.gate.shared();
        self.changes.append(change)
    }

    /// Runs one compaction.
    pub fn compact(&self) -> ServerResult<CompactionReport> {
        self.compaction
            .run(&self.gate, self.changes.as_ref(), self.snapshots.as_ref())
    }

    /// Runs a compaction if the configured policy says one is due.
    pub fn compact_if_due(&self, now_millis: u64) -> ServerResult<Option<CompactionReport>> {
        let purged = self.changes.purge_expired();
        if purged > 0 {
            debug!(purged, "expired idempotency claims");
        }
        if self.compaction.is_running()
            || !self.config.compaction.is_due(self.changes(), now_millis)?
        {
            return Ok(None);
        }
        self.compact().map(Some)
    }

    /// Summarizes the stores.
    pub fn status(&self) -> ServerResult<StoreStatus> {
        let snapshot = self.snapshots.get()?;
        Ok(StoreStatus {
            index_mode: self.changes.index_mode(),
            log_len: self.changes.len(),
            latest: self.changes.latest(),
            log_start: self.changes.log_start(),
            snapshot_through: snapshot.as_ref().map(|s| s.compacted_through),
            snapshot_keys: snapshot.map_or(0, |s| s.key_count()),
        })
    }

    /// The stored snapshot with the live log folded on top.
    ///
    /// Counter-mode stores cannot hand out deltas, so their clients
    /// bootstrap from this instead of the stored snapshot.
    fn materialized_snapshot(&self) -> ServerResult<Option<Snapshot>> {
        let _shared = self.gate.shared();
        let stored = self.snapshots.get()?;
        let floor = stored
            .as_ref()
            .map(|s| s.compacted_through)
            .unwrap_or_default();
        let latest = self.changes.latest();
        if latest <= floor {
            return Ok(stored);
        }

        let records = ChangeRange::new(self.changes(), floor, latest, MATERIALIZE_PAGE_SIZE)
            .collect::<ServerResult<Vec<ChangeRecord>>>()?;
        let through = records.last().map_or(floor, |r| r.sequence_token);
        let (base, compacted_at) = match stored {
            Some(s) => (s.state, s.compacted_at),
            None => Default::default(),
        };
        Ok(Some(Snapshot::new(fold(base, &records), through, compacted_at)))
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Returns the shared context.
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.context
    }

    /// Handles `GET /bootstrap`.
    pub fn handle_bootstrap(&self) -> ServerResult<BootstrapResponse> {
        let snapshot = match self.context.changes.index_mode() {
            IndexMode::Ids => self.context.snapshots.get()?,
            IndexMode::Counter => self.context.materialized_snapshot()?,
        };
        Ok(BootstrapResponse::new(snapshot))
    }

    /// Handles `POST /changes`.
    pub fn handle_submit(&self, change: NewChange) -> ServerResult<SubmitResponse> {
        let outcome = self.context.append(change)?;
        Ok(SubmitResponse {
            ok: true,
            duplicated: outcome.duplicated,
            sequence_token: outcome.token,
        })
    }

    /// Handles `GET /changes`.
    pub fn handle_pull(&self, query: &PullQuery) -> ServerResult<PullResponse> {
        let max = self.context.config.max_pull_batch.max(1);
        let limit = query.limit.unwrap_or(max).clamp(1, max);
        let cursor = query.cursor()?;

        // Keeps the truncation check and the read on the same side of any
        // compaction.
        let _shared = self.context.gate.shared();
        let changes = self.context.changes();
        let mode = changes.index_mode();

        match cursor {
            CursorRepresentation::CountForm(count) => self.pull_count(changes, mode, count, limit),
            CursorRepresentation::ListForm(seen) => self.pull_list(changes, mode, seen, limit),
        }
    }

    /// Handles `POST /compact`.
    pub fn handle_compact(&self) -> ServerResult<CompactResponse> {
        let report = self.context.compact()?;
        Ok(CompactResponse {
            ok: true,
            folded_count: report.folded_count,
            compacted_through: report.compacted_through,
        })
    }

    fn pull_count(
        &self,
        changes: &dyn ChangeStore,
        mode: IndexMode,
        count: u64,
        limit: usize,
    ) -> ServerResult<PullResponse> {
        let cursor = CursorRepresentation::CountForm(count);
        let latest = changes.latest();

        if mode == IndexMode::Counter {
            // A bare counter says how far the log went, not what is in it.
            if latest.as_u64() != count {
                debug!(count, latest = %latest, "counter index ahead of cursor");
                return Ok(PullResponse::snapshot_needed(cursor, mode));
            }
            return Ok(up_to_date(cursor, mode));
        }

        if count > latest.as_u64() || count < changes.log_start().as_u64() {
            info!(
                count,
                log_start = %changes.log_start(),
                latest = %latest,
                "cursor outside live log, snapshot needed"
            );
            return Ok(PullResponse::snapshot_needed(cursor, mode));
        }

        let mut records = changes.read_range(SequenceToken::new(count), latest, limit + 1)?;
        let has_more = records.len() > limit;
        records.truncate(limit);
        let new_cursor = records
            .last()
            .map_or(cursor, |r| CursorRepresentation::after(r.sequence_token));

        Ok(PullResponse {
            ok: true,
            changes: records,
            new_cursor,
            snapshot_needed: false,
            index_mode: mode,
            has_more,
        })
    }

    fn pull_list(
        &self,
        changes: &dyn ChangeStore,
        mode: IndexMode,
        seen: Vec<ChangeId>,
        limit: usize,
    ) -> ServerResult<PullResponse> {
        let LogIndex::Ids(ids) = changes.index() else {
            debug!("list cursor against counter index, snapshot needed");
            return Ok(PullResponse::snapshot_needed(
                CursorRepresentation::ListForm(seen),
                mode,
            ));
        };

        let boundary = changes.log_start();
        if boundary > SequenceToken::BEGINNING
            && !seen.contains(&ChangeId::compaction_marker(boundary))
        {
            info!(boundary = %boundary, "list cursor predates compaction, snapshot needed");
            return Ok(PullResponse::snapshot_needed(
                CursorRepresentation::ListForm(seen),
                mode,
            ));
        }

        let seen_set: HashSet<&ChangeId> = seen.iter().collect();
        let unseen: Vec<&ChangeId> = ids.iter().filter(|id| !seen_set.contains(id)).collect();
        let has_more = unseen.len() > limit;

        let mut records = Vec::with_capacity(unseen.len().min(limit));
        for id in unseen.into_iter().take(limit) {
            if let Some(record) = changes.get(id)? {
                records.push(record);
            }
        }

        let new_cursor = if has_more {
            let mut extended = seen;
            extended.extend(records.iter().map(|r| r.id.clone()));
            CursorRepresentation::ListForm(extended)
        } else {
            // Everything listed has now been delivered; continue by count.
            let last = match ids.last() {
                Some(id) => changes.get(id)?.map(|r| r.sequence_token),
                None => None,
            };
            CursorRepresentation::after(last.unwrap_or(boundary))
        };

        Ok(PullResponse {
            ok: true,
            changes: records,
            new_cursor,
            snapshot_needed: false,
            index_mode: mode,
            has_more,
        })
    }
}

fn up_to_date(cursor: CursorRepresentation, mode: IndexMode) -> PullResponse {
    PullResponse {
        ok: true,
        changes: Vec::new(),
        new_cursor: cursor,
        snapshot_needed: false,
        index_mode: mode,
        has_more: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn change(id: &str, payload: Value) -> NewChange {
        NewChange::new(
            ChangeId::new(id).unwrap(),
            payload.as_object().cloned().unwrap(),
        )
    }

    fn create_handler(config: ServerConfig) -> RequestHandler {
        RequestHandler::new(Arc::new(HandlerContext::in_memory(config)))
    }

    fn pull(handler: &RequestHandler, cursor: CursorRepresentation, limit: usize) -> PullResponse {
        handler
            .handle_pull(&PullQuery::new(&cursor, limit))
            .unwrap()
    }

    fn ids(response: &PullResponse) -> Vec<&str> {
        response.changes.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn bootstrap_without_snapshot() {
        let handler = create_handler(ServerConfig::default());
        let response = handler.handle_bootstrap().unwrap();
        assert!(response.ok);
        assert!(response.snapshot.is_none());
    }

    #[test]
    fn submit_twice_reports_duplicate() {
        let handler = create_handler(ServerConfig::default());
        let first = handler.handle_submit(change("x1", json!({"balance": 100}))).unwrap();
        let second = handler.handle_submit(change("x1", json!({"balance": 100}))).unwrap();

        assert!(!first.duplicated);
        assert!(second.duplicated);
        assert_eq!(first.sequence_token, second.sequence_token);
        assert_eq!(handler.context().changes().len(), 1);
    }

    #[test]
    fn pull_pagination() {
        let handler = create_handler(ServerConfig::default());
        for i in 0..5 {
            handler
                .handle_submit(change(&format!("c{i}"), json!({"i": i})))
                .unwrap();
        }

        let page = pull(&handler, CursorRepresentation::beginning(), 2);
        assert_eq!(ids(&page), vec!["c0", "c1"]);
        assert!(page.has_more);
        assert_eq!(page.new_cursor, CursorRepresentation::CountForm(2));

        let page = pull(&handler, page.new_cursor, 2);
        assert_eq!(ids(&page), vec!["c2", "c3"]);

        let page = pull(&handler, page.new_cursor, 2);
        assert_eq!(ids(&page), vec!["c4"]);
        assert!(!page.has_more);

        let idle = pull(&handler, page.new_cursor.clone(), 2);
        assert!(idle.changes.is_empty());
        assert_eq!(idle.new_cursor, page.new_cursor);
    }

    #[test]
    fn pull_limit_is_capped_by_config() {
        let handler = create_handler(ServerConfig::default().with_max_pull_batch(2));
        for i in 0..4 {
            handler
                .handle_submit(change(&format!("c{i}"), json!({})))
                .unwrap();
        }
        let page = pull(&handler, CursorRepresentation::beginning(), 100);
        assert_eq!(page.changes.len(), 2);
        assert!(page.has_more);
    }

    #[test]
    fn bad_cursor_is_client_error() {
        let handler = create_handler(ServerConfig::default());
        let query = PullQuery {
            cursor: Some("not-a-cursor".into()),
            limit: None,
        };
        let err = handler.handle_pull(&query).unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn cursor_behind_compaction_needs_snapshot() {
        let handler = create_handler(ServerConfig::default());
        handler.handle_submit(change("a", json!({"a": 1}))).unwrap();
        handler.handle_submit(change("b", json!({"b": 2}))).unwrap();
        let compact = handler.handle_compact().unwrap();
        assert_eq!(compact.folded_count, 2);

        let stale = pull(&handler, CursorRepresentation::CountForm(1), 10);
        assert!(stale.snapshot_needed);
        assert!(stale.changes.is_empty());

        let caught_up = pull(&handler, CursorRepresentation::CountForm(2), 10);
        assert!(!caught_up.snapshot_needed);
        assert_eq!(caught_up.changes.len(), 1);
        assert!(caught_up.changes[0].is_marker());
        assert_eq!(caught_up.new_cursor, CursorRepresentation::CountForm(3));
    }

    #[test]
    fn cursor_ahead_of_store_needs_snapshot() {
        let handler = create_handler(ServerConfig::default());
        let response = pull(&handler, CursorRepresentation::CountForm(40), 10);
        assert!(response.snapshot_needed);
    }

    #[test]
    fn counter_index_never_lists_changes() {
        let handler = create_handler(ServerConfig::default().with_index_mode(IndexMode::Counter));
        handler.handle_submit(change("a", json!({"a": 1}))).unwrap();
        handler.handle_submit(change("b", json!({"b": 2}))).unwrap();

        let behind = pull(&handler, CursorRepresentation::CountForm(0), 10);
        assert!(behind.snapshot_needed);
        assert!(behind.changes.is_empty());
        assert_eq!(behind.index_mode, IndexMode::Counter);

        let list = pull(&handler, CursorRepresentation::ListForm(vec![]), 10);
        assert!(list.snapshot_needed);
        assert!(list.changes.is_empty());

        let current = pull(&handler, CursorRepresentation::CountForm(2), 10);
        assert!(!current.snapshot_needed);
        assert!(current.changes.is_empty());
    }

    #[test]
    fn counter_bootstrap_includes_live_log() {
        let handler = create_handler(ServerConfig::default().with_index_mode(IndexMode::Counter));
        handler.handle_submit(change("a", json!({"a": 1}))).unwrap();
        handler.handle_compact().unwrap();
        handler.handle_submit(change("b", json!({"b": 2}))).unwrap();

        let snapshot = handler.handle_bootstrap().unwrap().snapshot.unwrap();
        assert_eq!(Value::Object(snapshot.state), json!({"a": 1, "b": 2}));
        assert_eq!(snapshot.compacted_through, SequenceToken::new(3));

        let stored = handler.context().snapshots().get().unwrap().unwrap();
        assert_eq!(stored.compacted_through, SequenceToken::new(1));
    }

    #[test]
    fn list_cursor_gets_unseen_records_then_migrates() {
        let handler = create_handler(ServerConfig::default());
        for id in ["a", "b", "c", "d"] {
            handler.handle_submit(change(id, json!({ "k": id }))).unwrap();
        }

        let seen = vec![ChangeId::new("a").unwrap(), ChangeId::new("c").unwrap()];
        let response = pull(&handler, CursorRepresentation::ListForm(seen), 10);

        assert_eq!(ids(&response), vec!["b", "d"]);
        assert_eq!(response.new_cursor, CursorRepresentation::CountForm(4));
        assert!(!response.snapshot_needed);
    }

    #[test]
    fn partial_list_page_stays_in_list_form() {
        let handler = create_handler(ServerConfig::default());
        for id in ["a", "b", "c"] {
            handler.handle_submit(change(id, json!({}))).unwrap();
        }

        let response = pull(&handler, CursorRepresentation::ListForm(vec![]), 1);
        assert_eq!(ids(&response), vec!["a"]);
        assert!(response.has_more);
        assert_eq!(
            response.new_cursor,
            CursorRepresentation::ListForm(vec![ChangeId::new("a").unwrap()])
        );

        let next = pull(&handler, response.new_cursor, 5);
        assert_eq!(ids(&next), vec!["b", "c"]);
        assert_eq!(next.new_cursor, CursorRepresentation::CountForm(3));
    }

    #[test]
    fn list_cursor_without_marker_needs_snapshot() {
        let handler = create_handler(ServerConfig::default());
        handler.handle_submit(change("a", json!({"a": 1}))).unwrap();
        handler.handle_compact().unwrap();

        let stale = pull(
            &handler,
            CursorRepresentation::ListForm(vec![ChangeId::new("a").unwrap()]),
            10,
        );
        assert!(stale.snapshot_needed);

        let with_marker = pull(
            &handler,
            CursorRepresentation::ListForm(vec![ChangeId::compaction_marker(SequenceToken::new(1))]),
            10,
        );
        assert!(!with_marker.snapshot_needed);
        assert_eq!(with_marker.new_cursor, CursorRepresentation::CountForm(2));
    }

    #[test]
    fn compact_if_due_follows_policy() {
        let config = ServerConfig::default().with_compaction(
            crate::compaction::CompactionPolicy::manual().with_max_log_len(3),
        );
        let handler = create_handler(config);
        handler.handle_submit(change("a", json!({}))).unwrap();
        assert!(handler.context().compact_if_due(0).unwrap().is_none());

        handler.handle_submit(change("b", json!({}))).unwrap();
        handler.handle_submit(change("c", json!({}))).unwrap();
        let report = handler.context().compact_if_due(0).unwrap().unwrap();
        assert_eq!(report.folded_count, 3);

        let status = handler.context().status().unwrap();
        assert_eq!(status.log_len, 1);
        assert_eq!(status.snapshot_through, Some(SequenceToken::new(3)));
    }

    #[test]
    fn open_with_data_dir_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::default().with_data_dir(dir.path());

        {
            let handler = RequestHandler::new(Arc::new(HandlerContext::open(config.clone()).unwrap()));
            handler.handle_submit(change("a", json!({"a": 1}))).unwrap();
            handler.handle_compact().unwrap();
            handler.handle_submit(change("b", json!({"b": 2}))).unwrap();
        }

        let handler = RequestHandler::new(Arc::new(HandlerContext::open(config).unwrap()));
        let snapshot = handler.handle_bootstrap().unwrap().snapshot.unwrap();
        assert_eq!(snapshot.compacted_through, SequenceToken::new(1));

        let delta = pull(&handler, CursorRepresentation::CountForm(1), 10);
        assert_eq!(delta.changes.len(), 2);
        assert_eq!(delta.changes[1].id.as_str(), "b");
        assert!(handler.handle_submit(change("a", json!({"a": 1}))).unwrap().duplicated);
    }
}
