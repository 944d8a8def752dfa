//! The client's local copy of the shared document.

use crate::error::{SyncError, SyncResult};
use docsync_protocol::{
    merge_into, ChangeId, ChangeRecord, CursorRepresentation, DocumentState, NewChange,
    SequenceToken, Snapshot,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Local document state, cursor and unacknowledged submissions.
///
/// Pending submissions are kept so they can be merged again on top of
/// whatever the server sends back, until their own record shows up in a
/// pulled page or the server acknowledges them. Once a pending change is
/// known to sit below the cursor without having been merged in log order,
/// the document is flagged for a resync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalDocument {
    /// Merged document.
    pub state: DocumentState,
    /// How much of the shared log has been merged.
    pub cursor: CursorRepresentation,
    /// Local mutations not yet acknowledged by the server, oldest first.
    #[serde(default)]
    pub pending: Vec<NewChange>,
    /// A pending change was merged out of log order; reload from the
    /// snapshot before pulling further.
    #[serde(default)]
    pub resync_required: bool,
}

impl LocalDocument {
    /// Creates an empty document positioned at the beginning of the log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the document has no keys.
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Returns the value of a top-level key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    /// Merges a local mutation and queues it as pending.
    pub fn apply_local(&mut self, change: NewChange) {
        merge_into(&mut self.state, &change.payload);
        self.pending.push(change);
    }

    /// Drops a pending mutation once the server has accepted it at `token`.
    ///
    /// If the cursor already covers `token`, the change was merged on top of
    /// records that came after it in the log, so the document is flagged for
    /// a resync. Returns false if it was not pending.
    pub fn acknowledge(&mut self, id: &ChangeId, token: SequenceToken) -> bool {
        if !self.settle(id) {
            return false;
        }
        if self.covers(id, token) {
            self.resync_required = true;
        }
        true
    }

    /// Drops a pending mutation the server refused. The local merge stays.
    pub fn discard(&mut self, id: &ChangeId) -> bool {
        self.settle(id)
    }

    /// Removes `id` from the pending list; returns false if it was absent.
    pub fn settle(&mut self, id: &ChangeId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|change| &change.id != id);
        self.pending.len() != before
    }

    /// Returns true if the cursor is at or past the record `id` at `token`.
    pub fn covers(&self, id: &ChangeId, token: SequenceToken) -> bool {
        match &self.cursor {
            CursorRepresentation::CountForm(count) => token.as_u64() <= *count,
            CursorRepresentation::ListForm(seen) => seen.contains(id),
        }
    }

    /// Merges a record pulled from the server.
    pub fn apply_remote(&mut self, record: &ChangeRecord) {
        if !record.is_marker() {
            merge_into(&mut self.state, &record.payload);
        }
    }

    /// Merges every pending mutation again, oldest first.
    ///
    /// Called after remote records so that local edits the server has not
    /// seen yet keep winning locally.
    pub fn reapply_pending(&mut self) {
        for change in &self.pending {
            merge_into(&mut self.state, &change.payload);
        }
    }

    /// Replaces state and cursor with a snapshot, keeping pending mutations.
    ///
    /// Pending mutations are merged on top; any of them already folded into
    /// the snapshot is caught when the server acknowledges it.
    pub fn reset_to(&mut self, snapshot: Option<&Snapshot>) {
        match snapshot {
            Some(snapshot) => {
                self.state = snapshot.state.clone();
                self.cursor = CursorRepresentation::after(snapshot.compacted_through);
            }
            None => {
                self.state = DocumentState::new();
                self.cursor = CursorRepresentation::beginning();
            }
        }
        self.resync_required = false;
        self.reapply_pending();
    }
}

/// Durable storage for the local document.
pub trait DocumentStore: Send + Sync {
    /// Loads the last saved document, if any.
    fn load(&self) -> SyncResult<Option<LocalDocument>>;

    /// Replaces the saved document.
    fn save(&self, document: &LocalDocument) -> SyncResult<()>;
}

/// Document store that keeps the last saved copy in memory.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    saved: Mutex<Option<LocalDocument>>,
    saves: Mutex<u64>,
}

impl MemoryDocumentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds `document`.
    pub fn with_document(document: LocalDocument) -> Self {
        Self {
            saved: Mutex::new(Some(document)),
            saves: Mutex::new(0),
        }
    }

    /// Returns the last saved document.
    pub fn saved(&self) -> Option<LocalDocument> {
        self.saved.lock().clone()
    }

    /// Returns how many times [`DocumentStore::save`] was called.
    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn load(&self) -> SyncResult<Option<LocalDocument>> {
        Ok(self.saved.lock().clone())
    }

    fn save(&self, document: &LocalDocument) -> SyncResult<()> {
        *self.saved.lock() = Some(document.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

/// Document store backed by a JSON file, replaced atomically on save.
#[derive(Debug)]
pub struct FileDocumentStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileDocumentStore {
    /// Creates a store writing to `path`. The file is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }
}

impl DocumentStore for FileDocumentStore {
    fn load(&self) -> SyncResult<Option<LocalDocument>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(persistence(&self.path, e)),
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        let document = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Persistence(format!("{}: {e}", self.path.display())))?;
        Ok(Some(document))
    }

    fn save(&self, document: &LocalDocument) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        let bytes = serde_json::to_vec(document)?;
        let temp = self.temp_path();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| persistence(parent, e))?;
            }
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
            .map_err(|e| persistence(&temp, e))?;
        file.write_all(&bytes).map_err(|e| persistence(&temp, e))?;
        file.sync_all().map_err(|e| persistence(&temp, e))?;
        drop(file);

        fs::rename(&temp, &self.path).map_err(|e| persistence(&self.path, e))?;
        self.sync_parent()
    }
}

impl FileDocumentStore {
    #[cfg(unix)]
    fn sync_parent(&self) -> SyncResult<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => File::open(parent)
                .and_then(|dir| dir.sync_all())
                .map_err(|e| persistence(parent, e)),
            _ => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn sync_parent(&self) -> SyncResult<()> {
        Ok(())
    }
}

fn persistence(path: &Path, e: std::io::Error) -> SyncError {
    SyncError::Persistence(format!("{}: {e}", path.display()))
}
