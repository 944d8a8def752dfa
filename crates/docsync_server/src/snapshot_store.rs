//! Single-slot snapshot storage.

use crate::error::ServerResult;
use docsync_protocol::Snapshot;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Holds the most recent snapshot.
///
/// `put` replaces the whole value at once; readers see either the previous
/// snapshot or the new one, never a mix.
pub trait SnapshotStore: Send + Sync {
    /// Returns the current snapshot, if any compaction has completed.
    fn get(&self) -> ServerResult<Option<Snapshot>>;

    /// Atomically replaces the current snapshot.
    fn put(&self, snapshot: &Snapshot) -> ServerResult<()>;
}

/// A snapshot store kept in memory.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    slot: RwLock<Option<Snapshot>>,
}

impl MemorySnapshotStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn get(&self) -> ServerResult<Option<Snapshot>> {
        Ok(self.slot.read().clone())
    }

    fn put(&self, snapshot: &Snapshot) -> ServerResult<()> {
        *self.slot.write() = Some(snapshot.clone());
        Ok(())
    }
}

/// A snapshot store backed by one JSON file.
///
/// Writes go to a temporary file which is synced and then renamed over the
/// snapshot, followed by a sync of the directory.
#[derive(Debug)]
pub struct FileSnapshotStore {
    path: PathBuf,
    temp_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSnapshotStore {
    /// Uses the snapshot file at `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let temp_path = path.with_extension("json.tmp");
        Self {
            path,
            temp_path,
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn sync_parent(&self) -> ServerResult<()> {
        if let Some(parent) = self.path.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_parent(&self) -> ServerResult<()> {
        Ok(())
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn get(&self) -> ServerResult<Option<Snapshot>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn put(&self, snapshot: &Snapshot) -> ServerResult<()> {
        let _writer = self.write_lock.lock();
        let data = serde_json::to_vec(snapshot)?;

        let mut file = File::create(&self.temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.temp_path, &self.path)?;
        self.sync_parent()
    }
}
