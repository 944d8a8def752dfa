//! Data directory management.
//!
//! A durable server keeps everything under one directory:
//!
//! ```text
//! <data_dir>/
//! ├─ LOCK            # Advisory lock for single-process access
//! ├─ meta.json       # Store metadata (format version, index mode)
//! ├─ changes.log     # Change log frames
//! └─ snapshot.json   # Latest compacted snapshot
//! ```

use crate::error::{ServerError, ServerResult};
use docsync_protocol::IndexMode;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const META_FILE: &str = "meta.json";
const META_TEMP: &str = "meta.json.tmp";
const CHANGES_FILE: &str = "changes.log";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Persisted store metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreMeta {
    /// On-disk format version.
    pub format_version: u32,
    /// Index representation published by the change store.
    pub index_mode: IndexMode,
}

/// An opened, exclusively locked data directory.
#[derive(Debug)]
pub struct DataDir {
    path: PathBuf,
    _lock_file: File,
}

impl DataDir {
    /// Opens or creates a data directory and takes its lock.
    ///
    /// Fails with [`ServerError::DirectoryLocked`] if another process has
    /// it open.
    pub fn open(path: &Path) -> ServerResult<Self> {
        fs::create_dir_all(path)?;
        if !path.is_dir() {
            return Err(ServerError::Config(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(ServerError::DirectoryLocked(path.display().to_string()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the change log.
    pub fn changes_path(&self) -> PathBuf {
        self.path.join(CHANGES_FILE)
    }

    /// Path of the snapshot file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_FILE)
    }

    /// Loads the metadata, or `None` for a new directory.
    pub fn load_meta(&self) -> ServerResult<Option<StoreMeta>> {
        let bytes = match fs::read(self.path.join(META_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: StoreMeta = serde_json::from_slice(&bytes)?;
        if meta.format_version > FORMAT_VERSION {
            return Err(ServerError::Config(format!(
                "data directory format {} is newer than supported {}",
                meta.format_version, FORMAT_VERSION
            )));
        }
        Ok(Some(meta))
    }

    /// Loads the metadata, writing `default_mode` for a new directory.
    pub fn load_or_init_meta(&self, default_mode: IndexMode) -> ServerResult<StoreMeta> {
        if let Some(meta) = self.load_meta()? {
            return Ok(meta);
        }
        let meta = StoreMeta {
            format_version: FORMAT_VERSION,
            index_mode: default_mode,
        };
        self.save_meta(&meta)?;
        Ok(meta)
    }

    /// Saves the metadata with write-then-rename.
    pub fn save_meta(&self, meta: &StoreMeta) -> ServerResult<()> {
        let temp_path = self.path.join(META_TEMP);
        let data = serde_json::to_vec_pretty(meta)?;

        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.path.join(META_FILE))?;
        self.sync_directory()
    }

    /// Switches the published index representation.
    ///
    /// Returns the previous mode. Records are untouched; only how the log
    /// is advertised to clients changes.
    pub fn set_index_mode(&self, mode: IndexMode) -> ServerResult<IndexMode> {
        let mut meta = self.load_or_init_meta(mode)?;
        let previous = meta.index_mode;
        if previous != mode {
            meta.index_mode = mode;
            self.save_meta(&meta)?;
        }
        Ok(previous)
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> ServerResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> ServerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let first = DataDir::open(dir.path()).unwrap();
        let second = DataDir::open(dir.path());
        assert!(matches!(second, Err(ServerError::DirectoryLocked(_))));

        drop(first);
        assert!(DataDir::open(dir.path()).is_ok());
    }

    #[test]
    fn meta_is_initialised_once() {
        let dir = tempdir().unwrap();
        let data = DataDir::open(dir.path()).unwrap();
        assert!(data.load_meta().unwrap().is_none());

        let meta = data.load_or_init_meta(IndexMode::Ids).unwrap();
        assert_eq!(meta.index_mode, IndexMode::Ids);

        let again = data.load_or_init_meta(IndexMode::Counter).unwrap();
        assert_eq!(again.index_mode, IndexMode::Ids);
    }

    #[test]
    fn index_mode_migration() {
        let dir = tempdir().unwrap();
        let data = DataDir::open(dir.path()).unwrap();
        data.load_or_init_meta(IndexMode::Ids).unwrap();

        assert_eq!(data.set_index_mode(IndexMode::Counter).unwrap(), IndexMode::Ids);
        assert_eq!(data.load_meta().unwrap().unwrap().index_mode, IndexMode::Counter);
        assert_eq!(data.set_index_mode(IndexMode::Counter).unwrap(), IndexMode::Counter);
    }

    #[test]
    fn newer_format_is_rejected() {
        let dir = tempdir().unwrap();
        let data = DataDir::open(dir.path()).unwrap();
        data.save_meta(&StoreMeta {
            format_version: FORMAT_VERSION + 1,
            index_mode: IndexMode::Ids,
        })
        .unwrap();
        assert!(data.load_meta().is_err());
    }
}
