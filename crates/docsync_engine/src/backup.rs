//! Backups of the whole document.
//!
//! Two collaborators receive backups:
//!
//! - a [`BlobStore`] holding named blobs, used for manual named backups and
//!   for the debounced automatic one;
//! - a [`FileHost`] holding base64 files with revisions, written through a
//!   [`RepositoryMirror`] that never overwrites a revision it has not seen.
//!
//! [`BackupScheduler`] watches document versions and coalesces bursts of
//! changes into one flush per quiet interval.

use crate::engine::DocumentSource;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use docsync_protocol::{unix_millis, DocumentState};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Content type of document backups.
pub const BACKUP_CONTENT_TYPE: &str = "application/json";

/// Listing entry of a [`BlobStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// Blob name.
    pub name: String,
    /// Unix milliseconds of the last upload.
    pub updated_at: u64,
    /// Size in bytes.
    pub size: u64,
}

/// Named blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Creates or replaces a blob.
    async fn upload(&self, name: &str, bytes: Vec<u8>, content_type: &str) -> SyncResult<()>;

    /// Reads a blob; [`SyncError::NotFound`] if it does not exist.
    async fn download(&self, name: &str) -> SyncResult<Vec<u8>>;

    /// Deletes a blob; [`SyncError::NotFound`] if it does not exist.
    async fn delete(&self, name: &str) -> SyncResult<()>;

    /// Lists blobs, oldest update first.
    async fn list(&self) -> SyncResult<Vec<BlobInfo>>;
}

fn validate_name(name: &str) -> SyncResult<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.len() > 255
    {
        return Err(SyncError::InvalidInput(format!("bad blob name {name:?}")));
    }
    Ok(())
}

fn sort_listing(listing: &mut [BlobInfo]) {
    listing.sort_by(|a, b| {
        a.updated_at
            .cmp(&b.updated_at)
            .then_with(|| a.name.cmp(&b.name))
    });
}

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Vec<u8>,
    content_type: String,
    updated_at: u64,
}

/// In-memory blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, StoredBlob>>,
    last_update: AtomicU64,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the content type a blob was uploaded with.
    pub fn content_type(&self, name: &str) -> Option<String> {
        self.blobs.read().get(name).map(|b| b.content_type.clone())
    }

    /// Strictly increasing upload time, so listing order matches upload
    /// order even within one millisecond.
    fn next_update_time(&self) -> u64 {
        let now = unix_millis();
        let mut last = self.last_update.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .last_update
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, name: &str, bytes: Vec<u8>, content_type: &str) -> SyncResult<()> {
        validate_name(name)?;
        let blob = StoredBlob {
            bytes,
            content_type: content_type.to_owned(),
            updated_at: self.next_update_time(),
        };
        self.blobs.write().insert(name.to_owned(), blob);
        Ok(())
    }

    async fn download(&self, name: &str) -> SyncResult<Vec<u8>> {
        self.blobs
            .read()
            .get(name)
            .map(|b| b.bytes.clone())
            .ok_or_else(|| SyncError::NotFound(name.to_owned()))
    }

    async fn delete(&self, name: &str) -> SyncResult<()> {
        self.blobs
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SyncError::NotFound(name.to_owned()))
    }

    async fn list(&self) -> SyncResult<Vec<BlobInfo>> {
        let mut listing: Vec<BlobInfo> = self
            .blobs
            .read()
            .iter()
            .map(|(name, blob)| BlobInfo {
                name: name.clone(),
                updated_at: blob.updated_at,
                size: blob.bytes.len() as u64,
            })
            .collect();
        sort_listing(&mut listing);
        Ok(listing)
    }
}

/// Blob store keeping one file per blob in a directory.
///
/// Only the bytes are kept; the content type is not stored.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> SyncResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| backup_io(&root, e))?;
        Ok(Self { root })
    }

    /// Returns the directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, name: &str) -> SyncResult<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl BlobStore for DirBlobStore {
    async fn upload(&self, name: &str, bytes: Vec<u8>, _content_type: &str) -> SyncResult<()> {
        let path = self.blob_path(name)?;
        let temp = self.root.join(format!(".{name}.tmp"));
        tokio::fs::write(&temp, &bytes)
            .await
            .map_err(|e| backup_io(&temp, e))?;
        tokio::fs::rename(&temp, &path)
            .await
            .map_err(|e| backup_io(&path, e))
    }

    async fn download(&self, name: &str) -> SyncResult<Vec<u8>> {
        let path = self.blob_path(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SyncError::NotFound(name.to_owned()))
            }
            Err(e) => Err(backup_io(&path, e)),
        }
    }

    async fn delete(&self, name: &str) -> SyncResult<()> {
        let path = self.blob_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SyncError::NotFound(name.to_owned()))
            }
            Err(e) => Err(backup_io(&path, e)),
        }
    }

    async fn list(&self) -> SyncResult<Vec<BlobInfo>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| backup_io(&self.root, e))?;
        let mut listing = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| backup_io(&self.root, e))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| backup_io(&entry.path(), e))?;
            if !metadata.is_file() {
                continue;
            }
            let updated_at = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_millis() as u64);
            listing.push(BlobInfo {
                name,
                updated_at,
                size: metadata.len(),
            });
        }

        sort_listing(&mut listing);
        Ok(listing)
    }
}

fn backup_io(path: &Path, e: std::io::Error) -> SyncError {
    SyncError::Backup(format!("{}: {e}", path.display()))
}

/// Manual named backups of the document in a [`BlobStore`].
#[derive(Clone)]
pub struct BackupCatalog {
    store: Arc<dyn BlobStore>,
}

impl BackupCatalog {
    /// Creates a catalog over `store`.
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Saves `document` under `name`, replacing an older backup.
    pub async fn save(&self, name: &str, document: &DocumentState) -> SyncResult<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        self.store.upload(name, bytes, BACKUP_CONTENT_TYPE).await?;
        info!(name, keys = document.len(), "saved backup");
        Ok(())
    }

    /// Loads the backup named `name`.
    pub async fn load(&self, name: &str) -> SyncResult<DocumentState> {
        let bytes = self.store.download(name).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Backup(format!("backup {name:?} is not a document: {e}")))
    }

    /// Lists backups, oldest first.
    pub async fn list(&self) -> SyncResult<Vec<BlobInfo>> {
        self.store.list().await
    }

    /// Deletes the backup named `name`.
    pub async fn delete(&self, name: &str) -> SyncResult<()> {
        self.store.delete(name).await
    }

    /// Returns a target that writes every flush to `name`.
    pub fn target(&self, name: impl Into<String>) -> NamedBackup {
        NamedBackup {
            catalog: self.clone(),
            name: name.into(),
        }
    }
}

/// Destination of a scheduled backup flush.
#[async_trait]
pub trait BackupTarget: Send + Sync {
    /// Writes the whole document.
    async fn write_backup(&self, document: &DocumentState) -> SyncResult<()>;
}

/// A backup target writing to one fixed name in a [`BackupCatalog`].
#[derive(Clone)]
pub struct NamedBackup {
    catalog: BackupCatalog,
    name: String,
}

#[async_trait]
impl BackupTarget for NamedBackup {
    async fn write_backup(&self, document: &DocumentState) -> SyncResult<()> {
        self.catalog.save(&self.name, document).await
    }
}

/// A file stored on a [`FileHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedFile {
    /// Base64 of the file contents.
    pub content: String,
    /// Opaque revision of this version of the file.
    pub revision: String,
}

impl HostedFile {
    /// Decodes the contents.
    pub fn decode(&self) -> SyncResult<Vec<u8>> {
        STANDARD
            .decode(&self.content)
            .map_err(|e| SyncError::Backup(format!("bad base64 content: {e}")))
    }
}

/// File hosting with optimistic revisions.
#[async_trait]
pub trait FileHost: Send + Sync {
    /// Reads a file, `None` if it does not exist.
    async fn get_file(&self, path: &str) -> SyncResult<Option<HostedFile>>;

    /// Writes a file and returns its new revision.
    ///
    /// `revision` must be the current revision, or `None` when creating the
    /// file; anything else fails with [`SyncError::RevisionConflict`].
    async fn put_file(
        &self,
        path: &str,
        content: &str,
        revision: Option<&str>,
    ) -> SyncResult<String>;
}

/// In-memory file host.
#[derive(Debug, Default)]
pub struct MemoryFileHost {
    files: RwLock<HashMap<String, HostedFile>>,
    next_revision: AtomicU64,
}

impl MemoryFileHost {
    /// Creates an empty host.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileHost for MemoryFileHost {
    async fn get_file(&self, path: &str) -> SyncResult<Option<HostedFile>> {
        Ok(self.files.read().get(path).cloned())
    }

    async fn put_file(
        &self,
        path: &str,
        content: &str,
        revision: Option<&str>,
    ) -> SyncResult<String> {
        STANDARD
            .decode(content)
            .map_err(|e| SyncError::InvalidInput(format!("content is not base64: {e}")))?;

        let mut files = self.files.write();
        let current = files.get(path).map(|f| f.revision.as_str());
        if current != revision {
            return Err(SyncError::RevisionConflict {
                path: path.to_owned(),
                expected: revision.map(str::to_owned),
                current: current.map(str::to_owned),
            });
        }

        let revision = (self.next_revision.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        files.insert(
            path.to_owned(),
            HostedFile {
                content: content.to_owned(),
                revision: revision.clone(),
            },
        );
        Ok(revision)
    }
}

/// Mirrors the document to one file on a [`FileHost`].
#[derive(Clone)]
pub struct RepositoryMirror {
    host: Arc<dyn FileHost>,
    path: String,
}

impl RepositoryMirror {
    /// Creates a mirror writing to `path`.
    pub fn new(host: Arc<dyn FileHost>, path: impl Into<String>) -> Self {
        Self {
            host,
            path: path.into(),
        }
    }

    /// Returns the hosted path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Writes `document` over the current revision and returns the new one.
    ///
    /// If another writer replaces the file between the read and the write,
    /// this fails with [`SyncError::RevisionConflict`] and the other
    /// writer's version stays in place.
    pub async fn push(&self, document: &DocumentState) -> SyncResult<String> {
        let current = self.host.get_file(&self.path).await?;
        let content = STANDARD.encode(serde_json::to_vec_pretty(document)?);
        let revision = self
            .host
            .put_file(
                &self.path,
                &content,
                current.as_ref().map(|f| f.revision.as_str()),
            )
            .await?;
        debug!(path = %self.path, revision = %revision, "mirrored document");
        Ok(revision)
    }

    /// Reads the mirrored document, `None` if it was never written.
    pub async fn fetch(&self) -> SyncResult<Option<DocumentState>> {
        let Some(file) = self.host.get_file(&self.path).await? else {
            return Ok(None);
        };
        let document = serde_json::from_slice(&file.decode()?)
            .map_err(|e| SyncError::Backup(format!("{} is not a document: {e}", self.path)))?;
        Ok(Some(document))
    }
}

#[async_trait]
impl BackupTarget for RepositoryMirror {
    async fn write_backup(&self, document: &DocumentState) -> SyncResult<()> {
        self.push(document).await.map(|_| ())
    }
}

/// Debounced background flush of the document to a [`BackupTarget`].
///
/// Every new document version pushes the flush deadline out to one
/// debounce interval from now; the flush happens once the document has
/// been quiet for that long. Shutting down flushes a pending change
/// immediately.
pub struct BackupScheduler {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    flushes: Arc<AtomicU64>,
}

impl BackupScheduler {
    /// Starts watching `source`.
    pub fn spawn(
        source: Arc<dyn DocumentSource>,
        target: Arc<dyn BackupTarget>,
        debounce: Duration,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let flushes = Arc::new(AtomicU64::new(0));
        let versions = source.subscribe();
        let task = tokio::spawn(run_scheduler(
            source,
            target,
            debounce,
            versions,
            shutdown_rx,
            Arc::clone(&flushes),
        ));
        Self {
            shutdown,
            task,
            flushes,
        }
    }

    /// Number of successful flushes so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Stops the scheduler, flushing a pending change first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "backup task failed");
        }
    }
}

async fn run_scheduler(
    source: Arc<dyn DocumentSource>,
    target: Arc<dyn BackupTarget>,
    debounce: Duration,
    mut versions: watch::Receiver<u64>,
    mut shutdown: watch::Receiver<bool>,
    flushes: Arc<AtomicU64>,
) {
    // Set after a failed flush; the next one is due without a new change.
    let mut unsaved = false;
    loop {
        if !unsaved {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                changed = versions.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        let mut deadline = Instant::now() + debounce;
        let stop = loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break true,
                changed = versions.changed() => {
                    if changed.is_err() {
                        break true;
                    }
                    deadline = deadline.max(Instant::now() + debounce);
                }
                _ = sleep_until(deadline) => break false,
            }
        };

        let document = source.current_document().await;
        match target.write_backup(&document).await {
            Ok(()) => {
                unsaved = false;
                flushes.fetch_add(1, Ordering::SeqCst);
                debug!(keys = document.len(), "flushed backup");
            }
            Err(e) => {
                unsaved = true;
                warn!(error = %e, retry_in = ?debounce, "backup flush failed");
            }
        }

        if stop {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::Payload;
    use serde_json::{json, Value};
    use tempfile::tempdir;
    use tokio::time::sleep;

    fn doc(value: Value) -> DocumentState {
        value.as_object().cloned().unwrap()
    }

    /// A document whose versions the test bumps by hand.
    struct TestSource {
        document: RwLock<DocumentState>,
        versions: watch::Sender<u64>,
    }

    impl TestSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                document: RwLock::new(DocumentState::new()),
                versions: watch::channel(0).0,
            })
        }

        fn set(&self, key: &str, value: Value) {
            let mut payload = Payload::new();
            payload.insert(key.to_owned(), value);
            docsync_protocol::merge_into(&mut self.document.write(), &payload);
            self.versions.send_modify(|v| *v += 1);
        }
    }

    #[async_trait]
    impl DocumentSource for TestSource {
        async fn current_document(&self) -> DocumentState {
            self.document.read().clone()
        }

        fn subscribe(&self) -> watch::Receiver<u64> {
            self.versions.subscribe()
        }
    }

    #[tokio::test]
    async fn memory_blob_store_lists_in_upload_order() {
        let store = MemoryBlobStore::new();
        store.upload("b", b"2".to_vec(), "text/plain").await.unwrap();
        store.upload("a", b"1".to_vec(), "text/plain").await.unwrap();
        store.upload("b", b"22".to_vec(), "text/plain").await.unwrap();

        let names: Vec<_> = store.list().await.unwrap().into_iter().map(|b| b.name).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(store.download("b").await.unwrap(), b"22");
        assert_eq!(store.content_type("a").as_deref(), Some("text/plain"));

        store.delete("a").await.unwrap();
        assert!(matches!(
            store.download("a").await,
            Err(SyncError::NotFound(_))
        ));
        assert!(matches!(store.delete("a").await, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn blob_names_are_validated() {
        let store = MemoryBlobStore::new();
        for name in ["", ".hidden", "a/b", "..", "a\\b"] {
            assert!(matches!(
                store.upload(name, Vec::new(), "x").await,
                Err(SyncError::InvalidInput(_))
            ));
        }
    }

    #[tokio::test]
    async fn dir_blob_store_round_trips() {
        let dir = tempdir().unwrap();
        let store = DirBlobStore::open(dir.path().join("backups")).await.unwrap();

        store.upload("first", b"one".to_vec(), "x").await.unwrap();
        store.upload("second", b"two".to_vec(), "x").await.unwrap();

        assert_eq!(store.download("first").await.unwrap(), b"one");
        let listing = store.list().await.unwrap();
        assert_eq!(listing.len(), 2);
        assert!(listing.iter().any(|b| b.name == "second" && b.size == 3));

        store.delete("first").await.unwrap();
        assert!(matches!(
            store.download("first").await,
            Err(SyncError::NotFound(_))
        ));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn catalog_saves_and_loads_named_backups() {
        let catalog = BackupCatalog::new(Arc::new(MemoryBlobStore::new()));
        catalog
            .save("before-import", &doc(json!({"balance": 100})))
            .await
            .unwrap();
        catalog
            .save("after-import", &doc(json!({"balance": 250})))
            .await
            .unwrap();

        assert_eq!(
            catalog.load("before-import").await.unwrap(),
            doc(json!({"balance": 100}))
        );
        let names: Vec<_> = catalog
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, ["before-import", "after-import"]);

        catalog.delete("before-import").await.unwrap();
        assert!(catalog.load("before-import").await.is_err());
    }

    #[tokio::test]
    async fn file_host_rejects_stale_revisions() {
        let host = MemoryFileHost::new();
        let content = STANDARD.encode("v1");

        let r1 = host.put_file("doc.json", &content, None).await.unwrap();
        let r2 = host
            .put_file("doc.json", &STANDARD.encode("v2"), Some(&r1))
            .await
            .unwrap();
        assert_ne!(r1, r2);

        let err = host
            .put_file("doc.json", &STANDARD.encode("v3"), Some(&r1))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RevisionConflict { .. }));

        let err = host.put_file("doc.json", &content, None).await.unwrap_err();
        assert!(matches!(err, SyncError::RevisionConflict { .. }));

        let file = host.get_file("doc.json").await.unwrap().unwrap();
        assert_eq!(file.revision, r2);
        assert_eq!(file.decode().unwrap(), b"v2");
    }

    #[tokio::test]
    async fn file_host_requires_base64() {
        let host = MemoryFileHost::new();
        let err = host.put_file("x", "not base64!", None).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn mirror_pushes_over_current_revision() {
        let host = Arc::new(MemoryFileHost::new());
        let mirror = RepositoryMirror::new(host.clone(), "state/doc.json");
        assert!(mirror.fetch().await.unwrap().is_none());

        mirror.push(&doc(json!({"a": 1}))).await.unwrap();
        mirror.push(&doc(json!({"a": 2}))).await.unwrap();

        assert_eq!(mirror.fetch().await.unwrap(), Some(doc(json!({"a": 2}))));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_changes_flushes_once() {
        let source = TestSource::new();
        let store = Arc::new(MemoryBlobStore::new());
        let catalog = BackupCatalog::new(store.clone());
        let scheduler = BackupScheduler::spawn(
            source.clone(),
            Arc::new(catalog.target("auto")),
            Duration::from_secs(1),
        );

        for i in 0..5 {
            source.set("n", json!(i));
            sleep(Duration::from_millis(300)).await;
        }
        assert_eq!(scheduler.flush_count(), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(scheduler.flush_count(), 1);
        assert_eq!(catalog.load("auto").await.unwrap(), doc(json!({"n": 4})));

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_periods_flush_separately() {
        let source = TestSource::new();
        let scheduler = BackupScheduler::spawn(
            source.clone(),
            Arc::new(BackupCatalog::new(Arc::new(MemoryBlobStore::new())).target("auto")),
            Duration::from_millis(500),
        );

        source.set("a", json!(1));
        sleep(Duration::from_secs(1)).await;
        source.set("a", json!(2));
        sleep(Duration::from_secs(1)).await;

        assert_eq!(scheduler.flush_count(), 2);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_changes_no_flush() {
        let source = TestSource::new();
        let scheduler = BackupScheduler::spawn(
            source.clone(),
            Arc::new(BackupCatalog::new(Arc::new(MemoryBlobStore::new())).target("auto")),
            Duration::from_millis(100),
        );

        sleep(Duration::from_secs(5)).await;
        assert_eq!(scheduler.flush_count(), 0);
        scheduler.shutdown().await;
    }

    /// Fails the first `failures` writes, then records the document.
    struct FlakyTarget {
        failures: AtomicU64,
        written: RwLock<Option<DocumentState>>,
    }

    #[async_trait]
    impl BackupTarget for FlakyTarget {
        async fn write_backup(&self, document: &DocumentState) -> SyncResult<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(SyncError::Backup("store unavailable".into()));
            }
            *self.written.write() = Some(document.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_retries_without_new_changes() {
        let source = TestSource::new();
        let target = Arc::new(FlakyTarget {
            failures: AtomicU64::new(2),
            written: RwLock::new(None),
        });
        let scheduler =
            BackupScheduler::spawn(source.clone(), target.clone(), Duration::from_millis(500));

        source.set("last", json!("edit"));
        sleep(Duration::from_millis(700)).await;
        assert_eq!(scheduler.flush_count(), 0);
        assert!(target.written.read().is_none());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(scheduler.flush_count(), 1);
        assert_eq!(*target.written.read(), Some(doc(json!({"last": "edit"}))));

        // Back to idle once saved.
        sleep(Duration::from_secs(5)).await;
        assert_eq!(scheduler.flush_count(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_change() {
        let source = TestSource::new();
        let host = Arc::new(MemoryFileHost::new());
        let mirror = RepositoryMirror::new(host, "doc.json");
        let scheduler = BackupScheduler::spawn(
            source.clone(),
            Arc::new(mirror.clone()),
            Duration::from_secs(60),
        );

        source.set("draft", json!("unsaved"));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.flush_count(), 0);

        scheduler.shutdown().await;
        assert_eq!(
            mirror.fetch().await.unwrap(),
            Some(doc(json!({"draft": "unsaved"})))
        );
    }
}
