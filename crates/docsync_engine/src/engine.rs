//! The client sync engine.
//!
//! The engine owns the local document. Two background tasks write to it:
//!
//! - the submission worker sends local mutations to the server one at a
//!   time, in the order they were applied, retrying each with the same id
//!   until the server accepts it;
//! - the poll loop pulls new records on a fixed interval and merges them.
//!
//! Both go through one async mutex, so the document has a single writer at
//! any time. Local mutations stay in a pending list until their own record
//! is pulled or the server acknowledges them, and are merged again on top of
//! every pulled page and every resync, so an optimistic edit is never rolled
//! back by older remote state. A pending mutation that turns out to sit
//! below the cursor already was merged out of log order; the next pull
//! reloads the snapshot to restore last-writer-wins.

use crate::config::SyncConfig;
use crate::document::{DocumentStore, LocalDocument};
use crate::error::{SyncError, SyncResult};
use crate::state::{EngineState, SyncStats};
use crate::transport::SyncTransport;
use async_trait::async_trait;
use docsync_protocol::{
    ChangeId, CursorRepresentation, DocumentState, IndexMode, NewChange, Payload, PullResponse,
    SequenceToken, SubmitResponse,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Upper bound on pages fetched by one [`SyncEngine::pull`].
const MAX_PAGES_PER_PULL: usize = 64;

/// Upper bound on resyncs triggered within one [`SyncEngine::pull`].
const MAX_RESYNCS_PER_PULL: usize = 2;

/// Result of one [`SyncEngine::pull`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullOutcome {
    /// Pages fetched.
    pub pages: usize,
    /// Records merged into the document.
    pub merged: usize,
    /// Pulled entries skipped because they did not decode.
    pub malformed: usize,
    /// The document was reloaded from a snapshot during this pull.
    pub resynced: bool,
}

/// Read access to a document that changes over time.
///
/// The version channel ticks once per change to the document; it carries
/// no content, readers fetch the current document when they need it.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Returns a copy of the current document.
    async fn current_document(&self) -> DocumentState;

    /// Subscribes to document versions.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// What a page of pulled records did to the document.
enum PageResult {
    Merged(usize),
    /// A compaction marker folded records the client has not merged.
    MarkerAhead(SequenceToken),
}

struct EngineInner {
    config: SyncConfig,
    transport: Arc<dyn SyncTransport>,
    store: Arc<dyn DocumentStore>,
    document: AsyncMutex<LocalDocument>,
    /// Serializes bootstrap, resync and pull.
    sync_lock: AsyncMutex<()>,
    state: RwLock<EngineState>,
    stats: RwLock<SyncStats>,
    index_mode: RwLock<Option<IndexMode>>,
    versions: watch::Sender<u64>,
    submissions: mpsc::UnboundedSender<NewChange>,
    shut_down: AtomicBool,
}

struct EngineTasks {
    shutdown: watch::Sender<bool>,
    poller: JoinHandle<()>,
    submitter: JoinHandle<()>,
}

/// Offline-first client of a docsync server.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    queue: Mutex<Option<mpsc::UnboundedReceiver<NewChange>>>,
    tasks: Mutex<Option<EngineTasks>>,
}

impl SyncEngine {
    /// Creates an engine, loading the saved document if there is one.
    ///
    /// Mutations that were still pending when the document was saved are
    /// queued for submission again. Nothing touches the network until
    /// [`Self::bootstrap`] or [`Self::start`].
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn SyncTransport>,
        store: Arc<dyn DocumentStore>,
    ) -> SyncResult<Self> {
        let document = store.load()?.unwrap_or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        for change in &document.pending {
            tx.send(change.clone()).map_err(|_| SyncError::ShutDown)?;
        }
        if !document.pending.is_empty() {
            info!(
                client = %config.client_id,
                pending = document.pending.len(),
                "requeued unacknowledged mutations"
            );
        }

        let (versions, _) = watch::channel(0);
        let index_mode = config.expected_index_mode;
        let inner = EngineInner {
            config,
            transport,
            store,
            document: AsyncMutex::new(document),
            sync_lock: AsyncMutex::new(()),
            state: RwLock::new(EngineState::Uninitialized),
            stats: RwLock::new(SyncStats::default()),
            index_mode: RwLock::new(index_mode),
            versions,
            submissions: tx,
            shut_down: AtomicBool::new(false),
        };

        Ok(Self {
            inner: Arc::new(inner),
            queue: Mutex::new(Some(rx)),
            tasks: Mutex::new(None),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.inner.state.read()
    }

    /// Returns a copy of the statistics.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }

    /// Index mode reported by the last pull, or the expected one.
    pub fn index_mode(&self) -> Option<IndexMode> {
        *self.inner.index_mode.read()
    }

    /// Starts the submission worker and the poll loop.
    ///
    /// Must be called from within a Tokio runtime. Calling it again is a
    /// no-op.
    pub fn start(&self) {
        let Some(queue) = self.queue.lock().take() else {
            return;
        };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let submitter = tokio::spawn(run_submissions(
            Arc::clone(&self.inner),
            queue,
            shutdown_rx.clone(),
        ));
        let poller = tokio::spawn(run_poller(Arc::clone(&self.inner), shutdown_rx));
        *self.tasks.lock() = Some(EngineTasks {
            shutdown,
            poller,
            submitter,
        });
        info!(client = %self.inner.config.client_id, "sync engine started");
    }

    /// Stops the poll loop and waits for queued submissions to drain.
    ///
    /// Submissions still failing after the configured number of attempts
    /// stay pending in the saved document and are sent again by the next
    /// engine over the same store.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let tasks = self.tasks.lock().take();
        let Some(tasks) = tasks else {
            return;
        };
        let _ = tasks.shutdown.send(true);
        if let Err(e) = tasks.poller.await {
            warn!(error = %e, "poll task failed");
        }
        if let Err(e) = tasks.submitter.await {
            warn!(error = %e, "submission task failed");
        }
        info!(client = %self.inner.config.client_id, "sync engine stopped");
    }

    /// Gives the document its starting point.
    ///
    /// A document that has never merged anything from the server fetches
    /// the current snapshot; a saved document that already has a cursor is
    /// used as is. Runs at most once unless [`Self::clear`] is called.
    pub async fn bootstrap(&self) -> SyncResult<EngineState> {
        self.inner.bootstrap().await
    }

    /// Reloads the document from the server's snapshot.
    pub async fn resync(&self) -> SyncResult<()> {
        let _sync = self.inner.sync_lock.lock().await;
        self.inner.resync_locked("requested").await
    }

    /// Pulls and merges new records.
    pub async fn pull(&self) -> SyncResult<PullOutcome> {
        self.inner.pull().await
    }

    /// Applies a local mutation and queues it for submission.
    ///
    /// The payload is merged into the document and saved before this
    /// returns; the submission happens in the background.
    pub async fn apply_mutation(&self, payload: Payload) -> SyncResult<ChangeId> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShutDown);
        }

        let change = NewChange::new(ChangeId::generate(), payload);
        let id = change.id.clone();
        {
            let mut document = inner.document.lock().await;
            document.apply_local(change.clone());
            inner.persist(&document);
            // Queued under the document lock so the server sees mutations
            // in the order they were applied.
            inner
                .submissions
                .send(change)
                .map_err(|_| SyncError::ShutDown)?;
        }
        inner.stats.write().mutations += 1;
        inner.bump_version();
        debug!(client = %inner.config.client_id, id = %id, "applied local mutation");
        Ok(id)
    }

    /// Returns the value of a top-level key.
    pub async fn read(&self, key: &str) -> Option<Value> {
        self.inner.document.lock().await.get(key).cloned()
    }

    /// Returns a copy of the whole document.
    pub async fn document(&self) -> DocumentState {
        self.inner.document.lock().await.state.clone()
    }

    /// Returns the current cursor.
    pub async fn cursor(&self) -> CursorRepresentation {
        self.inner.document.lock().await.cursor.clone()
    }

    /// Number of mutations not yet acknowledged by the server.
    pub async fn pending_count(&self) -> usize {
        self.inner.document.lock().await.pending.len()
    }

    /// Forgets the merged document and cursor so the next bootstrap fetches
    /// the snapshot again. Pending mutations are kept.
    pub async fn clear(&self) {
        let _sync = self.inner.sync_lock.lock().await;
        {
            let mut document = self.inner.document.lock().await;
            document.state = DocumentState::new();
            document.cursor = CursorRepresentation::beginning();
            document.resync_required = false;
            self.inner.persist(&document);
        }
        *self.inner.state.write() = EngineState::Uninitialized;
        self.inner.bump_version();
    }

    /// Subscribes to document versions.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.versions.subscribe()
    }
}

#[async_trait]
impl DocumentSource for SyncEngine {
    async fn current_document(&self) -> DocumentState {
        self.document().await
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        SyncEngine::subscribe(self)
    }
}

impl EngineInner {
    fn bump_version(&self) {
        self.versions.send_modify(|v| *v += 1);
    }

    fn persist(&self, document: &LocalDocument) {
        if let Err(e) = self.store.save(document) {
            warn!(client = %self.config.client_id, error = %e, "failed to save local document");
            self.stats.write().last_error = Some(e.to_string());
        }
    }

    fn record_error(&self, e: &SyncError) {
        self.stats.write().last_error = Some(e.to_string());
    }

    /// Runs `op` with bounded exponential backoff on retryable errors.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let retry = &self.config.retry;
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    self.stats.write().retries += 1;
                    warn!(
                        client = %self.config.client_id,
                        operation,
                        attempt,
                        error = %e,
                        "transient failure, retrying"
                    );
                    sleep(retry.delay_for_attempt(attempt)).await;
                }
                Err(e) => {
                    self.record_error(&e);
                    return Err(e);
                }
            }
        }
    }

    async fn bootstrap(&self) -> SyncResult<EngineState> {
        let _sync = self.sync_lock.lock().await;
        let state = *self.state.read();
        if state.is_initialized() {
            return Ok(state);
        }

        let has_base = self.document.lock().await.cursor != CursorRepresentation::beginning();
        if has_base {
            debug!(client = %self.config.client_id, "using saved document");
            *self.state.write() = EngineState::Bootstrapped;
            return Ok(EngineState::Bootstrapped);
        }

        self.resync_locked("bootstrap").await?;
        Ok(*self.state.read())
    }

    /// Replaces the document with the server's snapshot. The caller holds
    /// `sync_lock`.
    async fn resync_locked(&self, reason: &'static str) -> SyncResult<()> {
        let snapshot = self
            .with_retry("bootstrap", || self.transport.bootstrap())
            .await?;

        {
            let mut document = self.document.lock().await;
            document.reset_to(snapshot.as_ref());
            self.persist(&document);
            info!(
                client = %self.config.client_id,
                reason,
                cursor = %document.cursor,
                keys = document.state.len(),
                "loaded snapshot"
            );
        }

        {
            let mut state = self.state.write();
            if *state == EngineState::Uninitialized {
                *state = EngineState::Bootstrapped;
            }
        }
        if reason != "bootstrap" {
            self.stats.write().resyncs += 1;
        }
        self.bump_version();
        Ok(())
    }

    async fn pull(&self) -> SyncResult<PullOutcome> {
        let initialized = self.state.read().is_initialized();
        if !initialized {
            self.bootstrap().await?;
        }
        let _sync = self.sync_lock.lock().await;

        let limit = self.config.pull_batch_size;
        let mut outcome = PullOutcome::default();
        let mut resyncs = 0;

        while outcome.pages < MAX_PAGES_PER_PULL {
            let (cursor, repair) = {
                let document = self.document.lock().await;
                (document.cursor.clone(), document.resync_required)
            };
            if repair {
                if resyncs == MAX_RESYNCS_PER_PULL {
                    break;
                }
                resyncs += 1;
                outcome.resynced = true;
                self.resync_locked("pending change merged out of order").await?;
                continue;
            }

            let batch = self
                .with_retry("pull", || self.transport.pull(&cursor, limit))
                .await?;
            outcome.pages += 1;

            if !batch.malformed.is_empty() {
                for bad in &batch.malformed {
                    warn!(
                        client = %self.config.client_id,
                        position = bad.position,
                        id = bad.id.as_deref().unwrap_or("<none>"),
                        reason = %bad.reason,
                        "skipping malformed record"
                    );
                }
                outcome.malformed += batch.malformed.len();
                self.stats.write().malformed_skipped += batch.malformed.len() as u64;
            }

            let response = batch.response;
            let mode_changed = self.observe_index_mode(response.index_mode);
            if response.snapshot_needed || mode_changed {
                if resyncs == MAX_RESYNCS_PER_PULL {
                    break;
                }
                resyncs += 1;
                outcome.resynced = true;
                let reason = if response.snapshot_needed {
                    "snapshot needed"
                } else {
                    "index mode changed"
                };
                self.resync_locked(reason).await?;
                continue;
            }

            let result = {
                let mut document = self.document.lock().await;
                let pending = document.pending.len();
                let result = merge_page(&mut document, &response);
                if let PageResult::Merged(merged) = result {
                    if merged > 0 || document.cursor != cursor || document.pending.len() != pending
                    {
                        self.persist(&document);
                    }
                }
                result
            };

            match result {
                PageResult::Merged(merged) => {
                    outcome.merged += merged;
                    if merged > 0 {
                        self.bump_version();
                    }
                    if !response.has_more {
                        break;
                    }
                }
                PageResult::MarkerAhead(boundary) => {
                    if resyncs == MAX_RESYNCS_PER_PULL {
                        break;
                    }
                    resyncs += 1;
                    outcome.resynced = true;
                    info!(
                        client = %self.config.client_id,
                        boundary = %boundary,
                        cursor = %cursor,
                        "log compacted past cursor"
                    );
                    self.resync_locked("compacted past cursor").await?;
                }
            }
        }

        {
            let mut stats = self.stats.write();
            stats.pulls += 1;
            stats.records_pulled += outcome.merged as u64;
            stats.last_pull_time = Some(Instant::now());
        }
        *self.state.write() = EngineState::Syncing;
        Ok(outcome)
    }

    /// Records the index mode of a response; returns true if it differs
    /// from the previous one.
    fn observe_index_mode(&self, mode: IndexMode) -> bool {
        let previous = self.index_mode.write().replace(mode);
        match previous {
            Some(previous) if previous != mode => {
                info!(
                    client = %self.config.client_id,
                    from = %previous,
                    to = %mode,
                    "store index mode changed"
                );
                true
            }
            _ => false,
        }
    }

    /// Sends one change until the server accepts or rejects it.
    ///
    /// While the engine runs this retries indefinitely. Once shutdown has
    /// begun the attempts are bounded and an unsent change stays pending.
    async fn submit(&self, change: NewChange, shutdown: &mut watch::Receiver<bool>) {
        let retry = &self.config.retry;
        let mut attempt = 0u32;
        loop {
            match self.transport.submit(&change).await {
                Ok(response) => {
                    self.acknowledge(&change, &response).await;
                    return;
                }
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    self.record_error(&e);
                    let draining = *shutdown.borrow() || shutdown.has_changed().is_err();
                    if draining && attempt >= retry.max_attempts {
                        warn!(
                            client = %self.config.client_id,
                            id = %change.id,
                            error = %e,
                            "leaving submission pending at shutdown"
                        );
                        return;
                    }
                    self.stats.write().retries += 1;
                    warn!(
                        client = %self.config.client_id,
                        id = %change.id,
                        attempt,
                        error = %e,
                        "submission failed, retrying"
                    );
                    let delay = retry.delay_for_attempt(attempt);
                    if draining {
                        sleep(delay).await;
                    } else {
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
                Err(e) => {
                    error!(
                        client = %self.config.client_id,
                        id = %change.id,
                        error = %e,
                        "submission rejected, dropping"
                    );
                    self.record_error(&e);
                    let mut document = self.document.lock().await;
                    document.discard(&change.id);
                    self.persist(&document);
                    self.stats.write().rejected += 1;
                    return;
                }
            }
        }
    }

    async fn acknowledge(&self, change: &NewChange, response: &SubmitResponse) {
        {
            let mut document = self.document.lock().await;
            document.acknowledge(&change.id, response.sequence_token);
            if document.resync_required {
                info!(
                    client = %self.config.client_id,
                    id = %change.id,
                    token = %response.sequence_token,
                    "acknowledged change is already behind the cursor"
                );
            }
            self.persist(&document);
        }
        {
            let mut stats = self.stats.write();
            stats.submitted += 1;
            if response.duplicated {
                stats.duplicates += 1;
            }
        }
        debug!(
            client = %self.config.client_id,
            id = %change.id,
            token = %response.sequence_token,
            duplicated = response.duplicated,
            "submission acknowledged"
        );
    }
}

/// Merges one page into the document.
///
/// Records at or below a count cursor are skipped, so overlapping pages
/// never apply a token twice. A compaction marker is harmless when the
/// cursor already covers everything it folded; otherwise the records it
/// folded are gone from the log and the page is abandoned. A pending change
/// whose own record arrives stops being pending: from then on its place in
/// the log decides which value wins. The server's cursor is adopted at the
/// end, which also steps past entries that were set aside as malformed and
/// moves list cursors to count form.
fn merge_page(document: &mut LocalDocument, response: &PullResponse) -> PageResult {
    let mut merged = 0;
    for record in &response.changes {
        if let Some(boundary) = record.compaction_boundary() {
            match &mut document.cursor {
                CursorRepresentation::CountForm(count) if *count >= boundary.as_u64() => {
                    *count = (*count).max(record.sequence_token.as_u64());
                    continue;
                }
                _ => return PageResult::MarkerAhead(boundary),
            }
        }

        let seen = match &mut document.cursor {
            CursorRepresentation::CountForm(count) => {
                let seen = record.sequence_token.as_u64() <= *count;
                if !seen {
                    *count = record.sequence_token.as_u64();
                }
                seen
            }
            CursorRepresentation::ListForm(ids) => {
                let seen = ids.contains(&record.id);
                if !seen {
                    ids.push(record.id.clone());
                }
                seen
            }
        };
        let was_pending = document.settle(&record.id);
        if seen {
            // Already folded in elsewhere, yet still merged locally on top.
            if was_pending {
                document.resync_required = true;
            }
            continue;
        }
        document.apply_remote(record);
        merged += 1;
    }

    document.cursor = response.new_cursor.clone();
    if merged > 0 {
        document.reapply_pending();
    }
    PageResult::Merged(merged)
}

async fn run_submissions(
    inner: Arc<EngineInner>,
    mut queue: mpsc::UnboundedReceiver<NewChange>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        // The notification may already have been consumed while a
        // submission was backing off.
        let stopping = *shutdown.borrow();
        if stopping {
            break;
        }
        let change = tokio::select! {
            biased;
            change = queue.recv() => match change {
                Some(change) => change,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        inner.submit(change, &mut shutdown).await;
    }

    queue.close();
    let mut drained = 0usize;
    while let Ok(change) = queue.try_recv() {
        inner.submit(change, &mut shutdown).await;
        drained += 1;
    }
    if drained > 0 {
        debug!(client = %inner.config.client_id, drained, "drained submission queue");
    }
}

async fn run_poller(inner: Arc<EngineInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(inner.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        // A pull still in flight at shutdown is abandoned.
        let result = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = inner.pull() => result,
        };
        if let Err(e) = result {
            warn!(client = %inner.config.client_id, error = %e, "pull failed");
        }
    }
}
