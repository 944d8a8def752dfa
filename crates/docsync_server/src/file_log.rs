//! Durable change store on top of checksummed frame logs.
//!
//! Every record is one CBOR-encoded frame in the change log. Accepted ids
//! are also written to a claims log next to it, which outlives compaction
//! so that a retry of an already folded change is still recognised after a
//! restart. Both logs are replayed into memory on open.

use crate::change_store::{existing_token, AppendOutcome, ChangeStore, LogState};
use crate::error::{ServerError, ServerResult};
use crate::idempotency::IdempotencyGuard;
use docsync_protocol::{
    unix_millis, ChangeId, ChangeRecord, IndexMode, LogIndex, NewChange, SequenceToken,
};
use docsync_storage::{FileBackend, FrameLog};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One accepted id as kept in the claims log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClaimEntry {
    id: ChangeId,
    token: SequenceToken,
    claimed_at: u64,
}

struct FileLog {
    frames: FrameLog<FileBackend>,
    claims: FrameLog<FileBackend>,
    state: LogState,
}

impl FileLog {
    fn write(&mut self, record: &ChangeRecord) -> ServerResult<()> {
        let bytes = encode(record)?;
        self.frames.append(&bytes)?;
        self.frames.sync()?;
        Ok(())
    }

    fn write_claim(&mut self, entry: &ClaimEntry) -> ServerResult<()> {
        let bytes = encode(entry)?;
        self.claims.append(&bytes)?;
        self.claims.sync()?;
        Ok(())
    }
}

/// A change store persisted to a single log file.
pub struct FileChangeStore {
    path: PathBuf,
    inner: RwLock<FileLog>,
    guard: IdempotencyGuard,
    mode: IndexMode,
}

impl FileChangeStore {
    /// Opens or creates the log at `path`.
    ///
    /// `floor` is the boundary of the current snapshot. If a compaction
    /// stopped between truncating the log and writing its marker, the token
    /// counter resumes above the floor instead of restarting.
    pub fn open(
        path: &Path,
        mode: IndexMode,
        idempotency_ttl: Option<Duration>,
        floor: SequenceToken,
    ) -> ServerResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        let frames = FrameLog::open(backend)?;

        let mut records = Vec::with_capacity(frames.len());
        let mut skipped = 0usize;
        for frame in frames.iter() {
            let decoded = frame
                .map_err(ServerError::from)
                .and_then(|frame| decode::<ChangeRecord>(&frame.data));
            match decoded {
                Ok(record) => records.push(record),
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, "skipping unreadable change record");
                }
            }
        }

        let guard = IdempotencyGuard::with_ttl(idempotency_ttl);
        let claims = open_claims(&claims_path(path), &guard, idempotency_ttl)?;
        for record in records.iter().filter(|r| !r.is_marker()) {
            if guard.claim(&record.id) {
                guard.assign(&record.id, record.sequence_token);
            }
        }

        let state = LogState::from_records(records, floor);
        info!(
            path = %path.display(),
            records = state.records().len(),
            skipped,
            latest = %state.latest(),
            "opened change log"
        );

        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(FileLog {
                frames,
                claims,
                state,
            }),
            guard,
            mode,
        })
    }

    /// Returns the path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChangeStore for FileChangeStore {
    fn append(&self, change: NewChange) -> ServerResult<AppendOutcome> {
        change.id.validate()?;
        let mut log = self.inner.write();

        if !self.guard.claim(&change.id) {
            debug!(id = %change.id, "duplicate submission");
            let token = existing_token(&self.guard, &log.state, &change.id);
            return Ok(AppendOutcome {
                token,
                duplicated: true,
            });
        }

        let token = log.state.next_token();
        let record = ChangeRecord::accepted(change, token, unix_millis());
        if let Err(e) = log.write(&record) {
            self.guard.release(&record.id);
            return Err(e);
        }

        self.guard.assign(&record.id, token);
        let entry = ClaimEntry {
            id: record.id.clone(),
            token,
            claimed_at: record.inserted_at,
        };
        log.state.push(record);
        if let Err(e) = log.write_claim(&entry) {
            // The record itself is durable; its claim is rebuilt from the
            // change log on open for as long as the record is not compacted.
            warn!(id = %entry.id, error = %e, "failed to persist idempotency claim");
        }
        Ok(AppendOutcome {
            token,
            duplicated: false,
        })
    }

    fn read_range(
        &self,
        from_exclusive: SequenceToken,
        to_inclusive: SequenceToken,
        limit: usize,
    ) -> ServerResult<Vec<ChangeRecord>> {
        Ok(self
            .inner
            .read()
            .state
            .range(from_exclusive, to_inclusive, limit))
    }

    fn get(&self, id: &ChangeId) -> ServerResult<Option<ChangeRecord>> {
        let hint = self.guard.token_of(id);
        Ok(self.inner.read().state.find(id, hint).cloned())
    }

    fn clear(&self, compacted_through: SequenceToken) -> ServerResult<ChangeRecord> {
        let mut log = self.inner.write();
        let marker = ChangeRecord::marker(compacted_through, log.state.next_token(), unix_millis());

        log.frames.reset()?;
        log.state.clear_with_marker(marker.clone());
        log.write(&marker)?;
        Ok(marker)
    }

    fn latest(&self) -> SequenceToken {
        self.inner.read().state.latest()
    }

    fn log_start(&self) -> SequenceToken {
        self.inner.read().state.log_start()
    }

    fn len(&self) -> usize {
        self.inner.read().state.records().len()
    }

    fn index_mode(&self) -> IndexMode {
        self.mode
    }

    fn index(&self) -> LogIndex {
        self.inner.read().state.index(self.mode)
    }

    fn purge_expired(&self) -> usize {
        self.guard.purge_expired()
    }
}

fn claims_path(log_path: &Path) -> PathBuf {
    log_path.with_extension("claims")
}

/// Replays the claims log into `guard`, rewriting it without expired entries.
fn open_claims(
    path: &Path,
    guard: &IdempotencyGuard,
    ttl: Option<Duration>,
) -> ServerResult<FrameLog<FileBackend>> {
    let mut claims = FrameLog::open(FileBackend::open_with_create_dirs(path)?)?;
    let now = unix_millis();
    let mut live = Vec::with_capacity(claims.len());
    let mut dropped = 0usize;

    for frame in claims.iter() {
        let entry = frame
            .map_err(ServerError::from)
            .and_then(|frame| decode::<ClaimEntry>(&frame.data));
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                dropped += 1;
                warn!(error = %e, "skipping unreadable idempotency claim");
                continue;
            }
        };
        let age = Duration::from_millis(now.saturating_sub(entry.claimed_at));
        if ttl.is_some_and(|ttl| age >= ttl) {
            dropped += 1;
            continue;
        }
        guard.restore(&entry.id, entry.token, age);
        live.push(entry);
    }

    if dropped > 0 {
        claims.reset()?;
        for entry in &live {
            claims.append(&encode(entry)?)?;
        }
        claims.sync()?;
        debug!(kept = live.len(), dropped, "rewrote claims log");
    }

    Ok(claims)
}

fn encode<T: Serialize>(value: &T) -> ServerResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ServerError::Encoding(e.to_string()))?;
    Ok(buf)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> ServerResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ServerError::Encoding(e.to_string()))
}
