//! Folding the change log into the snapshot.
//!
//! A run reads every change record still in the log, merges them in token
//! order on top of the previous snapshot, writes the result as the new
//! snapshot, and then truncates the log to a single compaction marker.
//!
//! Appends share an [`AppendGate`]; a run holds it exclusively from the
//! first read until the marker is written. An append therefore lands
//! either before the fold (and is folded) or after the marker (and stays
//! in the log), never in between.

use crate::change_store::{ChangeRange, ChangeStore};
use crate::error::{ServerError, ServerResult};
use crate::lock::LeaseLock;
use crate::snapshot_store::SnapshotStore;
use docsync_protocol::{merge_into, unix_millis, SequenceToken, Snapshot};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Records read per page while folding.
const FOLD_PAGE_SIZE: usize = 1024;

/// Serializes compaction against appends.
#[derive(Debug, Default)]
pub struct AppendGate {
    lock: RwLock<()>,
}

impl AppendGate {
    /// Creates an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entered by every append; many appenders may hold it at once.
    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Entered by compaction; waits for in-flight appends and blocks new ones.
    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }
}

/// Outcome of one compaction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    /// Change records folded into the snapshot by this run.
    pub folded_count: u64,
    /// Boundary of the snapshot after the run.
    pub compacted_through: SequenceToken,
    /// Token of the marker appended by this run, if it did anything.
    pub marker_token: Option<SequenceToken>,
}

/// Runs compactions, one at a time.
#[derive(Debug)]
pub struct CompactionJob {
    lease: LeaseLock,
}

impl CompactionJob {
    /// Creates a job whose lease expires after `lock_ttl`.
    pub fn new(lock_ttl: Duration) -> Self {
        Self {
            lease: LeaseLock::new(lock_ttl),
        }
    }

    /// Returns true while a run is in progress.
    pub fn is_running(&self) -> bool {
        self.lease.is_held()
    }

    /// Folds the log into the snapshot and truncates it.
    ///
    /// Fails with [`ServerError::CompactionInProgress`] if another run holds
    /// the lease. A log without change records is left untouched.
    pub fn run(
        &self,
        gate: &AppendGate,
        changes: &dyn ChangeStore,
        snapshots: &dyn SnapshotStore,
    ) -> ServerResult<CompactionReport> {
        let _lease = self
            .lease
            .try_acquire()
            .ok_or(ServerError::CompactionInProgress)?;
        let _exclusive = gate.exclusive();

        let previous = snapshots.get()?;
        let floor = previous
            .as_ref()
            .map(|s| s.compacted_through)
            .unwrap_or_default();
        let mut state = previous.map(|s| s.state).unwrap_or_default();

        info!(floor = %floor, records = changes.len(), "compaction started");

        let mut folded_count = 0u64;
        let mut last_folded = floor;
        for record in ChangeRange::all(changes, FOLD_PAGE_SIZE) {
            let record = record?;
            if record.is_marker() || record.sequence_token <= floor {
                continue;
            }
            merge_into(&mut state, &record.payload);
            last_folded = record.sequence_token;
            folded_count += 1;
        }

        if folded_count == 0 {
            debug!("nothing to compact");
            return Ok(CompactionReport {
                folded_count,
                compacted_through: floor,
                marker_token: None,
            });
        }

        snapshots.put(&Snapshot::new(state, last_folded, unix_millis()))?;
        let marker = changes.clear(last_folded)?;

        info!(
            folded = folded_count,
            compacted_through = %last_folded,
            marker = %marker.sequence_token,
            "compaction finished"
        );

        Ok(CompactionReport {
            folded_count,
            compacted_through: last_folded,
            marker_token: Some(marker.sequence_token),
        })
    }
}

/// Thresholds that trigger an automatic compaction.
///
/// Either threshold is enough. With neither set, compaction only runs when
/// requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionPolicy {
    /// Compact once the log holds this many records.
    pub max_log_len: Option<usize>,
    /// Compact once the oldest change in the log is this old.
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
    /// How often the thresholds are checked.
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
}

impl CompactionPolicy {
    /// A policy that never triggers.
    pub fn manual() -> Self {
        Self {
            max_log_len: None,
            max_age: None,
            check_interval: Duration::from_secs(30),
        }
    }

    /// Sets the length threshold.
    pub fn with_max_log_len(mut self, len: usize) -> Self {
        self.max_log_len = Some(len);
        self
    }

    /// Sets the age threshold.
    pub fn with_max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age);
        self
    }

    /// Sets how often thresholds are checked.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Returns true if neither threshold is set.
    pub fn is_manual(&self) -> bool {
        self.max_log_len.is_none() && self.max_age.is_none()
    }

    /// Decides whether `changes` is due for compaction at `now_millis`.
    pub fn is_due(&self, changes: &dyn ChangeStore, now_millis: u64) -> ServerResult<bool> {
        if let Some(max_len) = self.max_log_len {
            if changes.len() >= max_len {
                return Ok(true);
            }
        }

        if let Some(max_age) = self.max_age {
            let oldest = ChangeRange::all(changes, 8)
                .find(|r| r.as_ref().map_or(true, |r| !r.is_marker()))
                .transpose()?;
            if let Some(oldest) = oldest {
                let age = now_millis.saturating_sub(oldest.inserted_at);
                if u128::from(age) >= max_age.as_millis() {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self::manual()
    }
}
