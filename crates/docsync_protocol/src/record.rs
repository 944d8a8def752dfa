//! Change records.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A partial update: only the top-level keys that changed.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// A fully merged document.
pub type DocumentState = serde_json::Map<String, serde_json::Value>;

/// Prefix reserved for ids of compaction marker records.
const MARKER_ID_PREFIX: &str = "__compaction__:";

/// Longest accepted change id, in bytes.
const MAX_ID_LEN: usize = 256;

/// Client-generated identifier of a logical mutation.
///
/// The same id is reused for every retry of one submission, which is what
/// makes appends idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(String);

impl ChangeId {
    /// Wraps a caller-supplied id after validating it.
    pub fn new(id: impl Into<String>) -> ProtocolResult<Self> {
        let id = Self(id.into());
        id.validate()?;
        Ok(id)
    }

    /// Checks that a client-supplied id is acceptable.
    ///
    /// Ids arriving over the wire are deserialized without validation, so
    /// the store calls this before accepting a submission.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.0.is_empty() || self.0.len() > MAX_ID_LEN {
            return Err(ProtocolError::InvalidChangeId(format!(
                "length must be 1..={MAX_ID_LEN}, got {}",
                self.0.len()
            )));
        }
        if self.0.starts_with(MARKER_ID_PREFIX) {
            return Err(ProtocolError::InvalidChangeId(format!(
                "prefix {MARKER_ID_PREFIX:?} is reserved"
            )));
        }
        Ok(())
    }

    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Id used for the marker appended after a compaction folded the log
    /// through `compacted_through`.
    pub fn compaction_marker(compacted_through: SequenceToken) -> Self {
        Self(format!("{MARKER_ID_PREFIX}{}", compacted_through.as_u64()))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned position of a record in the log.
///
/// Tokens start at 1 and grow by one per appended record, including
/// compaction markers, and never restart after the log is cleared. The
/// token of a record is therefore also the count of records appended up to
/// and including it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceToken(u64);

impl SequenceToken {
    /// The position before the first record.
    pub const BEGINNING: SequenceToken = SequenceToken(0);

    /// Creates a token from its raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following token.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a record in the log stands for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RecordKind {
    /// An ordinary partial update.
    #[default]
    Change,
    /// Boundary left behind when a compaction cleared the log.
    #[serde(rename_all = "camelCase")]
    CompactionMarker {
        /// Highest token folded into the snapshot written by that compaction.
        compacted_through: SequenceToken,
    },
}

/// A submission from a client: id plus partial payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChange {
    /// Stable id of the mutation.
    pub id: ChangeId,
    /// Changed top-level keys.
    pub payload: Payload,
}

impl NewChange {
    /// Creates a submission.
    pub fn new(id: ChangeId, payload: Payload) -> Self {
        Self { id, payload }
    }
}

/// One entry of the shared change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Client-generated id.
    pub id: ChangeId,
    /// Partial update.
    pub payload: Payload,
    /// Position in the log.
    pub sequence_token: SequenceToken,
    /// Unix milliseconds at which the store accepted the record.
    pub inserted_at: u64,
    /// Change or compaction marker.
    #[serde(default)]
    pub kind: RecordKind,
}

impl ChangeRecord {
    /// Builds the record the store keeps for an accepted submission.
    pub fn accepted(change: NewChange, sequence_token: SequenceToken, inserted_at: u64) -> Self {
        Self {
            id: change.id,
            payload: change.payload,
            sequence_token,
            inserted_at,
            kind: RecordKind::Change,
        }
    }

    /// Builds a compaction marker.
    pub fn marker(
        compacted_through: SequenceToken,
        sequence_token: SequenceToken,
        inserted_at: u64,
    ) -> Self {
        Self {
            id: ChangeId::compaction_marker(compacted_through),
            payload: Payload::new(),
            sequence_token,
            inserted_at,
            kind: RecordKind::CompactionMarker { compacted_through },
        }
    }

    /// Returns the fold boundary if this record is a compaction marker.
    pub fn compaction_boundary(&self) -> Option<SequenceToken> {
        match self.kind {
            RecordKind::CompactionMarker { compacted_through } => Some(compacted_through),
            RecordKind::Change => None,
        }
    }

    /// Returns true for compaction markers.
    pub fn is_marker(&self) -> bool {
        self.compaction_boundary().is_some()
    }
}

/// Current wall-clock time in Unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
