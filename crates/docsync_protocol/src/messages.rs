//! Request and response bodies of the HTTP surface.

use crate::cursor::{CursorRepresentation, IndexMode};
use crate::error::ProtocolResult;
use crate::record::{ChangeRecord, SequenceToken};
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};

/// Body of `GET /bootstrap`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapResponse {
    /// Always true on success.
    pub ok: bool,
    /// Latest snapshot, `null` if no compaction has run yet.
    pub snapshot: Option<Snapshot>,
}

impl BootstrapResponse {
    /// Wraps a snapshot.
    pub fn new(snapshot: Option<Snapshot>) -> Self {
        Self { ok: true, snapshot }
    }
}

/// Body of `POST /changes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    /// Always true on success.
    pub ok: bool,
    /// True when the id had already been accepted; nothing was appended.
    pub duplicated: bool,
    /// Token of the record holding this id.
    pub sequence_token: SequenceToken,
}

/// Query string of `GET /changes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullQuery {
    /// Encoded cursor, see [`CursorRepresentation::to_query_value`].
    #[serde(default)]
    pub cursor: Option<String>,
    /// Page size requested by the client.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl PullQuery {
    /// Builds a query for `cursor`.
    pub fn new(cursor: &CursorRepresentation, limit: usize) -> Self {
        Self {
            cursor: Some(cursor.to_query_value()),
            limit: Some(limit),
        }
    }

    /// Decodes the cursor; a missing cursor means the beginning.
    pub fn cursor(&self) -> ProtocolResult<CursorRepresentation> {
        match &self.cursor {
            Some(raw) => raw.parse(),
            None => Ok(CursorRepresentation::beginning()),
        }
    }
}

/// Body of `GET /changes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Always true on success.
    pub ok: bool,
    /// Records after the cursor in ascending token order.
    pub changes: Vec<ChangeRecord>,
    /// Cursor to send next time.
    pub new_cursor: CursorRepresentation,
    /// The client must bootstrap from the snapshot instead of merging.
    pub snapshot_needed: bool,
    /// How the store indexes its log.
    #[serde(default)]
    pub index_mode: IndexMode,
    /// More records are available past `new_cursor`.
    #[serde(default)]
    pub has_more: bool,
}

impl PullResponse {
    /// A response telling the client to resync from the snapshot.
    pub fn snapshot_needed(current: CursorRepresentation, index_mode: IndexMode) -> Self {
        Self {
            ok: true,
            changes: Vec::new(),
            new_cursor: current,
            snapshot_needed: true,
            index_mode,
            has_more: false,
        }
    }

    /// Decodes a response, setting aside records that fail to decode.
    ///
    /// A single bad record must not poison the rest of the batch, so each
    /// entry of `changes` is decoded on its own.
    pub fn decode_lenient(
        body: serde_json::Value,
    ) -> ProtocolResult<(Self, Vec<MalformedRecord>)> {
        let raw: RawPullResponse = serde_json::from_value(body)?;
        let mut changes = Vec::with_capacity(raw.changes.len());
        let mut malformed = Vec::new();

        for (position, entry) in raw.changes.into_iter().enumerate() {
            let id = entry
                .get("id")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned);
            match serde_json::from_value::<ChangeRecord>(entry) {
                Ok(record) => changes.push(record),
                Err(e) => malformed.push(MalformedRecord {
                    position,
                    id,
                    reason: e.to_string(),
                }),
            }
        }

        let response = Self {
            ok: raw.ok,
            changes,
            new_cursor: raw.new_cursor,
            snapshot_needed: raw.snapshot_needed,
            index_mode: raw.index_mode,
            has_more: raw.has_more,
        };
        Ok((response, malformed))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPullResponse {
    ok: bool,
    changes: Vec<serde_json::Value>,
    new_cursor: CursorRepresentation,
    snapshot_needed: bool,
    #[serde(default)]
    index_mode: IndexMode,
    #[serde(default)]
    has_more: bool,
}

/// A pulled entry that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    /// Index within the `changes` array.
    pub position: usize,
    /// Id of the entry, if it had a readable one.
    pub id: Option<String>,
    /// Decoder error.
    pub reason: String,
}

/// Body of `POST /compact`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactResponse {
    /// Always true on success.
    pub ok: bool,
    /// Number of change records folded by this run; zero if nothing to do.
    pub folded_count: u64,
    /// Boundary of the current snapshot.
    pub compacted_through: SequenceToken,
}

/// Body returned with every non-2xx status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false.
    pub ok: bool,
    /// Human-readable reason.
    pub error: String,
}

impl ErrorResponse {
    /// Creates an error body.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: error.into(),
        }
    }
}
