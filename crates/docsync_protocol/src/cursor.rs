//! Cursor and log-index representations.
//!
//! Two encodings of "how much of the log" coexist. The legacy one is an
//! explicit, ordered list of change ids; the current one is a bare count.
//! They are kept as distinct variants so every consumer has to decide what
//! to do with each: a count can never be turned back into ids.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{ChangeId, SequenceToken};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A client's bookmark into the change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "form", content = "value", rename_all = "camelCase")]
pub enum CursorRepresentation {
    /// Ordered ids of every change already applied (legacy).
    ListForm(Vec<ChangeId>),
    /// Number of records already applied, equal to the last applied token.
    CountForm(u64),
}

impl CursorRepresentation {
    /// A count cursor at the beginning of the log.
    pub fn beginning() -> Self {
        Self::CountForm(0)
    }

    /// A count cursor positioned just after `token`.
    pub fn after(token: SequenceToken) -> Self {
        Self::CountForm(token.as_u64())
    }

    /// Returns true for the legacy list form.
    pub fn is_list_form(&self) -> bool {
        matches!(self, Self::ListForm(_))
    }

    /// Encodes the cursor for a `cursor=` query parameter.
    ///
    /// Count cursors are plain integers; list cursors are a JSON array of
    /// ids, which cannot be mistaken for an integer.
    pub fn to_query_value(&self) -> String {
        match self {
            Self::CountForm(n) => n.to_string(),
            Self::ListForm(ids) => {
                let ids: Vec<&str> = ids.iter().map(ChangeId::as_str).collect();
                serde_json::Value::from(ids).to_string()
            }
        }
    }
}

impl Default for CursorRepresentation {
    fn default() -> Self {
        Self::beginning()
    }
}

impl fmt::Display for CursorRepresentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CountForm(n) => write!(f, "count:{n}"),
            Self::ListForm(ids) => write!(f, "list:{} ids", ids.len()),
        }
    }
}

impl FromStr for CursorRepresentation {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        let s = s.trim();
        if s.starts_with('[') {
            let ids: Vec<ChangeId> = serde_json::from_str(s)
                .map_err(|e| ProtocolError::InvalidCursor(format!("bad id list: {e}")))?;
            return Ok(Self::ListForm(ids));
        }
        s.parse::<u64>()
            .map(Self::CountForm)
            .map_err(|_| ProtocolError::InvalidCursor(format!("expected count or id list, got {s:?}")))
    }
}

/// How a store publishes its log index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexMode {
    /// Every record is individually addressable and listed by id.
    #[default]
    Ids,
    /// Only the number of appended records is known.
    Counter,
}

impl fmt::Display for IndexMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ids => f.write_str("ids"),
            Self::Counter => f.write_str("counter"),
        }
    }
}

impl FromStr for IndexMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        match s {
            "ids" => Ok(Self::Ids),
            "counter" => Ok(Self::Counter),
            other => Err(ProtocolError::InvalidCursor(format!("unknown index mode {other:?}"))),
        }
    }
}

/// The index a store reports for its log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "camelCase")]
pub enum LogIndex {
    /// Ordered ids of the records currently in the log.
    Ids(Vec<ChangeId>),
    /// Number of records ever appended.
    Counter(u64),
}

impl LogIndex {
    /// Returns which representation this is.
    pub fn mode(&self) -> IndexMode {
        match self {
            Self::Ids(_) => IndexMode::Ids,
            Self::Counter(_) => IndexMode::Counter,
        }
    }
}
