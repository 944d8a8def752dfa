//! Compacted snapshots.

use crate::record::{DocumentState, SequenceToken};
use serde::{Deserialize, Serialize};

/// The fully folded document as of a compaction boundary.
///
/// Every key in `state` holds the last-writer-wins value among all records
/// with a token at or below `compacted_through`. Because tokens are dense,
/// `compacted_through` is also the number of records ever appended up to
/// the boundary, compaction markers included. It is not the number of
/// change ids folded once an earlier compaction has left a marker behind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Merged document.
    pub state: DocumentState,
    /// Highest token folded into `state`.
    pub compacted_through: SequenceToken,
    /// Unix milliseconds at which the compaction ran.
    #[serde(default)]
    pub compacted_at: u64,
}

impl Snapshot {
    /// Creates a snapshot.
    pub fn new(state: DocumentState, compacted_through: SequenceToken, compacted_at: u64) -> Self {
        Self {
            state,
            compacted_through,
            compacted_at,
        }
    }

    /// Returns the number of top-level keys.
    pub fn key_count(&self) -> usize {
        self.state.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_without_timestamp() {
        let snapshot: Snapshot = serde_json::from_value(json!({
            "state": {"balance": 100},
            "compactedThrough": 4
        }))
        .unwrap();

        assert_eq!(snapshot.compacted_through, SequenceToken::new(4));
        assert_eq!(snapshot.compacted_at, 0);
        assert_eq!(snapshot.key_count(), 1);
    }
}
