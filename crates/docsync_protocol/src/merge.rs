//! Shallow last-writer-wins merge.
//!
//! Conflicts are resolved per top-level key only: a later payload that
//! names a key replaces its whole value, nested objects included. A JSON
//! `null` is stored as a value, not treated as a delete.

use crate::record::{ChangeRecord, DocumentState, Payload};

/// Merges `payload` into `state`, overwriting every key it names.
pub fn merge_into(state: &mut DocumentState, payload: &Payload) {
    for (key, value) in payload {
        state.insert(key.clone(), value.clone());
    }
}

/// Folds `records` in iteration order on top of `base`.
///
/// Compaction markers carry no payload and are skipped. Callers pass
/// records in ascending token order.
pub fn fold<'a, I>(mut base: DocumentState, records: I) -> DocumentState
where
    I: IntoIterator<Item = &'a ChangeRecord>,
{
    for record in records {
        if record.is_marker() {
            continue;
        }
        merge_into(&mut base, &record.payload);
    }
    base
}
