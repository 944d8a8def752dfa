//! Dump-log command implementation.

use super::open_store;
use docsync_protocol::{RecordKind, SequenceToken};
use docsync_server::ChangeRange;
use serde::Serialize;
use std::path::Path;

const PAGE_SIZE: usize = 256;

/// A change record prepared for display.
#[derive(Debug, Serialize)]
pub struct LogEntry {
    /// Sequence token.
    pub token: u64,
    /// Change id.
    pub id: String,
    /// "change" or "marker".
    pub kind: &'static str,
    /// Unix milliseconds at which the record was accepted.
    pub inserted_at: u64,
    /// Keys touched by the payload.
    pub keys: Vec<String>,
    /// Boundary named by a compaction marker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compacted_through: Option<u64>,
}

/// Reads up to `limit` records after token `after`.
pub fn collect(
    path: &Path,
    limit: Option<usize>,
    after: u64,
) -> Result<Vec<LogEntry>, Box<dyn std::error::Error>> {
    let context = open_store(path)?;
    let store = context.changes();
    let range = ChangeRange::new(store, SequenceToken::new(after), store.latest(), PAGE_SIZE);

    let mut entries = Vec::new();
    for record in range.take(limit.unwrap_or(usize::MAX)) {
        let record = record?;
        let (kind, compacted_through) = match record.kind {
            RecordKind::Change => ("change", None),
            RecordKind::CompactionMarker { compacted_through } => {
                ("marker", Some(compacted_through.as_u64()))
            }
        };
        entries.push(LogEntry {
            token: record.sequence_token.as_u64(),
            id: record.id.to_string(),
            kind,
            inserted_at: record.inserted_at,
            keys: record.payload.keys().cloned().collect(),
            compacted_through,
        });
    }
    Ok(entries)
}

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    after: u64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let entries = collect(path, limit, after)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            println!("Change log at {:?}", path);
            println!();
            for entry in &entries {
                match entry.compacted_through {
                    Some(through) => println!(
                        "[{:>8}] marker  {} (compacted through {})",
                        entry.token, entry.id, through
                    ),
                    None => println!(
                        "[{:>8}] change  {} keys={:?}",
                        entry.token, entry.id, entry.keys
                    ),
                }
            }
            println!();
            println!("{} record(s)", entries.len());
        }
    }

    Ok(())
}
