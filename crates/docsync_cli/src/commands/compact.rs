//! Compact command implementation.

use super::open_store;
use docsync_protocol::SequenceToken;
use docsync_server::{ChangeRange, ChangeStore};
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let context = open_store(path)?;

    println!("Compacting change log at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let before = context.status()?;
    println!("Before:");
    println!("  Records in log:    {}", before.log_len);
    println!("  Latest token:      {}", before.latest);
    println!(
        "  Snapshot through:  {}",
        before
            .snapshot_through
            .map_or_else(|| "-".to_string(), |t| t.to_string())
    );
    println!();

    if dry_run {
        let floor = before.snapshot_through.unwrap_or_default();
        let foldable = count_foldable(context.changes(), floor)?;
        println!("Would fold {} record(s) into the snapshot", foldable);
        return Ok(());
    }

    let report = context.compact()?;
    let after = context.status()?;

    println!("Compaction complete:");
    println!("  Folded records:    {}", report.folded_count);
    println!("  Compacted through: {}", report.compacted_through);
    if let Some(marker) = report.marker_token {
        println!("  Marker token:      {}", marker);
    }
    println!("  Snapshot keys:     {}", after.snapshot_keys);
    println!("  Records in log:    {}", after.log_len);

    Ok(())
}

fn count_foldable(
    changes: &dyn ChangeStore,
    floor: SequenceToken,
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut count = 0;
    for record in ChangeRange::all(changes, 256) {
        let record = record?;
        if !record.is_marker() && record.sequence_token > floor {
            count += 1;
        }
    }
    Ok(count)
}
