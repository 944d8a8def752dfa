//! Migrate-index command implementation.

use super::ensure_store;
use docsync_protocol::IndexMode;
use docsync_server::DataDir;
use std::path::Path;

/// Switches the store at `path` to `mode`, returning the previous mode.
pub fn migrate(path: &Path, mode: IndexMode) -> Result<IndexMode, Box<dyn std::error::Error>> {
    ensure_store(path)?;
    let dir = DataDir::open(path)?;
    Ok(dir.set_index_mode(mode)?)
}

/// Runs the migrate-index command.
pub fn run(path: &Path, mode: IndexMode) -> Result<(), Box<dyn std::error::Error>> {
    let previous = migrate(path, mode)?;

    if previous == mode {
        println!("Index mode already {}", mode);
    } else {
        println!("Index mode: {} -> {}", previous, mode);
        println!("Clients will resync from the snapshot on their next pull.");
    }

    Ok(())
}
