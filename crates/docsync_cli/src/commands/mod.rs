//! CLI command implementations.

pub mod compact;
pub mod dump_log;
pub mod inspect;
pub mod migrate_index;
pub mod serve;

use docsync_server::{DataDir, HandlerContext, ServerConfig};
use std::path::Path;

/// Opens an existing data directory for maintenance.
///
/// Refuses to create a store where none exists.
pub fn open_store(path: &Path) -> Result<HandlerContext, Box<dyn std::error::Error>> {
    ensure_store(path)?;
    let config = ServerConfig::default().with_data_dir(path);
    Ok(HandlerContext::open(config)?)
}

/// Fails unless `path` holds store metadata.
pub fn ensure_store(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No data directory found at {:?}", path).into());
    }
    let dir = DataDir::open(path)?;
    if dir.load_meta()?.is_none() {
        return Err(format!("No docsync store found at {:?}", path).into());
    }
    Ok(())
}
