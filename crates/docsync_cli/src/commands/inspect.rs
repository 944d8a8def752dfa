//! Inspect command implementation.

use super::open_store;
use serde::Serialize;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Data directory path.
    pub path: String,
    /// Published index representation.
    pub index_mode: String,
    /// Records currently in the log, markers included.
    pub log_len: usize,
    /// Newest token ever assigned.
    pub latest_token: u64,
    /// Highest token removed by the last truncation.
    pub log_start: u64,
    /// Boundary of the stored snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_through: Option<u64>,
    /// Number of keys in the snapshot.
    pub snapshot_keys: usize,
    /// Size of the change log file in bytes.
    pub log_size: u64,
    /// Size of the snapshot file in bytes.
    pub snapshot_size: u64,
}

/// Collects the inspection result for a data directory.
pub fn inspect(path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let context = open_store(path)?;
    let status = context.status()?;

    Ok(InspectResult {
        path: path.display().to_string(),
        index_mode: status.index_mode.to_string(),
        log_len: status.log_len,
        latest_token: status.latest.as_u64(),
        log_start: status.log_start.as_u64(),
        snapshot_through: status.snapshot_through.map(|t| t.as_u64()),
        snapshot_keys: status.snapshot_keys,
        log_size: file_size(&path.join("changes.log")),
        snapshot_size: file_size(&path.join("snapshot.json")),
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => print_text(&result),
    }

    Ok(())
}

fn print_text(result: &InspectResult) {
    println!("docsync store: {}", result.path);
    println!();
    println!("Change log:");
    println!("  Index mode:       {}", result.index_mode);
    println!("  Records:          {}", result.log_len);
    println!("  Latest token:     {}", result.latest_token);
    println!("  Log start:        {}", result.log_start);
    println!("  File size:        {} bytes", result.log_size);
    println!();
    println!("Snapshot:");
    match result.snapshot_through {
        Some(through) => {
            println!("  Through token:    {}", through);
            println!("  Keys:             {}", result.snapshot_keys);
        }
        None => println!("  (none)"),
    }
    println!("  File size:        {} bytes", result.snapshot_size);
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::{ChangeId, NewChange};
    use docsync_server::{HandlerContext, ServerConfig};
    use serde_json::json;
    use tempfile::tempdir;

    fn seed(path: &Path) {
        let context = HandlerContext::open(ServerConfig::default().with_data_dir(path)).unwrap();
        for (id, key) in [("c1", "a"), ("c2", "b")] {
            let mut payload = serde_json::Map::new();
            payload.insert(key.to_string(), json!(1));
            context
                .append(NewChange::new(ChangeId::new(id).unwrap(), payload))
                .unwrap();
        }
        context.compact().unwrap();
    }

    #[test]
    fn reports_compacted_store() {
        let dir = tempdir().unwrap();
        seed(dir.path());

        let result = inspect(dir.path()).unwrap();
        assert_eq!(result.index_mode, "ids");
        assert_eq!(result.snapshot_through, Some(2));
        assert_eq!(result.snapshot_keys, 2);
        assert!(result.snapshot_size > 0);
    }

    #[test]
    fn refuses_missing_store() {
        let dir = tempdir().unwrap();
        assert!(inspect(&dir.path().join("absent")).is_err());
        assert!(inspect(dir.path()).is_err());
    }
}
