//! docsync CLI
//!
//! Runs the sync server and inspects its data directory.
//!
//! # Commands
//!
//! - `serve` - Run the HTTP sync server
//! - `compact` - Fold the change log into the snapshot
//! - `inspect` - Display store statistics and metadata
//! - `dump-log` - Dump change records for debugging
//! - `migrate-index` - Switch the published index representation

mod commands;

use clap::{Parser, Subcommand};
use docsync_protocol::IndexMode;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// docsync server and maintenance tools.
#[derive(Parser)]
#[command(name = "docsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP sync server
    Serve {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to listen on, overriding the configuration
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Index mode for a new store (ids, counter)
        #[arg(short, long)]
        index_mode: Option<IndexMode>,
    },

    /// Fold the change log into the snapshot
    Compact {
        /// Dry run - show what would be folded
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Display store statistics and metadata
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump change records for debugging
    DumpLog {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Start after this sequence token
        #[arg(short, long, default_value = "0")]
        after: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Switch the published index representation (ids, counter)
    MigrateIndex {
        /// Target index mode
        #[arg(short, long, default_value = "counter")]
        to: IndexMode,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            index_mode,
        } => {
            let options = commands::serve::ServeOptions {
                config,
                data_dir: cli.path,
                bind,
                index_mode,
            };
            commands::serve::run(options)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Data directory required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Data directory required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::DumpLog {
            limit,
            after,
            format,
        } => {
            let path = cli.path.ok_or("Data directory required for dump-log")?;
            commands::dump_log::run(&path, limit, after, &format)?;
        }
        Commands::MigrateIndex { to } => {
            let path = cli.path.ok_or("Data directory required for migrate-index")?;
            commands::migrate_index::run(&path, to)?;
        }
        Commands::Version => {
            println!("docsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("store format v{}", docsync_server::FORMAT_VERSION);
        }
    }

    Ok(())
}
