//! CLI definitions using clap.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

/// schema-sync - keep a SQLite database and versioned JSON files in step
#[derive(Parser, Debug)]
#[command(name = "schema-sync", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database path (default: ./schema-sync.db)
    #[arg(long, global = true, env = "SCHEMA_SYNC_DB")]
    pub db: Option<PathBuf>,

    /// Sync root holding config.json, hash.txt and data/ (default: ./schema-sync)
    #[arg(long, global = true, env = "SCHEMA_SYNC_PATH")]
    pub dir: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Add the lock columns to the database and write a default config.json
    Install {
        /// Overwrite an existing config.json
        #[arg(long)]
        force: bool,
    },

    /// Export schema and every configured collection, then update hash.txt
    Export,

    /// Import every configured collection (and the schema) from the files
    Import {
        /// Keep records missing from the files instead of deleting them
        #[arg(long)]
        merge: bool,
    },

    /// Export only the schema
    ExportSchema {
        /// One file per collection under data/schema/
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        split: bool,
    },

    /// Import only the schema
    ImportSchema,

    /// Recompute hash.txt from the data files
    Hash,

    /// Import the files if this database has not applied them yet
    Sync,

    /// Record the current hash.txt as applied and clear the lock
    ForceCommit,

    /// Show the lock row and the exported hash
    Status,
}
