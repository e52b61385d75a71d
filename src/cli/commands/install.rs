//! Install schema-sync into a database and sync root.
//!
//! Adds the lock columns to `settings` (creating the table if needed) and
//! writes a default `config.json`. An existing config is left alone unless
//! `--force` is given.

use std::fs;
use std::path::{Path, PathBuf};

use colored::Colorize;
use serde::Serialize;

use crate::cli::commands::say;
use crate::config::{CONFIG_FILE, DEFAULT_CONFIG, resolve_db_path, resolve_sync_root};
use crate::error::Result;
use crate::storage::Database;

#[derive(Serialize)]
struct InstallOutput {
    database: PathBuf,
    root: PathBuf,
    migrations_applied: usize,
    config_written: bool,
}

/// Execute the install command.
///
/// # Errors
///
/// Returns an error if the database cannot be migrated or the config cannot
/// be written.
pub fn execute(
    force: bool,
    db_path: Option<&Path>,
    dir: Option<&Path>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let db_path = resolve_db_path(db_path);
    let root = resolve_sync_root(dir);
    say(json, quiet, "Installing schema-sync...");

    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let db = Database::open(&db_path)?;
    let migrations_applied = db.install()?;

    let config_path = root.join(CONFIG_FILE);
    let config_written = if config_path.exists() && !force {
        say(
            json,
            quiet,
            &format!(
                "{} already exists, use --force to overwrite",
                config_path.display()
            )
            .dimmed()
            .to_string(),
        );
        false
    } else {
        fs::create_dir_all(&root)?;
        fs::write(&config_path, DEFAULT_CONFIG)?;
        true
    };

    if json {
        let output = InstallOutput {
            database: db_path,
            root,
            migrations_applied,
            config_written,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else if !quiet {
        println!("  Database:   {}", db_path.display());
        println!("  Migrations: {migrations_applied} applied");
        if config_written {
            println!("  Config:     {}", config_path.display());
        }
        println!("{}", "Done".green());
    }
    Ok(())
}
