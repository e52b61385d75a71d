//! Status command implementation.

use std::path::Path;

use colored::Colorize;
use serde::Serialize;

use crate::cli::commands::Workspace;
use crate::error::Result;
use crate::sync::{LockState, MetaStamp};

/// Output for status command.
#[derive(Serialize)]
struct StatusOutput {
    root: String,
    lock: LockState,
    exported: Option<MetaStamp>,
    collections: Vec<String>,
    up_to_date: bool,
}

/// Show the lock row next to the exported stamp.
///
/// # Errors
///
/// Returns an error if the database cannot be read.
pub async fn execute(db: Option<&Path>, dir: Option<&Path>, json: bool) -> Result<()> {
    let workspace = Workspace::open(db, dir)?;
    let lock = workspace.updates().state()?;
    let exported = workspace.meta().get_export_meta().await;
    let manager = workspace.manager()?;

    let output = StatusOutput {
        root: workspace.root.display().to_string(),
        up_to_date: exported.as_ref().is_some_and(|m| m.hash == lock.hash),
        lock,
        exported,
        collections: manager.names().into_iter().map(String::from).collect(),
    };

    if json {
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!("{}", "Sync Status".bold().underline());
    println!();
    println!("  Root:     {}", output.root);
    println!("  Synced:   {}", output.collections.join(", "));
    println!();

    println!("{}", "Database:".blue().bold());
    if output.lock.hash.is_empty() {
        println!("  Applied:  {}", "nothing yet".dimmed());
    } else {
        println!("  Applied:  {} {}", output.lock.hash, output.lock.ts.dimmed());
    }
    if output.lock.locked {
        println!("  {}", "Locked (an import is running, or a crashed one left it set)".yellow());
    }
    println!();

    println!("{}", "Files:".blue().bold());
    match &output.exported {
        Some(stamp) => println!("  Exported: {} {}", stamp.hash, stamp.ts.dimmed()),
        None => println!("  Exported: {}", "nothing yet".dimmed()),
    }
    println!();

    if output.up_to_date {
        println!("{}", "Database matches the exported files.".green());
    } else if output.exported.is_some() {
        println!(
            "{}",
            "Run 'schema-sync sync' to apply the exported files.".dimmed()
        );
    }
    Ok(())
}
