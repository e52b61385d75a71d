//! Data sync commands: export, import, hash, sync and force-commit.
//!
//! Files live under the sync root (`--dir`), so they can be committed to
//! git next to the application that owns the database.

use std::path::Path;

use colored::Colorize;
use serde_json::json;

use crate::cli::commands::{Workspace, say};
use crate::error::Result;
use crate::sync::{LoadStats, StartupOutcome, SyncError};

/// Export the schema and every collection, then stamp the export.
///
/// # Errors
///
/// Returns the first export error, or an error if the hash cannot be
/// written.
pub async fn export(db: Option<&Path>, dir: Option<&Path>, json: bool, quiet: bool) -> Result<()> {
    let workspace = Workspace::open(db, dir)?;
    let runtime = workspace.runtime()?;
    say(json, quiet, "Exporting schema and data...");

    runtime.manager().export_all().await?;
    let stamp = runtime.update_meta(true).await?;

    if json {
        let output = json!({
            "success": true,
            "exported": runtime.manager().names(),
            "hash": stamp.as_ref().map(|s| &s.hash),
            "ts": stamp.as_ref().map(|s| &s.ts),
        });
        println!("{}", serde_json::to_string(&output)?);
    } else if !quiet {
        for name in runtime.manager().names() {
            println!("  {name}");
        }
        match &stamp {
            Some(stamp) => println!("  Hash: {}", stamp.hash.dimmed()),
            None => println!("  {}", "Files unchanged".dimmed()),
        }
        println!("{}", "Done".green());
    }
    Ok(())
}

/// Import every collection from the files.
///
/// Without `merge` the exported hash is then recorded as applied, but only
/// if the lock can be taken; a lock held elsewhere is left alone.
///
/// # Errors
///
/// Returns the first load error; nothing is deleted in that case.
pub async fn import(
    merge: bool,
    db: Option<&Path>,
    dir: Option<&Path>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let workspace = Workspace::open(db, dir)?;
    let runtime = workspace.runtime()?;
    say(
        json,
        quiet,
        if merge {
            "Importing schema and data (merge)..."
        } else {
            "Importing schema and data..."
        },
    );

    let report = runtime.manager().load_all(merge).await?;

    // A full import leaves the database matching the files, so record the
    // hash through the lock; a merge keeps extra records and records nothing.
    let stamp = runtime.meta().get_export_meta().await;
    let recorded = match &stamp {
        Some(stamp) if !merge => {
            runtime.updates().lock_for_updates(&stamp.hash, &stamp.ts)?
                && runtime.updates().commit_or_release()?
        }
        _ => false,
    };

    if json {
        let collections: serde_json::Map<String, serde_json::Value> = report
            .iter()
            .map(|(name, stats)| (name.clone(), json!(stats)))
            .collect();
        let output = json!({
            "success": true,
            "merge": merge,
            "collections": collections,
            "hash": stamp.as_ref().map(|s| &s.hash),
            "recorded": recorded,
        });
        println!("{}", serde_json::to_string(&output)?);
    } else if !quiet {
        for (name, stats) in &report {
            print_load_stats(name, stats.as_ref());
        }
        if !recorded && !merge && stamp.is_some() {
            println!(
                "  {}",
                "Hash not recorded (already applied or locked by another instance)".dimmed()
            );
        }
        println!("{}", "Done".green());
    }
    Ok(())
}

fn print_load_stats(name: &str, stats: Option<&LoadStats>) {
    match stats {
        Some(stats) if !stats.is_noop() => {
            let mut line = format!(
                "  {name:<20} {} inserted, {} updated, {} deleted",
                stats.inserted, stats.updated, stats.deleted
            );
            if stats.duplicates > 0 {
                line.push_str(&format!(", {} duplicates", stats.duplicates).yellow().to_string());
            }
            println!("{line}");
        }
        _ => println!("  {name:<20} {}", "unchanged".dimmed()),
    }
}

/// Recompute `hash.txt` without touching the lock row.
///
/// # Errors
///
/// Returns an error if the data files cannot be hashed.
pub async fn hash(db: Option<&Path>, dir: Option<&Path>, json: bool, quiet: bool) -> Result<()> {
    let workspace = Workspace::open(db, dir)?;
    let runtime = workspace.runtime()?;
    say(json, quiet, "Hashing export files...");

    let stamp = runtime.update_meta(false).await?;
    if json {
        println!("{}", serde_json::to_string(&json!({ "success": true, "meta": stamp }))?);
    } else if !quiet {
        match &stamp {
            Some(stamp) => println!("  {} {}", stamp.hash, stamp.ts.dimmed()),
            None => println!("  {}", "Hash unchanged".dimmed()),
        }
        println!("{}", "Done".green());
    }
    Ok(())
}

/// Run the startup import gate once.
///
/// # Errors
///
/// Returns the import error after the lock was released.
pub async fn sync(db: Option<&Path>, dir: Option<&Path>, json: bool, quiet: bool) -> Result<()> {
    let workspace = Workspace::open(db, dir)?;
    let runtime = workspace.runtime()?;
    say(json, quiet, "Checking for new exports...");

    let outcome = runtime.startup_import().await?;
    if json {
        let output = match &outcome {
            StartupOutcome::Applied(stamp) => json!({"success": true, "applied": true, "meta": stamp}),
            other => json!({"success": true, "applied": false, "reason": format!("{other:?}")}),
        };
        println!("{}", serde_json::to_string(&output)?);
    } else if !quiet {
        match &outcome {
            StartupOutcome::Applied(stamp) => println!("  Applied {}", stamp.hash),
            StartupOutcome::NothingExported => println!("  {}", "Nothing exported yet".dimmed()),
            StartupOutcome::Skipped | StartupOutcome::Disabled => {
                println!("  {}", "Already up to date or locked by another instance".dimmed());
            }
        }
        println!("{}", "Done".green());
    }
    Ok(())
}

/// Record the current `hash.txt` as applied and clear a stuck lock.
///
/// # Errors
///
/// Returns `FileNotFound` if nothing has been exported.
pub async fn force_commit(
    db: Option<&Path>,
    dir: Option<&Path>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let workspace = Workspace::open(db, dir)?;
    let meta = workspace.meta();
    let stamp = meta
        .get_export_meta()
        .await
        .ok_or_else(|| SyncError::FileNotFound(meta.hash_file().display().to_string()))?;

    workspace.updates().force_commit_updates(&stamp.hash, &stamp.ts)?;
    if json {
        println!("{}", serde_json::to_string(&json!({ "success": true, "meta": stamp }))?);
    } else if !quiet {
        println!("  Committed {} {}", stamp.hash, stamp.ts.dimmed());
        println!("{}", "Done".green());
    }
    Ok(())
}
