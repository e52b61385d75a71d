//! Schema-only export and import.

use std::path::Path;

use colored::Colorize;
use serde_json::json;

use crate::cli::commands::{Workspace, say};
use crate::error::Result;
use crate::sync::SchemaSynchronizer;

fn synchronizer(workspace: &Workspace, split: bool) -> SchemaSynchronizer<crate::storage::SqliteSchemaService> {
    SchemaSynchronizer::new(
        workspace.schema_service(),
        workspace.meta().data_dir(),
        workspace.schema_options(split),
    )
}

/// Write the schema snapshot, split per collection unless `split` is false.
///
/// # Errors
///
/// Returns an error if the snapshot cannot be taken or written.
pub async fn export(
    split: bool,
    db: Option<&Path>,
    dir: Option<&Path>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let workspace = Workspace::open(db, dir)?;
    say(json, quiet, "Exporting schema...");

    synchronizer(&workspace, split).export_now().await?;

    if json {
        let output = json!({
            "success": true,
            "split": split,
            "path": workspace.meta().data_dir().join("schema.json"),
        });
        println!("{}", serde_json::to_string(&output)?);
    } else if !quiet {
        println!("{}", "Done".green());
    }
    Ok(())
}

/// Apply the schema files to the database.
///
/// # Errors
///
/// Returns an error if the files are malformed or the changes fail.
pub async fn import(db: Option<&Path>, dir: Option<&Path>, json: bool, quiet: bool) -> Result<()> {
    let workspace = Workspace::open(db, dir)?;
    say(json, quiet, "Importing schema...");

    let applied = synchronizer(&workspace, true).load().await?;

    if json {
        println!("{}", serde_json::to_string(&json!({ "success": true, "applied": applied }))?);
    } else if !quiet {
        if !applied {
            println!("  {}", "Schema already up to date".dimmed());
        }
        println!("{}", "Done".green());
    }
    Ok(())
}
