//! Command implementations.
//!
//! Every command resolves the same [`Workspace`]: the sync root, the
//! database and the collections configured under the root.

pub mod install;
pub mod schema;
pub mod status;
pub mod sync;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{
    SyncDirection, load_collection_config, modifiers_enabled, resolve_db_path, resolve_sync_root,
};
use crate::error::{Error, Result};
use crate::storage::{Database, SqliteSchemaService, SqliteStore};
use crate::sync::{
    ExportManager, ExportMeta, SchemaOptions, SyncRuntime, UpdateManager, build_manager,
};

/// Resolved paths and an open, installed database.
#[derive(Debug)]
pub struct Workspace {
    pub root: PathBuf,
    pub db: Database,
}

impl Workspace {
    /// Open the workspace for a command that needs an installed database.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseNotFound` if the database file is missing and
    /// `NotInitialized` if `install` has not been run against it.
    pub fn open(db_path: Option<&Path>, dir: Option<&Path>) -> Result<Self> {
        let db = Database::open_existing(&resolve_db_path(db_path))?;
        if !db.is_installed()? {
            return Err(Error::NotInitialized);
        }
        Ok(Self {
            root: resolve_sync_root(dir),
            db,
        })
    }

    #[must_use]
    pub fn meta(&self) -> ExportMeta {
        ExportMeta::new(&self.root)
    }

    #[must_use]
    pub fn updates(&self) -> UpdateManager {
        UpdateManager::new(self.db.clone())
    }

    #[must_use]
    pub fn schema_service(&self) -> Arc<SqliteSchemaService> {
        Arc::new(SqliteSchemaService::new(self.db.clone()))
    }

    #[must_use]
    pub fn schema_options(&self, split: bool) -> SchemaOptions {
        SchemaOptions {
            split,
            modifiers: modifiers_enabled(),
        }
    }

    /// Schema plus every configured collection, in import order.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection config cannot be loaded.
    pub fn manager(&self) -> Result<ExportManager> {
        let collections = load_collection_config(&self.root)?;
        let store = Arc::new(SqliteStore::new(self.db.clone()));
        Ok(build_manager(
            &self.meta().data_dir(),
            &store,
            self.schema_service(),
            self.schema_options(true),
            collections,
        ))
    }

    /// Runtime with every direction enabled; CLI commands are explicit.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection config cannot be loaded.
    pub fn runtime(&self) -> Result<SyncRuntime> {
        Ok(SyncRuntime::new(
            self.meta(),
            self.updates(),
            self.manager()?,
            SyncDirection::Both,
        ))
    }
}

/// Print a progress line unless output is JSON or quiet.
pub(crate) fn say(json: bool, quiet: bool, line: &str) {
    if !json && !quiet {
        println!("{line}");
    }
}
