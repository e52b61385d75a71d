//! Process-level wiring of the sync engine.
//!
//! A [`SyncRuntime`] ties the export files, the shared lock row and the
//! registered synchronizers together:
//!
//! - on startup, import the files if they carry a hash this database has not
//!   applied yet, holding the lock while doing so
//! - afterwards, export watched collections on change and refresh the hash
//!   file (and the lock row) once the burst has settled

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use crate::config::SyncDirection;
use crate::sync::condense::ActionCondenser;
use crate::sync::events::EventBus;
use crate::sync::hash::{ExportMeta, MetaStamp};
use crate::sync::lock::UpdateManager;
use crate::sync::orchestrator::{ChangeCallback, ExportManager};
use crate::sync::schema::{SchemaOptions, SchemaSynchronizer};
use crate::sync::service::{ItemStore, SchemaService};
use crate::sync::types::{BoxFuture, CollectionSpec, SyncResult};

/// What [`SyncRuntime::startup_import`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupOutcome {
    /// Imports are switched off for this instance.
    Disabled,
    /// No hash file, nothing has been exported yet.
    NothingExported,
    /// Already applied here, or another instance holds the lock.
    Skipped,
    /// Files were imported and the stamp committed.
    Applied(MetaStamp),
}

pub struct SyncRuntime {
    meta: Arc<ExportMeta>,
    updates: Arc<UpdateManager>,
    manager: ExportManager,
    direction: SyncDirection,
    refresh: ActionCondenser,
}

impl std::fmt::Debug for SyncRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRuntime")
            .field("root", &self.meta.root())
            .field("direction", &self.direction)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl SyncRuntime {
    pub fn new(
        meta: ExportMeta,
        updates: UpdateManager,
        manager: ExportManager,
        direction: SyncDirection,
    ) -> Self {
        let meta = Arc::new(meta);
        let updates = Arc::new(updates);

        let refresh = ActionCondenser::new("update export meta", {
            let meta = Arc::clone(&meta);
            let updates = Arc::clone(&updates);
            move || -> BoxFuture<'static, SyncResult<()>> {
                let meta = Arc::clone(&meta);
                let updates = Arc::clone(&updates);
                Box::pin(async move { refresh_meta(&meta, &updates, true).await.map(|_| ()) })
            }
        });

        Self {
            meta,
            updates,
            manager,
            direction,
            refresh,
        }
    }

    #[must_use]
    pub fn meta(&self) -> &ExportMeta {
        &self.meta
    }

    #[must_use]
    pub fn updates(&self) -> &UpdateManager {
        &self.updates
    }

    #[must_use]
    pub fn manager(&self) -> &ExportManager {
        &self.manager
    }

    /// Import the exported files if this database has not applied them.
    ///
    /// The lock is released again if the import or the commit fails, so the
    /// next start can retry.
    ///
    /// # Errors
    ///
    /// Returns the import error after releasing the lock.
    pub async fn startup_import(&self) -> SyncResult<StartupOutcome> {
        let Some(stamp) = self.meta.get_export_meta().await else {
            info!("Nothing exported yet it seems");
            return Ok(StartupOutcome::NothingExported);
        };

        if !self.updates.lock_for_updates(&stamp.hash, &stamp.ts)? {
            return Ok(StartupOutcome::Skipped);
        }

        info!(hash = %stamp.hash, "Updating schema and data");
        if let Err(e) = self.manager.load_all(false).await {
            error!(error = %e, "Import failed, releasing update lock");
            if let Err(release) = self.updates.release_lock() {
                error!(error = %release, "Failed to release update lock");
            }
            return Err(e);
        }

        self.updates.commit_or_release()?;
        Ok(StartupOutcome::Applied(stamp))
    }

    /// Recompute the hash file and, with `save_to_db`, record it as applied
    /// so this instance does not re-import its own export.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be hashed or the lock row
    /// written.
    pub async fn update_meta(&self, save_to_db: bool) -> SyncResult<Option<MetaStamp>> {
        refresh_meta(&self.meta, &self.updates, save_to_db).await
    }

    /// Condensed [`SyncRuntime::update_meta`] with `save_to_db`, as run after
    /// watched changes.
    pub async fn update_meta_condensed(&self) {
        self.refresh.trigger().await;
    }

    /// Subscribe exporters to change events when exports are enabled.
    ///
    /// Returns whether anything was attached.
    pub fn attach_exporters(&self, bus: &EventBus) -> bool {
        if !self.direction.allows_export() {
            return false;
        }

        let refresh = self.refresh.clone();
        let on_change: ChangeCallback = Arc::new(move || -> BoxFuture<'static, ()> {
            let refresh = refresh.clone();
            Box::pin(async move { refresh.trigger().await })
        });
        self.manager.attach_all_watchers(bus, Some(on_change));
        info!(direction = ?self.direction, "Attached exporters");
        true
    }

    /// Startup sequence: import when enabled, then attach exporters whether
    /// or not the import succeeded.
    ///
    /// # Errors
    ///
    /// Returns the import error, after the exporters were attached.
    pub async fn start(&self, bus: &EventBus) -> SyncResult<StartupOutcome> {
        let outcome = if self.direction.allows_import() {
            self.startup_import().await
        } else {
            Ok(StartupOutcome::Disabled)
        };
        self.attach_exporters(bus);
        outcome
    }
}

/// Change events that trigger a schema export.
pub const SCHEMA_WATCH: [&str; 3] = ["collections", "fields", "relations"];

/// Register the schema first, so tables exist before their records load,
/// then every configured collection in order.
pub fn build_manager<S, C>(
    data_dir: &Path,
    store: &Arc<S>,
    schema: Arc<C>,
    options: SchemaOptions,
    collections: Vec<(String, CollectionSpec)>,
) -> ExportManager
where
    S: ItemStore,
    C: SchemaService,
{
    let mut manager = ExportManager::new(data_dir);
    manager.add_synchronizer(
        SCHEMA_WATCH.iter().map(ToString::to_string).collect(),
        Arc::new(SchemaSynchronizer::new(schema, data_dir, options)),
    );
    manager.add_collections(store, collections);
    manager
}

async fn refresh_meta(
    meta: &ExportMeta,
    updates: &UpdateManager,
    save_to_db: bool,
) -> SyncResult<Option<MetaStamp>> {
    let stamp = meta.update_export_meta().await?;
    if save_to_db {
        if let Some(stamp) = &stamp {
            if updates.lock_for_updates(&stamp.hash, &stamp.ts)? {
                updates.commit_or_release()?;
            }
        }
    }
    Ok(stamp)
}
