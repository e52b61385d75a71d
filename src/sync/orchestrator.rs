//! Coordination across every registered synchronizer.
//!
//! The [`ExportManager`] keeps the registration order, which is also the
//! import order: configured collections load before the schema-independent
//! ones that reference them. Deferred deletions from every collection run
//! only after all loads succeeded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::sync::collection::CollectionSynchronizer;
use crate::sync::events::{ACTIONS, EventBus, event_name};
use crate::sync::service::ItemStore;
use crate::sync::types::{BoxFuture, CollectionSpec, FinishAction, LoadStats, SyncError, SyncResult};

/// Object-safe view of a synchronizer, so collections and the schema can be
/// driven uniformly.
pub trait Synchronizer: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Condensed export; errors are logged by the condenser.
    fn export(&self) -> BoxFuture<'_, ()>;

    /// Immediate export.
    fn export_now(&self) -> BoxFuture<'_, SyncResult<()>>;

    /// Import, returning the deferred finish step if anything was loaded.
    fn load(&self, merge: bool) -> BoxFuture<'_, SyncResult<Option<FinishAction>>>;

    /// Counters of the last import, when the synchronizer keeps them.
    fn last_load(&self) -> Option<LoadStats> {
        None
    }
}

/// Callback run after a watched change has been exported.
pub type ChangeCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Entry {
    watch: Vec<String>,
    sync: Arc<dyn Synchronizer>,
}

/// Ordered registry of synchronizers.
pub struct ExportManager {
    data_dir: PathBuf,
    entries: Vec<Entry>,
}

impl std::fmt::Debug for ExportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportManager")
            .field("data_dir", &self.data_dir)
            .field("synchronizers", &self.names())
            .finish()
    }
}

impl ExportManager {
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            entries: Vec::new(),
        }
    }

    /// Directory the collection files are written to.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Register a synchronizer, triggered by the given watch names.
    pub fn add_synchronizer(&mut self, watch: Vec<String>, sync: Arc<dyn Synchronizer>) {
        debug!(name = sync.name(), watch = ?watch, "Registered synchronizer");
        self.entries.push(Entry { watch, sync });
    }

    /// Register one [`CollectionSynchronizer`] per configured collection,
    /// in the given order.
    pub fn add_collections<S, I>(&mut self, store: &Arc<S>, collections: I)
    where
        S: ItemStore,
        I: IntoIterator<Item = (String, CollectionSpec)>,
    {
        for (name, spec) in collections {
            let watch = spec.watch.clone();
            let sync = CollectionSynchronizer::new(name, spec, Arc::clone(store), &self.data_dir);
            self.add_synchronizer(watch, Arc::new(sync));
        }
    }

    /// Registered names, in import order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.sync.name()).collect()
    }

    /// Import every synchronizer in order, then run the deferred finish
    /// steps in the same order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing load or finish step. Finish steps of
    /// collections loaded before a failing one do not run.
    pub async fn load_all(&self, merge: bool) -> SyncResult<Vec<(String, Option<LoadStats>)>> {
        let mut finishers = Vec::new();
        for entry in &self.entries {
            info!(name = entry.sync.name(), merge, "Importing");
            if let Some(finish) = entry.sync.load(merge).await? {
                finishers.push((entry, finish));
            }
        }

        let mut report = Vec::with_capacity(finishers.len());
        for (entry, finish) in finishers {
            finish.await?;
            report.push((entry.sync.name().to_string(), entry.sync.last_load()));
        }
        Ok(report)
    }

    /// Export every synchronizer concurrently.
    ///
    /// # Errors
    ///
    /// Every export runs to completion; the first error seen is returned.
    pub async fn export_all(&self) -> SyncResult<()> {
        let mut set = JoinSet::new();
        for entry in &self.entries {
            let sync = Arc::clone(&entry.sync);
            set.spawn(async move {
                let result = sync.export_now().await;
                (sync.name().to_string(), result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let (name, result) = joined.map_err(|e| SyncError::Io(std::io::Error::other(e)))?;
            match result {
                Ok(()) => debug!(name = %name, "Exported"),
                Err(e) => {
                    error!(name = %name, error = %e, "Export failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Subscribe every synchronizer's condensed export to its watch events,
    /// followed by `on_change`.
    pub fn attach_all_watchers(&self, bus: &EventBus, on_change: Option<ChangeCallback>) {
        for entry in &self.entries {
            for watch in &entry.watch {
                for action in ACTIONS {
                    let sync = Arc::clone(&entry.sync);
                    let on_change = on_change.clone();
                    bus.on(
                        event_name(watch, action),
                        Arc::new(move |event: &str| -> BoxFuture<'static, ()> {
                            debug!(event, name = sync.name(), "Change detected, exporting");
                            let sync = Arc::clone(&sync);
                            let on_change = on_change.clone();
                            Box::pin(async move {
                                sync.export().await;
                                if let Some(callback) = on_change {
                                    callback().await;
                                }
                            })
                        }),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Journal(Mutex<Vec<String>>);

    impl Journal {
        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Recording {
        name: String,
        journal: Arc<Journal>,
        fail_export: bool,
        fail_load: bool,
    }

    impl Recording {
        fn new(name: &str, journal: &Arc<Journal>) -> Self {
            Self {
                name: name.to_string(),
                journal: Arc::clone(journal),
                fail_export: false,
                fail_load: false,
            }
        }
    }

    impl Synchronizer for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        fn export(&self) -> BoxFuture<'_, ()> {
            Box::pin(async move { self.journal.push(format!("export:{}", self.name)) })
        }

        fn export_now(&self) -> BoxFuture<'_, SyncResult<()>> {
            Box::pin(async move {
                self.journal.push(format!("export:{}", self.name));
                if self.fail_export {
                    Err(SyncError::Config("disk full".into()))
                } else {
                    Ok(())
                }
            })
        }

        fn load(&self, _merge: bool) -> BoxFuture<'_, SyncResult<Option<FinishAction>>> {
            Box::pin(async move {
                self.journal.push(format!("load:{}", self.name));
                if self.fail_load {
                    return Err(SyncError::Config("bad file".into()));
                }
                let journal = Arc::clone(&self.journal);
                let name = self.name.clone();
                let finish: FinishAction = Box::pin(async move {
                    journal.push(format!("finish:{name}"));
                    Ok(())
                });
                Ok(Some(finish))
            })
        }
    }

    #[tokio::test]
    async fn test_load_all_defers_finish_steps() {
        let journal = Arc::new(Journal::default());
        let mut manager = ExportManager::new("data");
        manager.add_synchronizer(vec![], Arc::new(Recording::new("a", &journal)));
        manager.add_synchronizer(vec![], Arc::new(Recording::new("b", &journal)));

        let report = manager.load_all(false).await.unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(journal.entries(), vec!["load:a", "load:b", "finish:a", "finish:b"]);
    }

    #[tokio::test]
    async fn test_load_all_stops_before_finishing_on_error() {
        let journal = Arc::new(Journal::default());
        let mut failing = Recording::new("b", &journal);
        failing.fail_load = true;

        let mut manager = ExportManager::new("data");
        manager.add_synchronizer(vec![], Arc::new(Recording::new("a", &journal)));
        manager.add_synchronizer(vec![], Arc::new(failing));

        assert!(manager.load_all(false).await.is_err());
        assert_eq!(journal.entries(), vec!["load:a", "load:b"]);
    }

    #[tokio::test]
    async fn test_export_all_runs_everything_and_reports_error() {
        let journal = Arc::new(Journal::default());
        let mut failing = Recording::new("a", &journal);
        failing.fail_export = true;

        let mut manager = ExportManager::new("data");
        manager.add_synchronizer(vec![], Arc::new(failing));
        manager.add_synchronizer(vec![], Arc::new(Recording::new("b", &journal)));

        assert!(manager.export_all().await.is_err());
        let mut entries = journal.entries();
        entries.sort();
        assert_eq!(entries, vec!["export:a", "export:b"]);
    }

    #[tokio::test]
    async fn test_watchers_export_then_notify() {
        let journal = Arc::new(Journal::default());
        let mut manager = ExportManager::new("data");
        manager.add_synchronizer(vec!["posts".into()], Arc::new(Recording::new("posts", &journal)));

        let bus = EventBus::new();
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        manager.attach_all_watchers(
            &bus,
            Some(Arc::new(move || -> BoxFuture<'static, ()> {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })),
        );

        assert_eq!(bus.handler_count("posts.create"), 1);
        assert_eq!(bus.handler_count("posts.delete"), 1);

        bus.emit("posts.update").await;
        bus.emit("tags.update").await;
        assert_eq!(journal.entries(), vec!["export:posts"]);
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }
}
