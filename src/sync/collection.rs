//! Export and import of one collection.
//!
//! A [`CollectionSynchronizer`] owns the mapping between one store collection
//! and its JSON file(s):
//!
//! ```text
//! <data>/<prefix_><collection>.json            record array, or a partial manifest
//! <data>/<collection>/<prefix_><group>.json    one file per group (grouped exports)
//! ```
//!
//! Imports reconcile by key. Records are matched on the primary key, or on a
//! custom key when the primary is excluded from the export. Inserts and
//! updates run immediately; deletions are deferred into a [`FinishAction`] so
//! the caller can run them after every other collection has been loaded.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::sync::canonical::get_diff;
use crate::sync::condense::ActionCondenser;
use crate::sync::file::{atomic_write, clear_json_files, read_json, write_canonical};
use crate::sync::orchestrator::Synchronizer;
use crate::sync::partition::{file_prefix, partition, read_groups, records_from_value, write_groups};
use crate::sync::service::ItemStore;
use crate::sync::types::{
    BoxFuture, CollectionSpec, FieldKey, FinishAction, KeyStrategy, LoadStats, PartialManifest, Query,
    Record, SyncError, SyncResult, key_string,
};

/// Settings derived from the store's field catalogue on first use.
#[derive(Clone)]
pub struct Settings {
    /// Fields written to the export.
    pub included_fields: Vec<String>,
    /// Field used to address rows for updates and deletes.
    pub primary: String,
    /// Whether `primary` is left out of the export.
    pub primary_hidden: bool,
    /// Identity used to match file records against live records.
    pub key: Arc<dyn KeyStrategy>,
    /// Export query.
    pub query: Query,
    /// Export query plus the primary field, used when importing.
    pub query_with_primary: Query,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("included_fields", &self.included_fields)
            .field("primary", &self.primary)
            .field("primary_hidden", &self.primary_hidden)
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

struct CollectionInner<S> {
    collection: String,
    spec: CollectionSpec,
    store: Arc<S>,
    file_path: PathBuf,
    group_dir: PathBuf,
    prefix: String,
    settings: OnceCell<Settings>,
    stats: Mutex<LoadStats>,
}

/// Synchronizes one collection with its JSON file(s).
pub struct CollectionSynchronizer<S> {
    inner: Arc<CollectionInner<S>>,
    exporter: ActionCondenser,
}

impl<S: ItemStore> CollectionSynchronizer<S> {
    /// Create a synchronizer writing under `data_dir`.
    pub fn new(
        collection: impl Into<String>,
        spec: CollectionSpec,
        store: Arc<S>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        let collection = collection.into();
        let data_dir = data_dir.into();
        let prefix = file_prefix(spec.prefix.as_deref());

        let inner = Arc::new(CollectionInner {
            file_path: data_dir.join(format!("{prefix}{collection}.json")),
            group_dir: data_dir.join(&collection),
            prefix,
            collection,
            spec,
            store,
            settings: OnceCell::new(),
            stats: Mutex::new(LoadStats::default()),
        });

        let exporter = ActionCondenser::new(format!("export {}", inner.collection), {
            let inner = Arc::clone(&inner);
            move || -> BoxFuture<'static, SyncResult<()>> {
                let inner = Arc::clone(&inner);
                Box::pin(async move { inner.export_to_file().await })
            }
        });

        Self { inner, exporter }
    }

    /// Collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.inner.collection
    }

    /// Path of the main export file.
    #[must_use]
    pub fn file_path(&self) -> &std::path::Path {
        &self.inner.file_path
    }

    /// Derived settings, computed once per synchronizer.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the collection is unknown to the store or the
    /// primary key is excluded without a custom key.
    pub async fn settings(&self) -> SyncResult<&Settings> {
        self.inner.settings().await
    }

    /// Export through the condenser. Errors are logged, never returned.
    pub async fn export(&self) {
        self.exporter.trigger().await;
    }

    /// Export right away, bypassing the condenser.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or a file written.
    pub async fn export_now(&self) -> SyncResult<()> {
        self.inner.export_to_file().await
    }

    /// Import the collection's file.
    ///
    /// Returns `None` when there is nothing to import (missing or blank
    /// file), otherwise the deferred deletion step. With `merge` the
    /// deletion step does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed, a partial export has no
    /// group files, or a store write fails.
    pub async fn load(&self, merge: bool) -> SyncResult<Option<FinishAction>> {
        let Some(value) = read_json(&self.inner.file_path).await? else {
            debug!(collection = %self.inner.collection, "No export file, skipping import");
            return Ok(None);
        };

        let records = match value {
            Value::Object(obj) if obj.get("partial").and_then(Value::as_bool) == Some(true) => {
                let manifest: PartialManifest = serde_json::from_value(Value::Object(obj))
                    .map_err(|e| SyncError::InvalidData {
                        path: self.inner.file_path.display().to_string(),
                        message: e.to_string(),
                    })?;
                self.inner.load_grouped_items(&manifest).await?
            }
            other => records_from_value(other, &self.inner.file_path)?,
        };

        self.inner.load_items(records, merge).await.map(Some)
    }

    /// Counters from the most recent import.
    #[must_use]
    pub fn stats(&self) -> LoadStats {
        *self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of condensed exports started so far.
    #[must_use]
    pub fn export_runs(&self) -> usize {
        self.exporter.executions()
    }
}

impl<S: ItemStore> CollectionInner<S> {
    async fn settings(&self) -> SyncResult<&Settings> {
        self.settings.get_or_try_init(|| self.derive_settings()).await
    }

    async fn derive_settings(&self) -> SyncResult<Settings> {
        let info = self
            .store
            .collection_info(&self.collection)
            .await?
            .ok_or_else(|| {
                SyncError::Config(format!("Schema for {} not found", self.collection))
            })?;

        let excluded = &self.spec.exclude_fields;
        let included_fields: Vec<String> = info
            .fields
            .iter()
            .filter(|f| !f.alias && !excluded.contains(&f.name))
            .map(|f| f.name.clone())
            .collect();

        let primary = info.primary;
        let primary_hidden = !included_fields.contains(&primary);
        let custom_key = self.spec.custom_key();

        let key: Arc<dyn KeyStrategy> = match custom_key {
            Some(key) => key,
            None if excluded.contains(&primary) => {
                return Err(SyncError::Config(format!(
                    "Can't exclude primary field {primary} of {} without providing a key",
                    self.collection
                )));
            }
            None if primary_hidden => {
                return Err(SyncError::Config(format!(
                    "{} has no exportable primary field, declare keyFields",
                    self.collection
                )));
            }
            None => Arc::new(FieldKey(primary.clone())),
        };

        let mut query = self.spec.query.clone();
        query.fields = Some(included_fields.clone());
        if query.sort.as_ref().is_none_or(Vec::is_empty) {
            let sort = info.sort_field.clone().unwrap_or_else(|| primary.clone());
            query.sort = Some(vec![sort]);
        }
        if query.limit.is_none() {
            query.limit = Some(-1);
        }

        let mut query_with_primary = query.clone();
        if primary_hidden {
            let mut fields = included_fields.clone();
            fields.push(primary.clone());
            query_with_primary.fields = Some(fields);
        }

        debug!(
            collection = %self.collection,
            primary = %primary,
            fields = included_fields.len(),
            "Derived collection settings"
        );

        Ok(Settings {
            included_fields,
            primary,
            primary_hidden,
            key,
            query,
            query_with_primary,
        })
    }

    async fn read_export_records(&self) -> SyncResult<Vec<Record>> {
        let settings = self.settings().await?;
        let records = self
            .store
            .read_by_query(&self.collection, &settings.query)
            .await?;

        Ok(match &self.spec.hooks {
            Some(hooks) => records.into_iter().filter_map(|r| hooks.on_export(r)).collect(),
            None => records,
        })
    }

    async fn export_to_file(&self) -> SyncResult<()> {
        let records = self.read_export_records().await?;
        let grouped = !self.spec.group_by.is_empty();
        debug!(collection = %self.collection, count = records.len(), grouped, "Exporting collection");

        if records.is_empty() {
            atomic_write(&self.file_path, "").await?;
            if grouped {
                clear_json_files(&self.group_dir, &self.prefix).await?;
            }
            return Ok(());
        }

        if grouped {
            let manifest = PartialManifest {
                count: records.len(),
                grouped_by: self.spec.group_by.clone(),
                partial: true,
            };
            let groups = partition(records, &self.spec.group_by);
            write_groups(&self.group_dir, &self.prefix, &groups).await?;
            write_canonical(&self.file_path, &serde_json::to_value(&manifest)?).await
        } else {
            let array = Value::Array(records.into_iter().map(Value::Object).collect());
            write_canonical(&self.file_path, &array).await
        }
    }

    async fn load_grouped_items(&self, manifest: &PartialManifest) -> SyncResult<Vec<Record>> {
        let (files, records) = read_groups(&self.group_dir, &self.prefix).await?;

        if records.is_empty() {
            return Err(SyncError::EmptyPartial {
                collection: self.collection.clone(),
            });
        }
        if records.len() != manifest.count {
            warn!(
                collection = %self.collection,
                expected = manifest.count,
                found = records.len(),
                "Partial export count mismatch, importing what was found"
            );
        }
        info!(collection = %self.collection, files, records = records.len(), "Stitched partial export");
        Ok(records)
    }

    async fn load_items(
        self: &Arc<Self>,
        loaded: Vec<Record>,
        merge: bool,
    ) -> SyncResult<FinishAction> {
        let settings = self.settings().await?;
        let primary_of = |record: &Record| record.get(&settings.primary).cloned().unwrap_or(Value::Null);

        let live = self
            .store
            .read_by_query(&self.collection, &settings.query_with_primary)
            .await?;

        // Live records by key; the first one wins, later ones are duplicates.
        let mut live_by_key: BTreeMap<String, Record> = BTreeMap::new();
        let mut unmatched: Vec<Value> = Vec::new();
        let mut duplicates = 0;
        for record in live {
            match settings.key.derive_key(&record) {
                Some(key) if live_by_key.contains_key(&key) => {
                    warn!(
                        collection = %self.collection,
                        key = %key,
                        primary = %primary_of(&record),
                        "Will delete duplicate item"
                    );
                    duplicates += 1;
                    unmatched.push(primary_of(&record));
                }
                Some(key) => {
                    live_by_key.insert(key, record);
                }
                None => unmatched.push(primary_of(&record)),
            }
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut to_insert: Vec<Record> = Vec::new();
        let mut to_update: Vec<(Value, Record)> = Vec::new();
        for record in loaded {
            let record = match &self.spec.hooks {
                Some(hooks) => match hooks.on_import(record) {
                    Some(record) => record,
                    None => continue,
                },
                None => record,
            };

            let Some(key) = settings.key.derive_key(&record) else {
                to_insert.push(record);
                continue;
            };
            if !seen.insert(key.clone()) {
                debug!(collection = %self.collection, key = %key, "Skipping duplicate record in file");
                continue;
            }

            match live_by_key.remove(&key) {
                Some(existing) => {
                    if let Some(diff) = get_diff(&record, Some(&existing)) {
                        to_update.push((primary_of(&existing), diff));
                    }
                }
                None => to_insert.push(record),
            }
        }

        let inserted = to_insert.len();
        if !to_insert.is_empty() {
            let (ordered, dependent) =
                dependency_order(to_insert, &settings.primary, &self.spec.linked_fields);
            debug!(collection = %self.collection, count = inserted, dependent, "Inserting items");
            if dependent {
                for record in ordered {
                    self.store.create_one(&self.collection, record).await?;
                }
            } else {
                self.store.create_many(&self.collection, ordered).await?;
            }
        }

        let updated = to_update.len();
        for (primary, diff) in to_update {
            debug!(collection = %self.collection, primary = %primary, "Updating item");
            self.store.update_one(&self.collection, &primary, diff).await?;
        }

        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = LoadStats {
            inserted,
            updated,
            deleted: 0,
            duplicates,
        };

        let to_delete: Vec<Value> = if merge {
            Vec::new()
        } else {
            unmatched
                .into_iter()
                .chain(live_by_key.values().map(primary_of))
                .collect()
        };

        let inner = Arc::clone(self);
        Ok(Box::pin(async move {
            if !to_delete.is_empty() {
                debug!(collection = %inner.collection, count = to_delete.len(), "Deleting items");
                inner.store.delete_many(&inner.collection, &to_delete).await?;
            }
            inner.stats.lock().unwrap_or_else(PoisonError::into_inner).deleted = to_delete.len();
            Ok(())
        }))
    }
}

impl<S: ItemStore> Synchronizer for CollectionSynchronizer<S> {
    fn name(&self) -> &str {
        &self.inner.collection
    }

    fn export(&self) -> BoxFuture<'_, ()> {
        Box::pin(CollectionSynchronizer::export(self))
    }

    fn export_now(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(CollectionSynchronizer::export_now(self))
    }

    fn load(&self, merge: bool) -> BoxFuture<'_, SyncResult<Option<FinishAction>>> {
        Box::pin(CollectionSynchronizer::load(self, merge))
    }

    fn last_load(&self) -> Option<LoadStats> {
        Some(self.stats())
    }
}

/// Order records so that ones referenced through `linked_fields` are
/// inserted before the records referencing them.
///
/// Each record is weighted by how many records in the batch depend on it,
/// directly or transitively, and the batch is stably sorted by descending
/// weight. Returns whether any dependency was found; without one the input
/// order is kept. Cycles are tolerated.
#[must_use]
pub fn dependency_order(
    records: Vec<Record>,
    primary: &str,
    linked_fields: &[String],
) -> (Vec<Record>, bool) {
    if linked_fields.is_empty() {
        return (records, false);
    }

    let index: HashMap<String, usize> = records
        .iter()
        .enumerate()
        .filter_map(|(i, r)| {
            r.get(primary)
                .filter(|v| !v.is_null())
                .map(|v| (key_string(v), i))
        })
        .collect();

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); records.len()];
    let mut any = false;
    for (i, record) in records.iter().enumerate() {
        for field in linked_fields {
            let target = match record.get(field) {
                None | Some(Value::Null) => continue,
                // expanded relations carry the parent's primary
                Some(Value::Object(obj)) => obj.get(primary).map(key_string),
                Some(value) => Some(key_string(value)),
            };
            if let Some(&parent) = target.as_ref().and_then(|k| index.get(k)) {
                if parent != i {
                    dependents[parent].push(i);
                    any = true;
                }
            }
        }
    }

    if !any {
        return (records, false);
    }

    let weights: Vec<usize> = (0..records.len())
        .map(|i| count_dependents(i, &dependents))
        .collect();
    let mut indexed: Vec<(usize, Record)> = records.into_iter().enumerate().collect();
    indexed.sort_by(|(a, _), (b, _)| weights[*b].cmp(&weights[*a]));
    (indexed.into_iter().map(|(_, r)| r).collect(), true)
}

fn count_dependents(root: usize, dependents: &[Vec<usize>]) -> usize {
    let mut visited = HashSet::from([root]);
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        for &child in &dependents[node] {
            if visited.insert(child) {
                stack.push(child);
            }
        }
    }
    visited.len() - 1
}
