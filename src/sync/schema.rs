//! Schema snapshot export and import.
//!
//! Split layout (default):
//!
//! ```text
//! <data>/schema.json               {hash, partial: true, version, vendor}
//! <data>/schema/<collection>.json  collection info with its fields and relations
//! ```
//!
//! Without splitting, `schema.json` holds the whole snapshot plus its hash.
//! Files written before the hash moved to the top level keep the snapshot
//! under a `snapshot` key; those still load.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, error, info};

use crate::sync::condense::ActionCondenser;
use crate::sync::file::{clear_json_files, list_json_files, read_json, write_canonical};
use crate::sync::orchestrator::Synchronizer;
use crate::sync::service::{
    SchemaService, Snapshot, SnapshotCollection, SnapshotField, SnapshotRelation,
};
use crate::sync::types::{BoxFuture, FinishAction, SyncError, SyncResult};
use crate::sync::vendor::ModifierRegistry;

/// How the schema is written and read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaOptions {
    /// One file per collection instead of a single snapshot file.
    pub split: bool,
    /// Run vendor modifiers on export and import.
    pub modifiers: bool,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self {
            split: true,
            modifiers: true,
        }
    }
}

struct SchemaInner<S> {
    service: Arc<S>,
    options: SchemaOptions,
    registry: ModifierRegistry,
    file_path: PathBuf,
    schema_dir: PathBuf,
}

/// Synchronizes the store's structure with `schema.json`.
pub struct SchemaSynchronizer<S> {
    inner: Arc<SchemaInner<S>>,
    exporter: ActionCondenser,
}

impl<S: SchemaService> SchemaSynchronizer<S> {
    pub fn new(service: Arc<S>, data_dir: impl Into<PathBuf>, options: SchemaOptions) -> Self {
        Self::with_registry(service, data_dir, options, ModifierRegistry::builtin())
    }

    pub fn with_registry(
        service: Arc<S>,
        data_dir: impl Into<PathBuf>,
        options: SchemaOptions,
        registry: ModifierRegistry,
    ) -> Self {
        let data_dir = data_dir.into();
        let inner = Arc::new(SchemaInner {
            service,
            options,
            registry,
            file_path: data_dir.join("schema.json"),
            schema_dir: data_dir.join("schema"),
        });

        let exporter = ActionCondenser::new("export schema", {
            let inner = Arc::clone(&inner);
            move || -> BoxFuture<'static, SyncResult<()>> {
                let inner = Arc::clone(&inner);
                Box::pin(async move { inner.create_and_save_snapshot().await })
            }
        });

        Self { inner, exporter }
    }

    /// Write the current snapshot right away.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be taken or written.
    pub async fn export_now(&self) -> SyncResult<()> {
        self.inner.create_and_save_snapshot().await
    }

    /// Apply the snapshot on disk to the store.
    ///
    /// Returns `true` if a diff was applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the files are malformed or the diff fails to apply.
    pub async fn load(&self) -> SyncResult<bool> {
        self.inner.load().await
    }
}

impl<S: SchemaService> SchemaInner<S> {
    async fn create_and_save_snapshot(&self) -> SyncResult<()> {
        let mut snapshot = self.service.snapshot().await?;
        if self.options.modifiers {
            snapshot = self.registry.apply_export(snapshot);
        }
        let hash = self.service.hashed_snapshot(&snapshot)?;

        if !self.options.split {
            let mut value = serde_json::to_value(&snapshot)?;
            if let Some(obj) = value.as_object_mut() {
                obj.insert("hash".into(), Value::String(hash.clone()));
            }
            write_canonical(&self.file_path, &value).await?;
            debug!(hash = %hash, "Exported schema");
            return Ok(());
        }

        let removed = clear_json_files(&self.schema_dir, "").await?;
        let files = split_snapshot(snapshot.clone())?;

        let header = json!({
            "hash": hash,
            "partial": true,
            "version": snapshot.version,
            "vendor": snapshot.vendor,
        });
        write_canonical(&self.file_path, &header).await?;

        for (collection, item) in &files {
            write_canonical(&self.schema_dir.join(format!("{collection}.json")), item).await?;
        }
        debug!(hash = %hash, files = files.len(), removed, "Exported split schema");
        Ok(())
    }

    /// Read `schema.json`, stitching split files. `None` means nothing to
    /// apply.
    async fn read_snapshot(&self) -> SyncResult<Option<(String, Snapshot)>> {
        let Some(value) = read_json(&self.file_path).await? else {
            return Ok(None);
        };
        let Value::Object(mut obj) = value else {
            return Err(SyncError::InvalidData {
                path: self.file_path.display().to_string(),
                message: "expected a schema object".into(),
            });
        };

        if let Some(Value::Object(legacy)) = obj.remove("snapshot") {
            let hash = obj.remove("hash");
            obj = legacy;
            if let Some(hash) = hash {
                obj.insert("hash".into(), hash);
            }
        }

        let hash = obj
            .remove("hash")
            .and_then(|h| h.as_str().map(ToString::to_string))
            .unwrap_or_default();
        let partial = obj
            .remove("partial")
            .and_then(|p| p.as_bool())
            .unwrap_or(false);
        let mut snapshot: Snapshot = serde_json::from_value(Value::Object(obj))?;

        if partial {
            let files = list_json_files(&self.schema_dir, "").await?;
            if files.is_empty() {
                error!(dir = %self.schema_dir.display(), "No schema files found in schema directory");
                return Ok(None);
            }

            snapshot.collections.clear();
            snapshot.fields.clear();
            snapshot.relations.clear();
            for file in &files {
                if let Some(value) = read_json(file).await? {
                    stitch_file(&mut snapshot, value, file)?;
                }
            }
            info!(files = files.len(), "Stitched partial schema files");

            snapshot.collections.sort_by(|a, b| a.collection.cmp(&b.collection));
            // collections without a table go first
            snapshot.collections.sort_by_key(|c| c.schema.is_some());
            snapshot.fields.sort_by(|a, b| a.collection.cmp(&b.collection));
            snapshot.relations.sort_by(|a, b| a.collection.cmp(&b.collection));
        }

        Ok(Some((hash, snapshot)))
    }

    async fn load(&self) -> SyncResult<bool> {
        let Some((hash, target)) = self.read_snapshot().await? else {
            return Ok(false);
        };

        let current = self.service.snapshot().await?;
        let current_hash = self.service.hashed_snapshot(&current)?;
        if current_hash == hash {
            debug!(hash = %hash, "Schema is already up-to-date");
            return Ok(false);
        }

        info!(current = %current_hash, target = %hash, "Diffing schema");
        let mut diff = self.service.diff(&target, &current).await?;
        if self.options.modifiers {
            diff = self.registry.apply_import(&target.vendor, diff);
        }
        if diff.is_empty() {
            info!("No schema changes to apply");
            return Ok(false);
        }

        info!("Applying schema diff");
        self.service.apply(&diff).await?;
        info!("Schema updated");
        Ok(true)
    }
}

/// Group a snapshot by collection, one JSON object per file.
fn split_snapshot(snapshot: Snapshot) -> SyncResult<BTreeMap<String, Value>> {
    let Snapshot {
        collections,
        mut fields,
        mut relations,
        ..
    } = snapshot;

    // stable file content regardless of snapshot order
    fields.sort_by(|a, b| a.field.cmp(&b.field));
    relations.sort_by(|a, b| {
        (a.related_collection.as_deref(), &a.field).cmp(&(b.related_collection.as_deref(), &b.field))
    });

    let mut map: BTreeMap<String, Map<String, Value>> = BTreeMap::new();

    for collection in &collections {
        if let Value::Object(info) = serde_json::to_value(collection)? {
            slot(&mut map, &collection.collection).extend(info);
        }
    }
    for field in &fields {
        let (collection, member) = to_member(field)?;
        push_member(slot(&mut map, &collection), "fields", member);
    }
    for relation in &relations {
        let (collection, member) = to_member(relation)?;
        push_member(slot(&mut map, &collection), "relations", member);
    }

    Ok(map.into_iter().map(|(k, v)| (k, Value::Object(v))).collect())
}

fn slot<'m>(
    map: &'m mut BTreeMap<String, Map<String, Value>>,
    collection: &str,
) -> &'m mut Map<String, Value> {
    map.entry(collection.to_string()).or_insert_with(|| {
        let mut item = Map::new();
        item.insert("collection".into(), Value::String(collection.to_string()));
        item.insert("fields".into(), Value::Array(Vec::new()));
        item.insert("relations".into(), Value::Array(Vec::new()));
        item
    })
}

fn push_member(item: &mut Map<String, Value>, kind: &str, member: Value) {
    if let Some(Value::Array(list)) = item.get_mut(kind) {
        list.push(member);
    }
}

/// Serialize a field or relation without its `collection` key.
fn to_member<T: serde::Serialize + HasCollection>(item: &T) -> SyncResult<(String, Value)> {
    let mut value = serde_json::to_value(item)?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("collection");
    }
    Ok((item.collection().to_string(), value))
}

trait HasCollection {
    fn collection(&self) -> &str;
}

impl HasCollection for SnapshotField {
    fn collection(&self) -> &str {
        &self.collection
    }
}

impl HasCollection for SnapshotRelation {
    fn collection(&self) -> &str {
        &self.collection
    }
}

fn stitch_file(snapshot: &mut Snapshot, value: Value, path: &std::path::Path) -> SyncResult<()> {
    let invalid = |message: String| SyncError::InvalidData {
        path: path.display().to_string(),
        message,
    };
    let Value::Object(mut obj) = value else {
        return Err(invalid("expected a collection object".into()));
    };

    let fields = take_array(&mut obj, "fields");
    let relations = take_array(&mut obj, "relations");
    let info: SnapshotCollection =
        serde_json::from_value(Value::Object(obj)).map_err(|e| invalid(e.to_string()))?;

    let with_collection = |mut member: Value| {
        if let Some(obj) = member.as_object_mut() {
            obj.insert("collection".into(), Value::String(info.collection.clone()));
        }
        member
    };
    for field in fields {
        snapshot.fields.push(
            serde_json::from_value(with_collection(field)).map_err(|e| invalid(e.to_string()))?,
        );
    }
    for relation in relations {
        snapshot.relations.push(
            serde_json::from_value(with_collection(relation)).map_err(|e| invalid(e.to_string()))?,
        );
    }

    // group-only entries without meta or schema carry nothing to create
    if info.meta.is_some() || info.schema.is_some() {
        snapshot.collections.push(info);
    }
    Ok(())
}

fn take_array(obj: &mut Map<String, Value>, key: &str) -> Vec<Value> {
    match obj.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

impl<S: SchemaService> Synchronizer for SchemaSynchronizer<S> {
    fn name(&self) -> &str {
        "schema"
    }

    fn export(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.exporter.trigger())
    }

    fn export_now(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(SchemaSynchronizer::export_now(self))
    }

    fn load(&self, _merge: bool) -> BoxFuture<'_, SyncResult<Option<FinishAction>>> {
        Box::pin(async move {
            SchemaSynchronizer::load(self).await?;
            Ok(None)
        })
    }
}
