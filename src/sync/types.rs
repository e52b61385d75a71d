//! Sync types shared by the exporters and importers.
//!
//! Records are opaque JSON objects; everything a collection needs to know
//! about them is carried by its [`CollectionSpec`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One row of a collection.
pub type Record = Map<String, Value>;

/// Boxed future used at the object-safe seams (synchronizers, event handlers).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Deferred deletion step returned by an import.
///
/// Nothing runs until the future is awaited, which lets the orchestrator
/// hold every collection's deletions until all inserts and updates are done.
pub type FinishAction = BoxFuture<'static, SyncResult<()>>;

/// Render a key value as the string used for identity comparisons.
///
/// Strings are taken verbatim, everything else uses its JSON text, so the
/// number `1` and the string `"1"` identify the same record.
#[must_use]
pub fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Derives the identity of a record inside its collection.
pub trait KeyStrategy: Send + Sync {
    /// Return the record's key, or `None` when it cannot be identified.
    fn derive_key(&self, record: &Record) -> Option<String>;
}

/// Key taken from a single declared field (the primary key by default).
#[derive(Debug, Clone)]
pub struct FieldKey(pub String);

impl KeyStrategy for FieldKey {
    fn derive_key(&self, record: &Record) -> Option<String> {
        record
            .get(&self.0)
            .filter(|v| !v.is_null())
            .map(key_string)
    }
}

/// Composite business key built from several fields.
///
/// Missing values render as `null`, so `{collection: "a"}` keyed on
/// `["collection", "field"]` becomes `a-null`.
#[derive(Debug, Clone)]
pub struct CompositeKey {
    pub fields: Vec<String>,
    pub separator: String,
}

impl KeyStrategy for CompositeKey {
    fn derive_key(&self, record: &Record) -> Option<String> {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|f| record.get(f).map_or_else(|| "null".to_string(), key_string))
            .collect();
        Some(parts.join(&self.separator))
    }
}

/// Key function backed by a closure.
pub struct FnKey<F>(pub F);

impl<F> KeyStrategy for FnKey<F>
where
    F: Fn(&Record) -> Option<String> + Send + Sync,
{
    fn derive_key(&self, record: &Record) -> Option<String> {
        (self.0)(record)
    }
}

/// Per-record transforms applied on the way out and on the way in.
///
/// Returning `None` drops the record.
pub trait RecordHooks: Send + Sync {
    fn on_export(&self, record: Record) -> Option<Record> {
        Some(record)
    }

    fn on_import(&self, record: Record) -> Option<Record> {
        Some(record)
    }
}

/// Read query understood by an [`ItemStore`](crate::sync::ItemStore).
///
/// `filter` uses the `{field: {_op: value}}` shape, with `_and` / `_or`
/// arrays for grouping. A negative `limit` means "no limit".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Query {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

/// Configuration for one synchronized collection.
///
/// Deserializable from the JSON config files; key and hook strategies that
/// need code are attached with [`CollectionSpec::with_key`] and
/// [`CollectionSpec::with_hooks`].
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectionSpec {
    /// Change-event names that trigger an export of this collection.
    pub watch: Vec<String>,
    /// Fields left out of the export and the comparison.
    pub exclude_fields: Vec<String>,
    /// Self-referencing fields used to order dependent inserts.
    pub linked_fields: Vec<String>,
    /// Fields whose values split the export into one file per group.
    pub group_by: Vec<String>,
    /// Fields forming a composite key when the primary key is excluded.
    pub key_fields: Vec<String>,
    /// Separator for `key_fields`, `-` by default.
    pub key_separator: Option<String>,
    /// Extra filter/sort/limit for the export query.
    pub query: Query,
    /// File name prefix, `<prefix>_<collection>.json`.
    pub prefix: Option<String>,
    #[serde(skip)]
    pub key: Option<Arc<dyn KeyStrategy>>,
    #[serde(skip)]
    pub hooks: Option<Arc<dyn RecordHooks>>,
}

impl fmt::Debug for CollectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionSpec")
            .field("watch", &self.watch)
            .field("exclude_fields", &self.exclude_fields)
            .field("linked_fields", &self.linked_fields)
            .field("group_by", &self.group_by)
            .field("key_fields", &self.key_fields)
            .field("query", &self.query)
            .field("prefix", &self.prefix)
            .field("custom_key", &self.key.is_some())
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

impl CollectionSpec {
    /// Spec watching the given event names.
    #[must_use]
    pub fn new<I, T>(watch: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            watch: watch.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn exclude(mut self, fields: &[&str]) -> Self {
        self.exclude_fields = fields.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn linked(mut self, fields: &[&str]) -> Self {
        self.linked_fields = fields.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn grouped_by(mut self, fields: &[&str]) -> Self {
        self.group_by = fields.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn keyed_by(mut self, fields: &[&str]) -> Self {
        self.key_fields = fields.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    #[must_use]
    pub fn with_key(mut self, key: Arc<dyn KeyStrategy>) -> Self {
        self.key = Some(key);
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn RecordHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// The custom key strategy, if one was declared in code or config.
    #[must_use]
    pub fn custom_key(&self) -> Option<Arc<dyn KeyStrategy>> {
        if let Some(key) = &self.key {
            return Some(Arc::clone(key));
        }
        if self.key_fields.is_empty() {
            return None;
        }
        Some(Arc::new(CompositeKey {
            fields: self.key_fields.clone(),
            separator: self.key_separator.clone().unwrap_or_else(|| "-".to_string()),
        }))
    }
}

/// Summary file written in place of the record array for grouped exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialManifest {
    pub count: usize,
    pub grouped_by: Vec<String>,
    pub partial: bool,
}

/// Counters for one collection import.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub duplicates: usize,
}

impl LoadStats {
    /// Returns true if the import changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.inserted + self.updated + self.deleted == 0
    }
}

/// Sync-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Collection configuration cannot be honoured.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Imported file has the wrong shape.
    #[error("Invalid data in {path}: {message}")]
    InvalidData {
        /// File that was being read.
        path: String,
        /// What was wrong with it.
        message: String,
    },

    /// A partial manifest was found but no grouped records.
    #[error("No records found for partial export of {collection}")]
    EmptyPartial {
        /// Collection being stitched.
        collection: String,
    },

    /// Schema snapshot, diff or apply failed.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Expected export file is missing.
    #[error("Export file not found: {0}")]
    FileNotFound(String),
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_key_string_unifies_numbers_and_strings() {
        assert_eq!(key_string(&json!(1)), "1");
        assert_eq!(key_string(&json!("1")), "1");
        assert_eq!(key_string(&json!(null)), "null");
    }

    #[test]
    fn test_field_key_missing_is_none() {
        let key = FieldKey("id".into());
        assert_eq!(key.derive_key(&record(json!({"id": 7}))), Some("7".into()));
        assert_eq!(key.derive_key(&record(json!({"name": "x"}))), None);
        assert_eq!(key.derive_key(&record(json!({"id": null}))), None);
    }

    #[test]
    fn test_composite_key() {
        let spec = CollectionSpec::new(["fields"]).keyed_by(&["collection", "field"]);
        let key = spec.custom_key().unwrap();
        let rec = record(json!({"collection": "posts", "field": "title"}));
        assert_eq!(key.derive_key(&rec), Some("posts-title".into()));
        let rec = record(json!({"collection": "posts"}));
        assert_eq!(key.derive_key(&rec), Some("posts-null".into()));
    }

    #[test]
    fn test_spec_from_json_config() {
        let spec: CollectionSpec = serde_json::from_value(json!({
            "watch": ["posts"],
            "excludeFields": ["id"],
            "keyFields": ["slug"],
            "groupBy": ["type"],
            "query": {"sort": ["slug"], "limit": 10}
        }))
        .unwrap();
        assert_eq!(spec.exclude_fields, vec!["id"]);
        assert_eq!(spec.group_by, vec!["type"]);
        assert_eq!(spec.query.limit, Some(10));
        assert!(spec.custom_key().is_some());
    }

    #[test]
    fn test_fn_key() {
        let spec = CollectionSpec::new(["x"]).with_key(Arc::new(FnKey(|r: &Record| {
            r.get("code").map(key_string)
        })));
        let key = spec.custom_key().unwrap();
        assert_eq!(key.derive_key(&record(json!({"code": "A"}))), Some("A".into()));
    }

    #[test]
    fn test_manifest_wire_format() {
        let manifest = PartialManifest {
            count: 5,
            grouped_by: vec!["type".into()],
            partial: true,
        };
        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value, json!({"count": 5, "groupedBy": ["type"], "partial": true}));
    }
}
