//! Interfaces to the live store.
//!
//! The sync engine never talks to the database directly. Records go through
//! an [`ItemStore`] and schema changes through a [`SchemaService`]; the
//! SQLite implementations live in [`crate::storage`].

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sync::hash::content_hash;
use crate::sync::types::{Query, Record, SyncResult};

/// One field of a collection as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    /// Alias fields (computed/generated) are never exported or written.
    pub alias: bool,
}

/// Field catalogue for one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub collection: String,
    /// Field identifying a row for updates and deletes. It may be absent
    /// from `fields` when the store identifies rows by an implicit key.
    pub primary: String,
    /// Field the store orders the collection by, if it declares one.
    pub sort_field: Option<String>,
    pub fields: Vec<FieldInfo>,
}

/// Record storage for the synchronized collections.
pub trait ItemStore: Send + Sync + 'static {
    /// Field catalogue, or `None` if the collection does not exist.
    fn collection_info(
        &self,
        collection: &str,
    ) -> impl Future<Output = SyncResult<Option<CollectionInfo>>> + Send;

    /// Read records matching `query`.
    fn read_by_query(
        &self,
        collection: &str,
        query: &Query,
    ) -> impl Future<Output = SyncResult<Vec<Record>>> + Send;

    /// Insert one record, returning its primary key.
    fn create_one(
        &self,
        collection: &str,
        record: Record,
    ) -> impl Future<Output = SyncResult<Value>> + Send;

    /// Insert many records in one batch, returning their primary keys.
    fn create_many(
        &self,
        collection: &str,
        records: Vec<Record>,
    ) -> impl Future<Output = SyncResult<Vec<Value>>> + Send;

    /// Apply `diff` to the record with primary key `key`.
    fn update_one(
        &self,
        collection: &str,
        key: &Value,
        diff: Record,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Delete records by primary key.
    fn delete_many(
        &self,
        collection: &str,
        keys: &[Value],
    ) -> impl Future<Output = SyncResult<()>> + Send;
}

/// Point-in-time description of the store's structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub vendor: String,
    #[serde(default)]
    pub collections: Vec<SnapshotCollection>,
    #[serde(default)]
    pub fields: Vec<SnapshotField>,
    #[serde(default)]
    pub relations: Vec<SnapshotRelation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotCollection {
    pub collection: String,
    #[serde(default)]
    pub meta: Option<Value>,
    #[serde(default)]
    pub schema: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotField {
    pub collection: String,
    pub field: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub meta: Option<Value>,
    #[serde(default)]
    pub schema: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRelation {
    pub collection: String,
    pub field: String,
    #[serde(default)]
    pub related_collection: Option<String>,
    #[serde(default)]
    pub meta: Option<Value>,
    #[serde(default)]
    pub schema: Option<Value>,
}

/// Kind of a single diff operation: new, deleted or edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffKind {
    N,
    D,
    E,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffOp {
    pub kind: DiffKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lhs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rhs: Option<Value>,
}

/// Changes to one collection, field or relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub diff: Vec<DiffOp>,
}

/// Everything needed to move the store from one snapshot to another.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    #[serde(default)]
    pub collections: Vec<DiffEntry>,
    #[serde(default)]
    pub fields: Vec<DiffEntry>,
    #[serde(default)]
    pub relations: Vec<DiffEntry>,
}

impl SnapshotDiff {
    /// Returns true if no entry carries an operation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections
            .iter()
            .chain(&self.fields)
            .chain(&self.relations)
            .all(|entry| entry.diff.is_empty())
    }
}

/// Snapshot, diff and apply for the store's structure.
pub trait SchemaService: Send + Sync + 'static {
    /// Capture the current structure.
    fn snapshot(&self) -> impl Future<Output = SyncResult<Snapshot>> + Send;

    /// Compute the changes that turn `current` into `target`.
    fn diff(
        &self,
        target: &Snapshot,
        current: &Snapshot,
    ) -> impl Future<Output = SyncResult<SnapshotDiff>> + Send;

    /// Apply a diff produced by [`SchemaService::diff`].
    fn apply(&self, diff: &SnapshotDiff) -> impl Future<Output = SyncResult<()>> + Send;

    /// Stable hash of a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be serialized.
    fn hashed_snapshot(&self, snapshot: &Snapshot) -> SyncResult<String> {
        content_hash(snapshot)
    }
}
