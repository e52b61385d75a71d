//! In-memory [`ItemStore`] and [`SchemaService`] used by the unit tests.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{Value, json};

use crate::sync::service::{
    CollectionInfo, FieldInfo, ItemStore, SchemaService, Snapshot, SnapshotDiff,
};
use crate::sync::types::{Query, Record, SyncError, SyncResult, key_string};

/// A store operation, recorded in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    CreateOne(String, Value),
    CreateMany(String, usize),
    Update(String, Value),
    Delete(String, Vec<Value>),
}

#[derive(Debug)]
struct Table {
    primary: String,
    sort_field: Option<String>,
    fields: Vec<FieldInfo>,
    rows: Vec<Record>,
    next_id: i64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Table>>,
    log: Mutex<Vec<Op>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a collection. `fields` must include `primary` unless the
    /// primary is meant to be hidden.
    pub fn with_collection(self, name: &str, primary: &str, fields: &[&str]) -> Self {
        self.tables.lock().unwrap().insert(
            name.to_string(),
            Table {
                primary: primary.to_string(),
                sort_field: None,
                fields: fields
                    .iter()
                    .map(|f| FieldInfo {
                        name: (*f).to_string(),
                        alias: false,
                    })
                    .collect(),
                rows: Vec::new(),
                next_id: 1,
            },
        );
        self
    }

    /// Declare the store sort field of an existing collection.
    pub fn with_sort_field(self, name: &str, field: &str) -> Self {
        self.tables.lock().unwrap().get_mut(name).unwrap().sort_field = Some(field.to_string());
        self
    }

    /// Insert rows directly, bypassing the operation log.
    pub fn seed(&self, name: &str, rows: Vec<Value>) {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(name).unwrap();
        for row in rows {
            let mut record = row.as_object().cloned().unwrap();
            Self::assign_primary(table, &mut record);
            table.rows.push(record);
        }
    }

    pub fn rows(&self, name: &str) -> Vec<Record> {
        self.tables.lock().unwrap()[name].rows.clone()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.log.lock().unwrap().clear();
    }

    fn assign_primary(table: &mut Table, record: &mut Record) -> Value {
        let id = match record.get(&table.primary) {
            Some(Value::Number(n)) => {
                let id = n.as_i64().unwrap_or(0);
                table.next_id = table.next_id.max(id + 1);
                json!(id)
            }
            Some(v) if !v.is_null() => v.clone(),
            _ => {
                let id = table.next_id;
                table.next_id += 1;
                json!(id)
            }
        };
        record.insert(table.primary.clone(), id.clone());
        id
    }

    fn insert(&self, collection: &str, mut record: Record) -> SyncResult<Value> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .get_mut(collection)
            .ok_or_else(|| SyncError::Database(format!("no such table: {collection}")))?;
        let id = Self::assign_primary(table, &mut record);
        table.rows.push(record);
        Ok(id)
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(x), Some(y)) => key_string(x).cmp(&key_string(y)),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn matches(record: &Record, filter: &serde_json::Map<String, Value>) -> bool {
    filter.iter().all(|(field, cond)| {
        let Some(cond) = cond.as_object() else {
            return true;
        };
        cond.iter().all(|(op, expected)| match op.as_str() {
            "_eq" => record.get(field) == Some(expected),
            "_neq" => record.get(field) != Some(expected),
            _ => true,
        })
    })
}

impl ItemStore for MemoryStore {
    async fn collection_info(&self, collection: &str) -> SyncResult<Option<CollectionInfo>> {
        Ok(self.tables.lock().unwrap().get(collection).map(|t| CollectionInfo {
            collection: collection.to_string(),
            primary: t.primary.clone(),
            sort_field: t.sort_field.clone(),
            fields: t.fields.clone(),
        }))
    }

    async fn read_by_query(&self, collection: &str, query: &Query) -> SyncResult<Vec<Record>> {
        let tables = self.tables.lock().unwrap();
        let table = tables
            .get(collection)
            .ok_or_else(|| SyncError::Database(format!("no such table: {collection}")))?;

        let mut rows: Vec<Record> = table
            .rows
            .iter()
            .filter(|r| query.filter.as_ref().is_none_or(|f| matches(r, f)))
            .cloned()
            .collect();

        if let Some(sort) = &query.sort {
            rows.sort_by(|a, b| {
                sort.iter()
                    .map(|s| {
                        let (field, desc) = s.strip_prefix('-').map_or((s.as_str(), false), |f| (f, true));
                        let ord = compare(a.get(field), b.get(field));
                        if desc { ord.reverse() } else { ord }
                    })
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }
        if let Some(limit) = query.limit.and_then(|l| usize::try_from(l).ok()) {
            rows.truncate(limit);
        }
        if let Some(fields) = &query.fields {
            for row in &mut rows {
                row.retain(|k, _| fields.contains(k));
            }
        }
        Ok(rows)
    }

    async fn create_one(&self, collection: &str, record: Record) -> SyncResult<Value> {
        let id = self.insert(collection, record)?;
        self.log
            .lock()
            .unwrap()
            .push(Op::CreateOne(collection.to_string(), id.clone()));
        Ok(id)
    }

    async fn create_many(&self, collection: &str, records: Vec<Record>) -> SyncResult<Vec<Value>> {
        let count = records.len();
        let ids = records
            .into_iter()
            .map(|r| self.insert(collection, r))
            .collect::<SyncResult<Vec<_>>>()?;
        self.log
            .lock()
            .unwrap()
            .push(Op::CreateMany(collection.to_string(), count));
        Ok(ids)
    }

    async fn update_one(&self, collection: &str, key: &Value, diff: Record) -> SyncResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(collection).unwrap();
        let primary = table.primary.clone();
        if let Some(row) = table.rows.iter_mut().find(|r| r.get(&primary) == Some(key)) {
            row.extend(diff);
        }
        self.log
            .lock()
            .unwrap()
            .push(Op::Update(collection.to_string(), key.clone()));
        Ok(())
    }

    async fn delete_many(&self, collection: &str, keys: &[Value]) -> SyncResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(collection).unwrap();
        let primary = table.primary.clone();
        table
            .rows
            .retain(|r| r.get(&primary).is_none_or(|v| !keys.contains(v)));
        self.log
            .lock()
            .unwrap()
            .push(Op::Delete(collection.to_string(), keys.to_vec()));
        Ok(())
    }
}

/// Schema service holding a snapshot in memory. `apply` replaces the current
/// snapshot with the target of the last diff.
#[derive(Debug, Default)]
pub struct MemorySchema {
    current: Mutex<Snapshot>,
    target: Mutex<Option<Snapshot>>,
    applied: Mutex<Vec<SnapshotDiff>>,
}

impl MemorySchema {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            current: Mutex::new(snapshot),
            ..Self::default()
        }
    }

    pub fn current(&self) -> Snapshot {
        self.current.lock().unwrap().clone()
    }

    pub fn applied(&self) -> Vec<SnapshotDiff> {
        self.applied.lock().unwrap().clone()
    }
}

impl SchemaService for MemorySchema {
    async fn snapshot(&self) -> SyncResult<Snapshot> {
        Ok(self.current())
    }

    async fn diff(&self, target: &Snapshot, current: &Snapshot) -> SyncResult<SnapshotDiff> {
        use crate::sync::service::{DiffEntry, DiffKind, DiffOp};

        *self.target.lock().unwrap() = Some(target.clone());
        let mut diff = SnapshotDiff::default();
        for field in &target.fields {
            let existing = current
                .fields
                .iter()
                .find(|f| f.collection == field.collection && f.field == field.field);
            if existing != Some(field) {
                diff.fields.push(DiffEntry {
                    collection: field.collection.clone(),
                    field: Some(field.field.clone()),
                    diff: vec![DiffOp {
                        kind: if existing.is_some() { DiffKind::E } else { DiffKind::N },
                        path: vec![],
                        lhs: None,
                        rhs: Some(serde_json::to_value(field)?),
                    }],
                });
            }
        }
        Ok(diff)
    }

    async fn apply(&self, diff: &SnapshotDiff) -> SyncResult<()> {
        self.applied.lock().unwrap().push(diff.clone());
        if let Some(target) = self.target.lock().unwrap().take() {
            *self.current.lock().unwrap() = target;
        }
        Ok(())
    }
}
