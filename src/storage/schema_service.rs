//! SQLite implementation of [`SchemaService`].
//!
//! Tables map to collections, columns to fields and foreign keys to
//! relations. Each collection keeps its `CREATE TABLE` statement, so a new
//! table is recreated exactly as it was exported. SQLite cannot alter a
//! column or a foreign key in place; such changes are logged and skipped.

use std::collections::{BTreeMap, HashSet};

use rusqlite::{Connection, Transaction};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::storage::Database;
use crate::storage::migrations::INTERNAL_TABLES;
use crate::storage::store::quote;
use crate::sync::service::{
    DiffEntry, DiffKind, DiffOp, SchemaService, Snapshot, SnapshotCollection, SnapshotDiff,
    SnapshotField, SnapshotRelation,
};
use crate::sync::types::{SyncError, SyncResult};

pub const VENDOR: &str = "sqlite";
pub const SNAPSHOT_VERSION: u32 = 1;

/// Schema snapshots of a SQLite [`Database`].
#[derive(Debug, Clone)]
pub struct SqliteSchemaService {
    db: Database,
}

impl SqliteSchemaService {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn tables(conn: &Connection) -> rusqlite::Result<Vec<(String, Option<String>)>> {
        let tables: Vec<(String, Option<String>)> = conn
            .prepare(
                "SELECT name, sql FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )?
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(tables
            .into_iter()
            .filter(|(name, _)| !INTERNAL_TABLES.contains(&name.as_str()))
            .collect())
    }

    fn fields(conn: &Connection, table: &str) -> rusqlite::Result<Vec<SnapshotField>> {
        conn.prepare(
            "SELECT name, COALESCE(type, ''), \"notnull\", dflt_value, pk, hidden
             FROM pragma_table_xinfo(?1) ORDER BY cid",
        )?
        .query_map([table], |row| {
            let name: String = row.get(0)?;
            let data_type: String = row.get(1)?;
            let not_null: bool = row.get(2)?;
            let default_value: Option<String> = row.get(3)?;
            let pk: i64 = row.get(4)?;
            let hidden: i64 = row.get(5)?;
            Ok(SnapshotField {
                collection: table.to_string(),
                field: name.clone(),
                field_type: field_type(&data_type),
                meta: None,
                schema: Some(json!({
                    "name": name,
                    "table": table,
                    "data_type": data_type,
                    "default_value": default_value,
                    "is_nullable": !not_null,
                    "is_primary_key": pk > 0,
                    "is_generated": matches!(hidden, 2 | 3),
                })),
            })
        })?
        .collect()
    }

    fn relations(conn: &Connection, table: &str) -> rusqlite::Result<Vec<SnapshotRelation>> {
        conn.prepare(
            "SELECT \"from\", \"table\", \"to\", on_update, on_delete
             FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
        )?
        .query_map([table], |row| {
            let field: String = row.get(0)?;
            let related: String = row.get(1)?;
            let related_field: Option<String> = row.get(2)?;
            let on_update: String = row.get(3)?;
            let on_delete: String = row.get(4)?;
            Ok(SnapshotRelation {
                collection: table.to_string(),
                field: field.clone(),
                related_collection: Some(related.clone()),
                meta: None,
                schema: Some(json!({
                    "table": table,
                    "column": field,
                    "foreign_key_table": related,
                    "foreign_key_column": related_field,
                    "on_update": on_update,
                    "on_delete": on_delete,
                })),
            })
        })?
        .collect()
    }

    fn take_snapshot(conn: &Connection) -> rusqlite::Result<Snapshot> {
        let mut snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            vendor: VENDOR.to_string(),
            ..Snapshot::default()
        };

        for (table, sql) in Self::tables(conn)? {
            snapshot.fields.extend(Self::fields(conn, &table)?);
            snapshot.relations.extend(Self::relations(conn, &table)?);
            snapshot.collections.push(SnapshotCollection {
                collection: table.clone(),
                meta: None,
                schema: Some(json!({ "name": table, "sql": sql })),
            });
        }
        Ok(snapshot)
    }
}

/// Normalized field type from a declared column type, following SQLite's
/// affinity rules.
fn field_type(declared: &str) -> String {
    let upper = declared.to_ascii_uppercase();
    let kind = if upper.contains("JSON") {
        "json"
    } else if upper.contains("INT") {
        "integer"
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        "string"
    } else if upper.is_empty() || upper.contains("BLOB") {
        "binary"
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        "float"
    } else if upper.contains("BOOL") {
        "boolean"
    } else if upper.contains("DATE") || upper.contains("TIME") {
        "timestamp"
    } else {
        "decimal"
    };
    kind.to_string()
}

/// Compare two keyed lists, producing one entry per added, removed or
/// changed item.
fn diff_items<T, K>(
    target: &[T],
    current: &[T],
    key: K,
) -> SyncResult<Vec<DiffEntry>>
where
    T: serde::Serialize + PartialEq,
    K: Fn(&T) -> (String, Option<String>),
{
    let current_by_key: BTreeMap<_, &T> = current.iter().map(|item| (key(item), item)).collect();
    let target_keys: HashSet<_> = target.iter().map(&key).collect();
    let mut entries = Vec::new();

    for item in target {
        let (collection, field) = key(item);
        let op = match current_by_key.get(&(collection.clone(), field.clone())) {
            None => DiffOp {
                kind: DiffKind::N,
                path: Vec::new(),
                lhs: None,
                rhs: Some(serde_json::to_value(item)?),
            },
            Some(existing) if *existing != item => DiffOp {
                kind: DiffKind::E,
                path: Vec::new(),
                lhs: Some(serde_json::to_value(existing)?),
                rhs: Some(serde_json::to_value(item)?),
            },
            Some(_) => continue,
        };
        entries.push(DiffEntry {
            collection,
            field,
            diff: vec![op],
        });
    }

    for item in current {
        let (collection, field) = key(item);
        if !target_keys.contains(&(collection.clone(), field.clone())) {
            entries.push(DiffEntry {
                collection,
                field,
                diff: vec![DiffOp {
                    kind: DiffKind::D,
                    path: Vec::new(),
                    lhs: Some(serde_json::to_value(item)?),
                    rhs: None,
                }],
            });
        }
    }

    Ok(entries)
}

fn column_exists(tx: &Transaction, table: &str, column: &str) -> rusqlite::Result<bool> {
    tx.query_row(
        "SELECT COUNT(*) FROM pragma_table_xinfo(?1) WHERE name = ?2",
        [table, column],
        |row| row.get::<_, i64>(0),
    )
    .map(|count| count > 0)
}

/// `ALTER TABLE ... ADD COLUMN` for an exported field.
fn add_column_sql(field: &SnapshotField) -> String {
    let schema = field.schema.as_ref();
    let text = |key: &str| schema.and_then(|s| s.get(key)).and_then(Value::as_str);
    let flag = |key: &str| schema.and_then(|s| s.get(key)).and_then(Value::as_bool);

    let mut sql = format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote(&field.collection),
        quote(&field.field)
    );
    if let Some(data_type) = text("data_type").filter(|t| !t.is_empty()) {
        sql.push(' ');
        sql.push_str(data_type);
    }
    match text("default_value") {
        Some(default) => {
            if flag("is_nullable") == Some(false) {
                sql.push_str(" NOT NULL");
            }
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        None if flag("is_nullable") == Some(false) => {
            warn!(
                collection = %field.collection,
                field = %field.field,
                "NOT NULL column without default added as nullable"
            );
        }
        None => {}
    }
    sql
}

fn create_table_sql(collection: &SnapshotCollection, fields: &[&SnapshotField]) -> Option<String> {
    if let Some(sql) = collection
        .schema
        .as_ref()
        .and_then(|s| s.get("sql"))
        .and_then(Value::as_str)
    {
        return Some(sql.to_string());
    }
    if fields.is_empty() {
        return None;
    }

    let columns: Vec<String> = fields
        .iter()
        .map(|field| {
            let data_type = field
                .schema
                .as_ref()
                .and_then(|s| s.get("data_type"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            format!("{} {data_type}", quote(&field.field)).trim_end().to_string()
        })
        .collect();
    Some(format!(
        "CREATE TABLE {} ({})",
        quote(&collection.collection),
        columns.join(", ")
    ))
}

fn rhs<T: serde::de::DeserializeOwned>(op: &DiffOp) -> SyncResult<Option<T>> {
    op.rhs
        .clone()
        .map(serde_json::from_value)
        .transpose()
        .map_err(SyncError::from)
}

impl SchemaService for SqliteSchemaService {
    async fn snapshot(&self) -> SyncResult<Snapshot> {
        Ok(self.db.read(Self::take_snapshot)?)
    }

    async fn diff(&self, target: &Snapshot, current: &Snapshot) -> SyncResult<SnapshotDiff> {
        let diff = SnapshotDiff {
            collections: diff_items(&target.collections, &current.collections, |c| {
                (c.collection.clone(), None)
            })?,
            fields: diff_items(&target.fields, &current.fields, |f| {
                (f.collection.clone(), Some(f.field.clone()))
            })?,
            relations: diff_items(&target.relations, &current.relations, |r| {
                (r.collection.clone(), Some(r.field.clone()))
            })?,
        };
        debug!(
            collections = diff.collections.len(),
            fields = diff.fields.len(),
            relations = diff.relations.len(),
            "Computed schema diff"
        );
        Ok(diff)
    }

    async fn apply(&self, diff: &SnapshotDiff) -> SyncResult<()> {
        let mut created = Vec::new();
        let mut new_collections = Vec::new();
        let mut dropped = HashSet::new();
        for entry in &diff.collections {
            for op in &entry.diff {
                match op.kind {
                    DiffKind::N => {
                        if let Some(collection) = rhs::<SnapshotCollection>(op)? {
                            new_collections.push(collection);
                        }
                    }
                    DiffKind::D => {
                        dropped.insert(entry.collection.clone());
                    }
                    DiffKind::E => {
                        warn!(collection = %entry.collection, "Collection changes are not supported, skipping");
                    }
                }
            }
        }

        let mut new_fields = Vec::new();
        for entry in &diff.fields {
            for op in &entry.diff {
                if op.kind == DiffKind::N {
                    if let Some(field) = rhs::<SnapshotField>(op)? {
                        new_fields.push(field);
                    }
                }
            }
        }

        self.db.mutate("apply_schema", |tx| {
            for collection in &new_collections {
                let fields: Vec<&SnapshotField> = new_fields
                    .iter()
                    .filter(|f| f.collection == collection.collection)
                    .collect();
                match create_table_sql(collection, &fields) {
                    Some(sql) => {
                        tx.execute_batch(&sql)?;
                        info!(collection = %collection.collection, "Created table");
                        created.push(collection.collection.clone());
                    }
                    None => {
                        warn!(collection = %collection.collection, "No definition for new collection, skipping");
                    }
                }
            }

            for field in &new_fields {
                if dropped.contains(&field.collection)
                    || column_exists(tx, &field.collection, &field.field)?
                {
                    continue;
                }
                tx.execute_batch(&add_column_sql(field))?;
                info!(collection = %field.collection, field = %field.field, "Added column");
            }

            for entry in &diff.fields {
                let Some(field) = &entry.field else { continue };
                for op in &entry.diff {
                    match op.kind {
                        DiffKind::D if !dropped.contains(&entry.collection) => {
                            if column_exists(tx, &entry.collection, field)? {
                                tx.execute_batch(&format!(
                                    "ALTER TABLE {} DROP COLUMN {}",
                                    quote(&entry.collection),
                                    quote(field)
                                ))?;
                                info!(collection = %entry.collection, field = %field, "Dropped column");
                            }
                        }
                        DiffKind::E => {
                            warn!(collection = %entry.collection, field = %field, "Column changes are not supported, skipping");
                        }
                        _ => {}
                    }
                }
            }

            for entry in &diff.relations {
                if created.contains(&entry.collection) || dropped.contains(&entry.collection) {
                    continue;
                }
                if !entry.diff.is_empty() {
                    warn!(
                        collection = %entry.collection,
                        field = ?entry.field,
                        "Foreign key changes on existing tables are not supported, skipping"
                    );
                }
            }

            for collection in &dropped {
                tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote(collection)))?;
                info!(collection = %collection, "Dropped table");
            }
            Ok(())
        })?;
        Ok(())
    }
}
