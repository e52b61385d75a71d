//! SQLite-backed [`ItemStore`].
//!
//! Tables are collections and columns are fields. Columns declared with a
//! `JSON` type round-trip as structured values; generated columns are
//! reported as aliases so they are never exported or written.

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, params_from_iter};
use serde_json::{Map, Number, Value};
use tracing::{debug, trace};

use crate::storage::Database;
use crate::sync::events::{EventBus, event_name};
use crate::sync::service::{CollectionInfo, FieldInfo, ItemStore};
use crate::sync::types::{Query, Record, SyncResult};

/// Implicit row identifier used when a table has no single-column key.
pub const ROWID: &str = "rowid";

/// Column that orders a table when present, as the `sort` field does in
/// Directus collections.
pub const SORT_COLUMN: &str = "sort";

/// Keys per `DELETE ... IN (...)` statement.
const DELETE_CHUNK: usize = 500;

#[derive(Debug, Clone)]
struct Column {
    name: String,
    decl_type: String,
    pk: i64,
    /// 0 = normal, 1 = hidden (virtual tables), 2/3 = generated.
    hidden: i64,
}

impl Column {
    fn is_generated(&self) -> bool {
        matches!(self.hidden, 2 | 3)
    }

    fn is_json(&self) -> bool {
        self.decl_type.to_ascii_uppercase().contains("JSON")
    }
}

/// Record store over a SQLite [`Database`].
///
/// With [`SqliteStore::with_events`], successful writes emit
/// `<table>.<create|update|delete>` on the bus.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Database,
    events: Option<EventBus>,
}

impl SqliteStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db, events: None }
    }

    #[must_use]
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn emit(&self, collection: &str, action: &str) {
        if let Some(bus) = &self.events {
            bus.emit(&event_name(collection, action)).await;
        }
    }

    fn columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<Column>> {
        conn.prepare("SELECT name, COALESCE(type, ''), pk, hidden FROM pragma_table_xinfo(?1) ORDER BY cid")?
            .query_map([table], |row| {
                Ok(Column {
                    name: row.get(0)?,
                    decl_type: row.get(1)?,
                    pk: row.get(2)?,
                    hidden: row.get(3)?,
                })
            })?
            .collect()
    }

    fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
            [table],
            |row| row.get::<_, i64>(0),
        )
        .map(|count| count > 0)
    }

    fn primary_of(columns: &[Column]) -> String {
        let keys: Vec<&Column> = columns.iter().filter(|c| c.pk > 0).collect();
        match keys.as_slice() {
            [only] => only.name.clone(),
            _ => ROWID.to_string(),
        }
    }

    fn insert_record(
        conn: &Connection,
        table: &str,
        columns: &[Column],
        primary: &str,
        record: &Record,
    ) -> rusqlite::Result<Value> {
        let writable: Vec<(&String, &Value)> = record
            .iter()
            .filter(|(name, _)| !columns.iter().any(|c| &c.name == *name && c.is_generated()))
            .collect();

        if writable.is_empty() {
            conn.execute(&format!("INSERT INTO {} DEFAULT VALUES", quote(table)), [])?;
        } else {
            let names: Vec<String> = writable.iter().map(|(name, _)| quote(name)).collect();
            let placeholders = vec!["?"; writable.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({placeholders})",
                quote(table),
                names.join(", ")
            );
            trace!(sql = %sql, "Insert");
            let params = writable.iter().map(|(name, v)| column_sql(columns, name, v));
            conn.execute(&sql, params_from_iter(params))?;
        }

        Ok(match record.get(primary) {
            Some(value) if !value.is_null() => value.clone(),
            _ => Value::from(conn.last_insert_rowid()),
        })
    }
}

impl ItemStore for SqliteStore {
    async fn collection_info(&self, collection: &str) -> SyncResult<Option<CollectionInfo>> {
        let columns = self.db.read(|conn| {
            if !Self::table_exists(conn, collection)? {
                return Ok(None);
            }
            Self::columns(conn, collection).map(Some)
        })?;

        Ok(columns.map(|columns| CollectionInfo {
            collection: collection.to_string(),
            primary: Self::primary_of(&columns),
            sort_field: columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(SORT_COLUMN) && !c.is_generated())
                .map(|c| c.name.clone()),
            fields: columns
                .iter()
                .map(|c| FieldInfo {
                    name: c.name.clone(),
                    alias: c.is_generated(),
                })
                .collect(),
        }))
    }

    async fn read_by_query(&self, collection: &str, query: &Query) -> SyncResult<Vec<Record>> {
        let records = self.db.read(|conn| {
            let columns = Self::columns(conn, collection)?;
            let mut params = Vec::new();

            let selected = match &query.fields {
                Some(fields) if !fields.is_empty() => fields.clone(),
                _ => columns.iter().map(|c| c.name.clone()).collect(),
            };
            let mut sql = format!(
                "SELECT {} FROM {}",
                selected.iter().map(|f| quote(f)).collect::<Vec<_>>().join(", "),
                quote(collection)
            );

            if let Some(filter) = &query.filter {
                let clause = compile_filter(filter, &mut params);
                if !clause.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&clause);
                }
            }

            if let Some(sort) = query.sort.as_ref().filter(|s| !s.is_empty()) {
                let order: Vec<String> = sort
                    .iter()
                    .map(|field| match field.strip_prefix('-') {
                        Some(desc) => format!("{} DESC", quote(desc)),
                        None => format!("{} ASC", quote(field)),
                    })
                    .collect();
                sql.push_str(" ORDER BY ");
                sql.push_str(&order.join(", "));
            }

            if let Some(limit) = query.limit.filter(|l| *l >= 0) {
                sql.push_str(&format!(" LIMIT {limit}"));
            }

            trace!(sql = %sql, params = params.len(), "Query");
            let json_columns: Vec<bool> = selected
                .iter()
                .map(|f| columns.iter().any(|c| &c.name == f && c.is_json()))
                .collect();

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
                let mut record = Map::new();
                for (idx, name) in selected.iter().enumerate() {
                    record.insert(name.clone(), from_sql(row.get_ref(idx)?, json_columns[idx]));
                }
                Ok(record)
            })?;
            rows.collect::<rusqlite::Result<Vec<Record>>>()
        })?;

        debug!(collection, count = records.len(), "Read records");
        Ok(records)
    }

    async fn create_one(&self, collection: &str, record: Record) -> SyncResult<Value> {
        let id = self.db.mutate("create_one", |tx| {
            let columns = Self::columns(tx, collection)?;
            let primary = Self::primary_of(&columns);
            Self::insert_record(tx, collection, &columns, &primary, &record)
        })?;
        self.emit(collection, "create").await;
        Ok(id)
    }

    async fn create_many(&self, collection: &str, records: Vec<Record>) -> SyncResult<Vec<Value>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self.db.mutate("create_many", |tx| {
            let columns = Self::columns(tx, collection)?;
            let primary = Self::primary_of(&columns);
            records
                .iter()
                .map(|record| Self::insert_record(tx, collection, &columns, &primary, record))
                .collect::<rusqlite::Result<Vec<Value>>>()
        })?;
        self.emit(collection, "create").await;
        Ok(ids)
    }

    async fn update_one(&self, collection: &str, key: &Value, diff: Record) -> SyncResult<()> {
        if diff.is_empty() {
            return Ok(());
        }

        self.db.mutate("update_one", |tx| {
            let columns = Self::columns(tx, collection)?;
            let primary = Self::primary_of(&columns);
            let assignments: Vec<String> = diff.keys().map(|name| format!("{} = ?", quote(name))).collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = ?",
                quote(collection),
                assignments.join(", "),
                quote(&primary)
            );
            trace!(sql = %sql, "Update");
            let params = diff
                .iter()
                .map(|(name, v)| column_sql(&columns, name, v))
                .chain(std::iter::once(to_sql(key)));
            tx.execute(&sql, params_from_iter(params))
        })?;
        self.emit(collection, "update").await;
        Ok(())
    }

    async fn delete_many(&self, collection: &str, keys: &[Value]) -> SyncResult<()> {
        if keys.is_empty() {
            return Ok(());
        }

        self.db.mutate("delete_many", |tx| {
            let primary = Self::primary_of(&Self::columns(tx, collection)?);
            for chunk in keys.chunks(DELETE_CHUNK) {
                let sql = format!(
                    "DELETE FROM {} WHERE {} IN ({})",
                    quote(collection),
                    quote(&primary),
                    vec!["?"; chunk.len()].join(", ")
                );
                tx.execute(&sql, params_from_iter(chunk.iter().map(to_sql)))?;
            }
            Ok(())
        })?;
        self.emit(collection, "delete").await;
        Ok(())
    }
}

/// Quote an identifier. The implicit rowid stays bare so it keeps resolving
/// to the row identifier.
pub(crate) fn quote(identifier: &str) -> String {
    if identifier.eq_ignore_ascii_case(ROWID) {
        return ROWID.to_string();
    }
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// JSON value to SQLite value. Booleans become integers, arrays and objects
/// are stored as JSON text.
fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// [`to_sql`] for a value bound to `name`. JSON columns always hold JSON
/// text, so a string scalar keeps its quotes and reads back as a string.
fn column_sql(columns: &[Column], name: &str, value: &Value) -> SqlValue {
    let json_column = columns.iter().any(|c| c.name == name && c.is_json());
    if json_column && !value.is_null() {
        SqlValue::Text(value.to_string())
    } else {
        to_sql(value)
    }
}

fn from_sql(value: ValueRef<'_>, json_column: bool) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            if json_column {
                if let Ok(parsed) = serde_json::from_str(&text) {
                    return parsed;
                }
            }
            Value::String(text.into_owned())
        }
        ValueRef::Blob(bytes) => {
            Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect())
        }
    }
}

/// Compile a `{field: {_op: value}}` filter into a WHERE clause.
///
/// Unknown operators are ignored; an empty filter compiles to an empty
/// string.
fn compile_filter(filter: &Map<String, Value>, params: &mut Vec<SqlValue>) -> String {
    let mut clauses = Vec::new();

    for (key, value) in filter {
        match key.as_str() {
            "_and" | "_or" => {
                let joiner = if key == "_and" { " AND " } else { " OR " };
                let parts: Vec<String> = value
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_object)
                    .map(|sub| compile_filter(sub, params))
                    .filter(|c| !c.is_empty())
                    .collect();
                if !parts.is_empty() {
                    clauses.push(format!("({})", parts.join(joiner)));
                }
            }
            field => {
                let Some(ops) = value.as_object() else {
                    continue;
                };
                for (op, operand) in ops {
                    if let Some(clause) = compile_op(field, op, operand, params) {
                        clauses.push(clause);
                    }
                }
            }
        }
    }

    clauses.join(" AND ")
}

fn compile_op(field: &str, op: &str, operand: &Value, params: &mut Vec<SqlValue>) -> Option<String> {
    let column = quote(field);
    let comparison = |sql_op: &str, params: &mut Vec<SqlValue>| {
        params.push(to_sql(operand));
        format!("{column} {sql_op} ?")
    };

    Some(match op {
        "_eq" if operand.is_null() => format!("{column} IS NULL"),
        "_neq" if operand.is_null() => format!("{column} IS NOT NULL"),
        "_eq" => comparison("=", params),
        "_neq" => format!("({column} IS NULL OR {})", comparison("<>", params)),
        "_gt" => comparison(">", params),
        "_gte" => comparison(">=", params),
        "_lt" => comparison("<", params),
        "_lte" => comparison("<=", params),
        "_in" | "_nin" => {
            let values = operand.as_array().map(Vec::as_slice).unwrap_or_default();
            if values.is_empty() {
                return Some(if op == "_in" { "0".into() } else { "1".into() });
            }
            params.extend(values.iter().map(to_sql));
            let placeholders = vec!["?"; values.len()].join(", ");
            if op == "_in" {
                format!("{column} IN ({placeholders})")
            } else {
                format!("({column} IS NULL OR {column} NOT IN ({placeholders}))")
            }
        }
        "_null" | "_nnull" => {
            let wants_null = (op == "_null") == operand.as_bool().unwrap_or(true);
            if wants_null {
                format!("{column} IS NULL")
            } else {
                format!("{column} IS NOT NULL")
            }
        }
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn store() -> SqliteStore {
        let db = Database::open_memory().unwrap();
        db.mutate("setup", |tx| {
            tx.execute_batch(
                "CREATE TABLE posts (
                    id INTEGER PRIMARY KEY,
                    title TEXT NOT NULL,
                    tags JSON,
                    parent INTEGER,
                    slug TEXT GENERATED ALWAYS AS (lower(title)) VIRTUAL
                 );
                 CREATE TABLE pairs (a TEXT, b TEXT, PRIMARY KEY (a, b));",
            )
        })
        .unwrap();
        SqliteStore::new(db)
    }

    fn all() -> Query {
        Query {
            sort: Some(vec!["id".into()]),
            limit: Some(-1),
            ..Query::default()
        }
    }

    #[tokio::test]
    async fn test_collection_info() {
        let store = store();
        let info = store.collection_info("posts").await.unwrap().unwrap();
        assert_eq!(info.primary, "id");
        let slug = info.fields.iter().find(|f| f.name == "slug").unwrap();
        assert!(slug.alias);
        assert!(!info.fields.iter().find(|f| f.name == "title").unwrap().alias);

        let pairs = store.collection_info("pairs").await.unwrap().unwrap();
        assert_eq!(pairs.primary, ROWID);

        assert!(store.collection_info("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_and_read_round_trip_types() {
        let store = store();
        let id = store
            .create_one("posts", record(json!({"title": "Hello", "tags": ["a", "b"], "slug": "x"})))
            .await
            .unwrap();
        assert_eq!(id, json!(1));

        let rows = store.read_by_query("posts", &all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["tags"], json!(["a", "b"]));
        assert_eq!(rows[0]["slug"], json!("hello"));
        assert_eq!(rows[0]["parent"], Value::Null);
    }

    #[tokio::test]
    async fn test_json_scalars_keep_their_type() {
        let store = store();
        store
            .create_one("posts", record(json!({"id": 1, "title": "a", "tags": "123"})))
            .await
            .unwrap();
        store
            .create_one("posts", record(json!({"id": 2, "title": "b", "tags": 7})))
            .await
            .unwrap();

        let rows = store.read_by_query("posts", &all()).await.unwrap();
        assert_eq!(rows[0]["tags"], json!("123"));
        assert_eq!(rows[1]["tags"], json!(7));

        store
            .update_one("posts", &json!(2), record(json!({"tags": "true"})))
            .await
            .unwrap();
        let rows = store.read_by_query("posts", &all()).await.unwrap();
        assert_eq!(rows[1]["tags"], json!("true"));

        let raw: String = store
            .database()
            .read(|conn| conn.query_row("SELECT tags FROM posts WHERE id = 1", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(raw, "\"123\"");
    }

    #[tokio::test]
    async fn test_sort_column_is_reported() {
        let store = store();
        store
            .database()
            .mutate("setup", |tx| {
                tx.execute_batch("CREATE TABLE pages (id INTEGER PRIMARY KEY, sort INTEGER)")
            })
            .unwrap();

        let pages = store.collection_info("pages").await.unwrap().unwrap();
        assert_eq!(pages.sort_field.as_deref(), Some("sort"));
        let posts = store.collection_info("posts").await.unwrap().unwrap();
        assert!(posts.sort_field.is_none());
    }

    #[tokio::test]
    async fn test_create_many_keeps_explicit_keys() {
        let store = store();
        let ids = store
            .create_many(
                "posts",
                vec![
                    record(json!({"id": 10, "title": "a"})),
                    record(json!({"title": "b"})),
                ],
            )
            .await
            .unwrap();
        assert_eq!(ids, vec![json!(10), json!(11)]);
    }

    #[tokio::test]
    async fn test_filters_sort_and_limit() {
        let store = store();
        for (title, parent) in [("a", None), ("b", Some(1)), ("c", Some(1)), ("d", Some(2))] {
            store
                .create_one("posts", record(json!({"title": title, "parent": parent})))
                .await
                .unwrap();
        }

        let titles = |rows: Vec<Record>| -> Vec<String> {
            rows.iter().map(|r| r["title"].as_str().unwrap().to_string()).collect()
        };

        let query = Query {
            fields: Some(vec!["title".into()]),
            filter: Some(record(json!({"parent": {"_eq": 1}}))),
            sort: Some(vec!["-title".into()]),
            limit: Some(-1),
        };
        assert_eq!(titles(store.read_by_query("posts", &query).await.unwrap()), vec!["c", "b"]);

        let query = Query {
            filter: Some(record(json!({"parent": {"_neq": 1}}))),
            ..all()
        };
        assert_eq!(titles(store.read_by_query("posts", &query).await.unwrap()), vec!["a", "d"]);

        let query = Query {
            filter: Some(record(json!({"_or": [
                {"parent": {"_null": true}},
                {"title": {"_in": ["d"]}}
            ]}))),
            ..all()
        };
        assert_eq!(titles(store.read_by_query("posts", &query).await.unwrap()), vec!["a", "d"]);

        let query = Query {
            filter: Some(record(json!({"title": {"_nin": []}, "id": {"_gte": 2}}))),
            limit: Some(2),
            ..all()
        };
        assert_eq!(titles(store.read_by_query("posts", &query).await.unwrap()), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = store();
        store.create_one("posts", record(json!({"title": "a"}))).await.unwrap();
        store.create_one("posts", record(json!({"title": "b"}))).await.unwrap();

        store
            .update_one("posts", &json!(1), record(json!({"title": "A", "tags": {"k": true}})))
            .await
            .unwrap();
        store.delete_many("posts", &[json!(2)]).await.unwrap();

        let rows = store.read_by_query("posts", &all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], json!("A"));
        assert_eq!(rows[0]["tags"], json!({"k": true}));
    }

    #[tokio::test]
    async fn test_rowid_addressing() {
        let store = store();
        store
            .create_many(
                "pairs",
                vec![record(json!({"a": "x", "b": "1"})), record(json!({"a": "y", "b": "2"}))],
            )
            .await
            .unwrap();

        let query = Query {
            fields: Some(vec!["a".into(), ROWID.into()]),
            sort: Some(vec![ROWID.into()]),
            limit: Some(-1),
            ..Query::default()
        };
        let rows = store.read_by_query("pairs", &query).await.unwrap();
        assert_eq!(rows[1]["rowid"], json!(2));

        store.delete_many("pairs", &[json!(1)]).await.unwrap();
        let rows = store.read_by_query("pairs", &query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["a"], json!("y"));
    }

    #[tokio::test]
    async fn test_writes_emit_events() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for action in ["create", "update", "delete"] {
            let seen = Arc::clone(&seen);
            bus.on(
                event_name("posts", action),
                Arc::new(move |_: &str| -> crate::sync::types::BoxFuture<'static, ()> {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async {})
                }),
            );
        }

        let store = store().with_events(bus);
        store.create_one("posts", record(json!({"title": "a"}))).await.unwrap();
        store.update_one("posts", &json!(1), record(json!({"title": "b"}))).await.unwrap();
        store.update_one("posts", &json!(1), Record::new()).await.unwrap();
        store.delete_many("posts", &[json!(1)]).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("title"), "\"title\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote("ROWID"), "rowid");
    }
}
