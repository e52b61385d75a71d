//! Grouped file partitioning.
//!
//! Large collections can be split into one file per group so that diffs stay
//! readable. The main file then holds a [`PartialManifest`] and the records
//! live in `<data>/<collection>/<prefix_><group>.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::sync::file::{clear_json_files, list_json_files, read_json, write_canonical};
use crate::sync::types::{key_string, Record, SyncError, SyncResult};

/// Group key for a record: its `fields` values joined with `-`, with every
/// non-alphanumeric character replaced by `_` so it is a safe file name.
#[must_use]
pub fn group_key(record: &Record, fields: &[String]) -> String {
    let raw: Vec<String> = fields
        .iter()
        .map(|f| record.get(f).map_or_else(|| "null".to_string(), key_string))
        .collect();
    raw.join("-")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Bucket records by group key, keeping each group's records in input order.
#[must_use]
pub fn partition(records: Vec<Record>, fields: &[String]) -> BTreeMap<String, Vec<Record>> {
    let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for record in records {
        groups.entry(group_key(&record, fields)).or_default().push(record);
    }
    groups
}

/// File name prefix, `"<prefix>_"` or empty.
#[must_use]
pub fn file_prefix(prefix: Option<&str>) -> String {
    prefix.map(|p| format!("{p}_")).unwrap_or_default()
}

/// Path of one group file.
#[must_use]
pub fn group_file(dir: &Path, prefix: &str, key: &str) -> PathBuf {
    dir.join(format!("{prefix}{key}.json"))
}

/// Replace the group files in `dir` with `groups`.
///
/// Stale files matching `prefix` are removed first so a group that vanished
/// from the store does not linger on disk.
///
/// # Errors
///
/// Returns an error if the directory cannot be cleared or a file written.
pub async fn write_groups(
    dir: &Path,
    prefix: &str,
    groups: &BTreeMap<String, Vec<Record>>,
) -> SyncResult<()> {
    let removed = clear_json_files(dir, prefix).await?;
    debug!(dir = %dir.display(), removed, groups = groups.len(), "Writing group files");

    for (key, records) in groups {
        let value = Value::Array(records.iter().cloned().map(Value::Object).collect());
        write_canonical(&group_file(dir, prefix, key), &value).await?;
    }
    Ok(())
}

/// Read and concatenate every group file in `dir` matching `prefix`.
///
/// Returns the number of files read alongside the records.
///
/// # Errors
///
/// Returns `InvalidData` if a group file does not hold an array of objects.
pub async fn read_groups(dir: &Path, prefix: &str) -> SyncResult<(usize, Vec<Record>)> {
    let files = list_json_files(dir, prefix).await?;
    let mut records = Vec::new();
    for file in &files {
        if let Some(value) = read_json(file).await? {
            records.extend(records_from_value(value, file)?);
        }
    }
    Ok((files.len(), records))
}

/// Interpret a parsed file as an array of records.
///
/// # Errors
///
/// Returns `InvalidData` if `value` is not an array of objects.
pub fn records_from_value(value: Value, path: &Path) -> SyncResult<Vec<Record>> {
    let invalid = |message: &str| SyncError::InvalidData {
        path: path.display().to_string(),
        message: message.to_string(),
    };

    let Value::Array(items) = value else {
        return Err(invalid("expected an array of records"));
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::Object(record) => Ok(record),
            _ => Err(invalid("expected every record to be an object")),
        })
        .collect()
}
