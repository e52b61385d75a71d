//! Content hashing for sync operations.
//!
//! Two kinds of hash live here:
//! - [`content_hash`]: SHA256 of a value's canonical JSON, used to fingerprint
//!   schema snapshots.
//! - [`ExportMeta`]: SHA256 over every exported file, persisted next to the
//!   data as `<hex>@<timestamp>` so instances can tell whether the files they
//!   see are newer than what the database last applied.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::sync::canonical::sort_object;
use crate::sync::file::{atomic_write, list_json_files_recursive};
use crate::sync::types::SyncResult;

/// Timestamp format stored in the hash file and the lock row.
pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Compute a SHA256 hash of a serializable value.
///
/// The value is canonicalized (object keys sorted) before hashing, so two
/// structurally equal values always hash the same.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn content_hash<T: Serialize>(value: &T) -> SyncResult<String> {
    let value = serde_json::to_value(value)?;
    let json = serde_json::to_string(&sort_object(&value))?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Check if content has changed since it was last recorded.
///
/// Returns `true` if there is no stored hash or the hashes differ.
#[must_use]
pub fn has_changed(current_hash: &str, stored_hash: Option<&str>) -> bool {
    stored_hash.is_none_or(|h| h != current_hash)
}

/// Current UTC time in the stored timestamp format.
#[must_use]
pub fn utc_ts() -> String {
    format_ts(Utc::now())
}

/// Format a timestamp the way it is persisted.
#[must_use]
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

/// Parse a persisted timestamp; RFC 3339 is accepted as well.
#[must_use]
pub fn parse_ts(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|d| d.naive_utc()))
}

/// Rewrite a timestamp in [`TS_FORMAT`], so stored values compare as text.
#[must_use]
pub fn normalize_ts(raw: &str) -> Option<String> {
    parse_ts(raw).map(|ts| ts.format(TS_FORMAT).to_string())
}

/// A content hash and the time it was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetaStamp {
    pub hash: String,
    pub ts: String,
}

impl MetaStamp {
    /// Parse `<hash>@<timestamp>`.
    ///
    /// Returns `None` if either part is empty or the timestamp is not a date.
    /// RFC 3339 timestamps come back in [`TS_FORMAT`].
    #[must_use]
    pub fn parse(content: &str) -> Option<Self> {
        let (hash, ts) = content.trim().split_once('@')?;
        if hash.is_empty() {
            return None;
        }
        Some(Self {
            hash: hash.to_string(),
            ts: normalize_ts(ts)?,
        })
    }
}

impl std::fmt::Display for MetaStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.hash, self.ts)
    }
}

/// Locations and hash bookkeeping for one sync root.
///
/// ```text
/// <root>/hash.txt          "<sha256>@<timestamp>"
/// <root>/data/*.json       exported collections and schema
/// ```
#[derive(Debug, Clone)]
pub struct ExportMeta {
    root: PathBuf,
}

impl ExportMeta {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The sync root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the exported JSON files.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Path of the persisted `hash@timestamp` file.
    #[must_use]
    pub fn hash_file(&self) -> PathBuf {
        self.root.join("hash.txt")
    }

    /// Hash every exported file, in path order.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be read.
    pub async fn compute_hash(&self) -> SyncResult<String> {
        let mut hasher = Sha256::new();
        for file in list_json_files_recursive(&self.data_dir()).await? {
            let bytes = tokio::fs::read(&file).await?;
            hasher.update(&bytes);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Recompute the hash and persist it if it changed.
    ///
    /// Returns `None` when the files are unchanged, otherwise the freshly
    /// written stamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be read or the hash file written.
    pub async fn update_export_meta(&self) -> SyncResult<Option<MetaStamp>> {
        let hash = self.compute_hash().await?;
        let previous = self.get_export_meta().await;

        if !has_changed(&hash, previous.as_ref().map(|m| m.hash.as_str())) {
            debug!(hash = %hash, "Export hash unchanged");
            return Ok(None);
        }

        let stamp = MetaStamp { hash, ts: utc_ts() };
        atomic_write(&self.hash_file(), &stamp.to_string()).await?;
        debug!(stamp = %stamp, "Export hash updated");
        Ok(Some(stamp))
    }

    /// Read the persisted stamp.
    ///
    /// Missing or malformed files mean "nothing exported yet".
    pub async fn get_export_meta(&self) -> Option<MetaStamp> {
        let content = tokio::fs::read_to_string(self.hash_file()).await.ok()?;
        MetaStamp::parse(&content)
    }
}
