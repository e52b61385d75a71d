//! Configuration management.
//!
//! This module resolves where the sync files and the database live, reads
//! the environment switches and loads the collection config files.
//!
//! # Layout
//!
//! ```text
//! <root>/config.json     {"syncCustomCollections": {<name>: {...}}}
//! <root>/hash.txt        hash and timestamp of the last export
//! <root>/data/           one JSON file per collection, plus schema.json
//! ```

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sync::defaults::default_collections;
use crate::sync::types::CollectionSpec;

/// Sync root override.
pub const ROOT_ENV: &str = "SCHEMA_SYNC_PATH";
/// Database path override.
pub const DB_ENV: &str = "SCHEMA_SYNC_DB";
/// Which directions the startup hooks run: `BOTH`, `EXPORT` or `IMPORT`.
pub const DIRECTION_ENV: &str = "SCHEMA_SYNC";
/// Extra config file, relative to the sync root.
pub const EXTRA_CONFIG_ENV: &str = "SCHEMA_SYNC_CONFIG";
/// Set to `0`/`false` to skip vendor modifiers.
pub const MODIFIERS_ENV: &str = "SCHEMA_SYNC_MODIFIERS";

pub const DEFAULT_ROOT: &str = "schema-sync";
pub const DEFAULT_DB: &str = "schema-sync.db";
pub const CONFIG_FILE: &str = "config.json";

/// Collections key inside every config file.
const COLLECTIONS_KEY: &str = "syncCustomCollections";

/// Written by `install`.
///
/// Each entry maps a table name to its settings, e.g.
/// `"posts": {"watch": ["posts"], "excludeFields": ["updated_at"],
/// "query": {"filter": {"shared": {"_eq": true}}, "sort": ["published_at"]}}`.
pub const DEFAULT_CONFIG: &str = r#"{
  "syncCustomCollections": {}
}
"#;

/// Directions enabled for the startup hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncDirection {
    #[default]
    Disabled,
    Both,
    Export,
    Import,
}

impl SyncDirection {
    /// Parse a `SCHEMA_SYNC` value. Anything unrecognized disables the hooks.
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|v| v.trim().to_ascii_uppercase()).as_deref() {
            Some("BOTH") => Self::Both,
            Some("EXPORT") => Self::Export,
            Some("IMPORT") => Self::Import,
            _ => Self::Disabled,
        }
    }

    #[must_use]
    pub fn from_env() -> Self {
        Self::parse(std::env::var(DIRECTION_ENV).ok().as_deref())
    }

    #[must_use]
    pub const fn allows_export(self) -> bool {
        matches!(self, Self::Both | Self::Export)
    }

    #[must_use]
    pub const fn allows_import(self) -> bool {
        matches!(self, Self::Both | Self::Import)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Resolve the sync root.
///
/// Priority:
/// 1. Explicit `--dir`
/// 2. `SCHEMA_SYNC_PATH`
/// 3. `./schema-sync`
#[must_use]
pub fn resolve_sync_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    non_empty_env(ROOT_ENV).map_or_else(|| PathBuf::from(DEFAULT_ROOT), PathBuf::from)
}

/// Resolve the database path.
///
/// Priority:
/// 1. Explicit `--db`
/// 2. `SCHEMA_SYNC_DB`
/// 3. `./schema-sync.db`
#[must_use]
pub fn resolve_db_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    non_empty_env(DB_ENV).map_or_else(|| PathBuf::from(DEFAULT_DB), PathBuf::from)
}

/// Parse a boolean switch; unset means `default`.
#[must_use]
pub fn parse_flag(raw: Option<&str>, default: bool) -> bool {
    match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") => default,
        Some("0" | "false" | "no" | "off") => false,
        Some(_) => true,
    }
}

/// Whether vendor modifiers run (on unless `SCHEMA_SYNC_MODIFIERS` is off).
#[must_use]
pub fn modifiers_enabled() -> bool {
    parse_flag(std::env::var(MODIFIERS_ENV).ok().as_deref(), true)
}

/// Collections to synchronize, in registration order: the built-in defaults,
/// then `config.json`, then the file named by `SCHEMA_SYNC_CONFIG`.
///
/// # Errors
///
/// Returns an error if a config file cannot be read or parsed, or if the
/// extra config file is missing.
pub fn load_collection_config(root: &Path) -> Result<Vec<(String, CollectionSpec)>> {
    load_collection_config_with(root, non_empty_env(EXTRA_CONFIG_ENV).as_deref())
}

/// [`load_collection_config`] with an explicit extra config file name.
///
/// # Errors
///
/// See [`load_collection_config`].
pub fn load_collection_config_with(
    root: &Path,
    extra: Option<&str>,
) -> Result<Vec<(String, CollectionSpec)>> {
    let mut collections = default_collections();

    let main = root.join(CONFIG_FILE);
    if main.exists() {
        match read_config_file(&main)? {
            Some(custom) => merge(&mut collections, custom),
            None => debug!(path = %main.display(), "No custom collections configured"),
        }
    }

    if let Some(extra) = extra {
        let path = root.join(extra);
        if !path.exists() {
            return Err(Error::Config(format!(
                "Additional config file {} not found",
                path.display()
            )));
        }
        match read_config_file(&path)? {
            Some(custom) => merge(&mut collections, custom),
            None => warn!(
                path = %path.display(),
                "Additional config specified but not exporting \"syncCustomCollections\""
            ),
        }
    }

    Ok(collections)
}

fn read_config_file(path: &Path) -> Result<Option<Vec<(String, CollectionSpec)>>> {
    let content = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&content)?;
    let Some(custom) = value.get(COLLECTIONS_KEY).and_then(Value::as_object) else {
        return Ok(None);
    };
    parse_collections(custom, path).map(Some)
}

fn parse_collections(
    custom: &Map<String, Value>,
    path: &Path,
) -> Result<Vec<(String, CollectionSpec)>> {
    custom
        .iter()
        .map(|(name, spec)| {
            serde_json::from_value::<CollectionSpec>(spec.clone())
                .map(|spec| (name.clone(), spec))
                .map_err(|e| {
                    Error::Config(format!("Invalid config for '{name}' in {}: {e}", path.display()))
                })
        })
        .collect()
}

/// Append `custom`; a name registered again replaces the earlier entry in
/// place.
fn merge(collections: &mut Vec<(String, CollectionSpec)>, custom: Vec<(String, CollectionSpec)>) {
    for (name, spec) in custom {
        match collections.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = spec,
            None => collections.push((name, spec)),
        }
    }
}
