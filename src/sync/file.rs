//! Atomic file operations for sync.
//!
//! This module provides safe file operations that prevent data corruption:
//! - Atomic writes: write to temp file, sync to disk, then rename
//! - Canonical JSON writing and strict JSON reading
//! - Directory listings in a stable (sorted) order

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::sync::canonical::to_canonical_json;
use crate::sync::types::{SyncError, SyncResult};

/// Write content to a file atomically.
///
/// This function:
/// 1. Writes content to a temporary file (same path with `.tmp` extension)
/// 2. Calls `fsync` to ensure data is on disk
/// 3. Atomically renames the temp file to the target path
///
/// If any step fails, the original file (if any) remains untouched.
///
/// # Errors
///
/// Returns an error if any file operation fails.
pub async fn atomic_write(path: &Path, content: &str) -> SyncResult<()> {
    let mut temp_name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        // Sync to disk before rename
        file.sync_all().await?;
    }

    fs::rename(&temp_path, path).await?;

    Ok(())
}

/// Write a value as canonical (key-sorted, pretty) JSON.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub async fn write_canonical(path: &Path, value: &Value) -> SyncResult<()> {
    atomic_write(path, &to_canonical_json(value)?).await
}

/// Read and parse a JSON file.
///
/// Returns `Ok(None)` when the file does not exist or is blank.
///
/// # Errors
///
/// Returns `InvalidData` if the content is not valid JSON.
pub async fn read_json(path: &Path) -> SyncResult<Option<Value>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if content.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| SyncError::InvalidData {
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

/// List `*.json` files directly inside `dir` whose name starts with `prefix`.
///
/// Sorted by file name. A missing directory yields an empty list.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be read.
pub async fn list_json_files(dir: &Path, prefix: &str) -> SyncResult<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(prefix)
            && name.ends_with(".json")
            && entry.file_type().await?.is_file()
        {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// List every `*.json` file under `dir`, descending into subdirectories.
///
/// Sorted by full path so the order is stable for an unchanged file set.
///
/// # Errors
///
/// Returns an error if a directory cannot be read.
pub async fn list_json_files_recursive(dir: &Path) -> SyncResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && path.extension().is_some_and(|e| e == "json") {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Remove `*.json` files in `dir` starting with `prefix`, creating `dir` if
/// it does not exist yet.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or a file removed.
pub async fn clear_json_files(dir: &Path, prefix: &str) -> SyncResult<usize> {
    fs::create_dir_all(dir).await?;
    let files = list_json_files(dir, prefix).await?;
    for file in &files {
        fs::remove_file(file).await?;
    }
    Ok(files.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("test.json");

        atomic_write(&path, "[1, 2]").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "[1, 2]");
        assert!(!temp_dir.path().join("nested").join("test.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_write_canonical_sorts_keys() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.json");

        write_canonical(&path, &json!([{"b": 1, "a": 2}])).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.find("\"a\"").unwrap() < content.find("\"b\"").unwrap());
    }

    #[tokio::test]
    async fn test_read_json_missing_and_blank() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing.json");
        assert!(read_json(&path).await.unwrap().is_none());

        std::fs::write(&path, "  \n").unwrap();
        assert!(read_json(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_json_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            read_json(&path).await,
            Err(SyncError::InvalidData { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_json_files_filters_and_sorts() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        std::fs::write(dir.join("t_b.json"), "[]").unwrap();
        std::fs::write(dir.join("t_a.json"), "[]").unwrap();
        std::fs::write(dir.join("other.json"), "[]").unwrap();
        std::fs::write(dir.join("t_c.txt"), "").unwrap();

        let files = list_json_files(dir, "t_").await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["t_a.json", "t_b.json"]);

        assert!(list_json_files(&dir.join("nope"), "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_recursive_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("z.json"), "[]").unwrap();
        std::fs::write(dir.join("sub").join("a.json"), "[]").unwrap();

        let all = list_json_files_recursive(dir).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0] < all[1]);

        assert_eq!(clear_json_files(&dir.join("sub"), "").await.unwrap(), 1);
        assert_eq!(list_json_files_recursive(dir).await.unwrap().len(), 1);
    }
}
