//! Error types for the schema-sync CLI.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Context-aware recovery hints
//! - Structured JSON output for piped / non-TTY consumers
//!
//! Every handled failure exits the process with status 1; the error code
//! string is what scripts should match on.

use std::path::PathBuf;
use thiserror::Error;

use crate::sync::SyncError;

/// Result type alias for schema-sync operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Database
    NotInitialized,
    DatabaseError,

    // Sync
    SyncError,
    InvalidData,

    // Config
    ConfigError,

    // I/O
    IoError,
    JsonError,

    // Internal
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::SyncError => "SYNC_ERROR",
            Self::InvalidData => "INVALID_DATA",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether re-running the same command may succeed without changes.
    ///
    /// True only for database errors, which are usually a busy lock held by
    /// another instance.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DatabaseError)
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in schema-sync CLI operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not initialized: no database configured")]
    NotInitialized,

    #[error("Database not found at {path}")]
    DatabaseNotFound { path: PathBuf },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized | Self::DatabaseNotFound { .. } => ErrorCode::NotInitialized,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Sync(err) => match err {
                SyncError::Config(_) => ErrorCode::ConfigError,
                SyncError::Database(_) => ErrorCode::DatabaseError,
                SyncError::Io(_) => ErrorCode::IoError,
                SyncError::Json(_) => ErrorCode::JsonError,
                SyncError::InvalidData { .. } | SyncError::EmptyPartial { .. } => {
                    ErrorCode::InvalidData
                }
                SyncError::Schema(_) | SyncError::FileNotFound(_) => ErrorCode::SyncError,
            },
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Process exit code for a handled failure.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        1
    }

    /// Context-aware recovery hint for humans.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::NotInitialized => Some(
                "Pass --db <path> or set SCHEMA_SYNC_DB, then run `schema-sync install`".to_string(),
            ),
            Self::DatabaseNotFound { path } => Some(format!(
                "No database at {}. Run `schema-sync install` to create the lock columns.",
                path.display()
            )),
            Self::Sync(SyncError::Config(msg)) if msg.contains("primary field") => Some(
                "Add \"keyFields\" to the collection config so records stay identifiable".to_string(),
            ),
            Self::Sync(SyncError::EmptyPartial { collection }) => Some(format!(
                "Re-export '{collection}': its manifest lists records but no group files were found"
            )),
            Self::Sync(SyncError::FileNotFound(_)) => {
                Some("Run `schema-sync export` first to create the data files.".to_string())
            }
            Self::Database(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Config(_)
            | Self::Sync(_)
            | Self::Other(_) => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": self.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_config_error_maps_to_config_code() {
        let err = Error::from(SyncError::Config(
            "Can't exclude primary field id without a key function".into(),
        ));
        assert_eq!(err.error_code(), ErrorCode::ConfigError);
        assert!(err.hint().is_some());
    }

    #[test]
    fn test_structured_json_shape() {
        let err = Error::NotInitialized;
        let json = err.to_structured_json();
        assert_eq!(json["error"]["code"], "NOT_INITIALIZED");
        assert_eq!(json["error"]["exit_code"], 1);
        assert!(json["error"]["hint"].is_string());
    }

    #[test]
    fn test_empty_partial_is_invalid_data() {
        let err = Error::from(SyncError::EmptyPartial {
            collection: "posts".into(),
        });
        assert_eq!(err.error_code().as_str(), "INVALID_DATA");
        assert!(!err.error_code().is_retryable());
    }
}
