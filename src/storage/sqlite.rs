//! SQLite connection handle.
//!
//! One [`Database`] is shared by the record store, the schema service and the
//! lock manager. Writes go through [`Database::mutate`], which wraps them in
//! an IMMEDIATE transaction so concurrent instances serialize on the write
//! lock instead of failing halfway.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::trace;

use crate::error::{Error, Result};
use crate::storage::migrations::{is_installed, run_migrations};

/// Shared SQLite connection.
#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open a database at the given path, creating the file if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// Open a database with an optional busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_with_timeout(path: &Path, timeout_ms: Option<u64>) -> Result<Self> {
        let conn = Connection::open(path)?;

        if let Some(timeout) = timeout_ms {
            conn.busy_timeout(Duration::from_millis(timeout))?;
        } else {
            // Default 5 second timeout
            conn.busy_timeout(Duration::from_secs(5))?;
        }
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an existing database, failing if the file is missing.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseNotFound` if there is no file at `path`.
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::DatabaseNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::open(path)
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// File backing this database, `None` for in-memory ones.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Apply pending migrations. Returns how many were applied.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub fn install(&self) -> Result<usize> {
        Ok(run_migrations(&self.lock())?)
    }

    /// Whether the sync lock columns exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the table info cannot be read.
    pub fn is_installed(&self) -> Result<bool> {
        Ok(is_installed(&self.lock())?)
    }

    /// Run a read against the connection.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns.
    pub fn read<F, R>(&self, f: F) -> rusqlite::Result<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R>,
    {
        f(&self.lock())
    }

    /// Execute a mutation inside an IMMEDIATE transaction.
    ///
    /// The transaction commits if `f` succeeds and rolls back otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot start, `f` fails, or the
    /// commit fails.
    pub fn mutate<F, R>(&self, op: &str, f: F) -> rusqlite::Result<R>
    where
        F: FnOnce(&Transaction) -> rusqlite::Result<R>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        trace!(op, "Begin transaction");

        let result = f(&tx)?;

        tx.commit()?;
        trace!(op, "Committed");
        Ok(result)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
