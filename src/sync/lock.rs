//! Cross-process update lock.
//!
//! Every instance sharing a database agrees on one row (`settings`, id 1)
//! holding the last applied export hash, its timestamp and a lock flag.
//! Acquiring the lock is a single conditional UPDATE, so at most one
//! instance wins, and only when the offered hash differs from the applied
//! one and is newer than it.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::storage::Database;
use crate::sync::hash::{MetaStamp, normalize_ts};
use crate::sync::types::SyncResult;

/// Row the lock columns live on.
const LOCK_ROW: i64 = 1;

/// Contents of the lock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockState {
    pub hash: String,
    pub ts: String,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Locking,
    /// Holding the row lock; the stamp is committed on success.
    Locked(MetaStamp),
}

/// Acquires, commits and releases the shared update lock.
#[derive(Debug)]
pub struct UpdateManager {
    db: Database,
    phase: Mutex<Phase>,
}

impl UpdateManager {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            phase: Mutex::new(Phase::Idle),
        }
    }

    /// Create the lock columns if they are missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the migrations fail.
    pub fn ensure_installed(&self) -> crate::Result<()> {
        if !self.db.is_installed()? {
            self.db.install()?;
        }
        Ok(())
    }

    /// Try to take the lock for applying `hash` recorded at `ts`.
    ///
    /// Returns `false` without touching the database when this manager is
    /// already locking or holding the lock, and `false` when the row is
    /// locked elsewhere, already at `hash`, or newer than `ts`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the database update fails.
    pub fn lock_for_updates(&self, hash: &str, ts: &str) -> SyncResult<bool> {
        let ts = stored_ts(ts);
        let ts = ts.as_str();
        {
            let mut phase = self.phase();
            if *phase != Phase::Idle {
                debug!("Lock already held or being acquired by this instance");
                return Ok(false);
            }
            *phase = Phase::Locking;
        }

        let result = self.db.mutate("lock_for_updates", |tx| {
            tx.execute(
                "UPDATE settings SET mv_locked = 1
                 WHERE id = ?1
                   AND mv_locked = 0
                   AND mv_hash <> ?2
                   AND (mv_ts IS NULL OR mv_ts < ?3)",
                rusqlite::params![LOCK_ROW, hash, ts],
            )
        });

        let mut phase = self.phase();
        match result {
            Ok(1) => {
                *phase = Phase::Locked(MetaStamp {
                    hash: hash.to_string(),
                    ts: ts.to_string(),
                });
                info!(hash, ts, "Acquired update lock");
                Ok(true)
            }
            Ok(_) => {
                *phase = Phase::Idle;
                debug!(hash, ts, "Update lock not acquired");
                Ok(false)
            }
            Err(e) => {
                *phase = Phase::Idle;
                Err(e.into())
            }
        }
    }

    /// Record the locked stamp as applied and release the lock.
    ///
    /// Returns `false` if this manager does not hold the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails; the lock stays held.
    pub fn commit_updates(&self) -> SyncResult<bool> {
        let mut phase = self.phase();
        let Phase::Locked(stamp) = &*phase else {
            return Ok(false);
        };

        self.write_stamp("commit_updates", &stamp.hash, &stamp.ts)?;
        info!(hash = %stamp.hash, ts = %stamp.ts, "Committed updates");
        *phase = Phase::Idle;
        Ok(true)
    }

    /// [`UpdateManager::commit_updates`], releasing the lock if the commit
    /// fails so the row is never left locked.
    ///
    /// # Errors
    ///
    /// Returns the commit error; a failed release is only logged.
    pub fn commit_or_release(&self) -> SyncResult<bool> {
        self.commit_updates().inspect_err(|e| {
            error!(error = %e, "Commit failed, releasing update lock");
            if let Err(release) = self.release_lock() {
                error!(error = %release, "Failed to release update lock");
            }
        })
    }

    /// Record `hash`/`ts` as applied and clear the lock, whoever held it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub fn force_commit_updates(&self, hash: &str, ts: &str) -> SyncResult<()> {
        let ts = stored_ts(ts);
        let ts = ts.as_str();
        let mut phase = self.phase();
        self.write_stamp("force_commit_updates", hash, ts)?;
        warn!(hash, ts, "Force-committed updates");
        *phase = Phase::Idle;
        Ok(())
    }

    /// Clear the lock without recording a stamp.
    ///
    /// Returns `false` if this manager does not hold the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub fn release_lock(&self) -> SyncResult<bool> {
        let mut phase = self.phase();
        if !matches!(*phase, Phase::Locked(_)) {
            return Ok(false);
        }

        self.db.mutate("release_lock", |tx| {
            tx.execute(
                "UPDATE settings SET mv_locked = 0 WHERE id = ?1",
                [LOCK_ROW],
            )
        })?;
        info!("Released update lock");
        *phase = Phase::Idle;
        Ok(true)
    }

    /// Whether this manager currently holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(*self.phase(), Phase::Locked(_))
    }

    /// Read the lock row.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be read.
    pub fn state(&self) -> SyncResult<LockState> {
        Ok(self.db.read(|conn| {
            conn.query_row(
                "SELECT mv_hash, mv_ts, mv_locked FROM settings WHERE id = ?1",
                [LOCK_ROW],
                |row| {
                    Ok(LockState {
                        hash: row.get(0)?,
                        ts: row.get(1)?,
                        locked: row.get(2)?,
                    })
                },
            )
        })?)
    }

    fn write_stamp(&self, op: &str, hash: &str, ts: &str) -> SyncResult<()> {
        self.db.mutate(op, |tx| {
            tx.execute(
                "UPDATE settings SET mv_hash = ?2, mv_ts = ?3, mv_locked = 0 WHERE id = ?1",
                rusqlite::params![LOCK_ROW, hash, ts],
            )
        })?;
        Ok(())
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Timestamps are compared as text in SQL, so they are stored in one format.
fn stored_ts(ts: &str) -> String {
    normalize_ts(ts).unwrap_or_else(|| ts.to_string())
}
