//! Database migrations embedded at compile time.
//!
//! Migrations are sourced from `/migrations/` at the repo root and
//! embedded into the binary using `include_str!`, so `install` needs no
//! files next to the binary.

use rusqlite::{Connection, Result};
use tracing::{info, warn};

/// A single migration with version identifier and SQL content.
struct Migration {
    version: &'static str,
    sql: &'static str,
}

/// All migrations in order, embedded at compile time.
///
/// Version names match the SQL filenames (without .sql extension).
/// The `schema_migrations` table tracks which have been applied.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "001_create_settings",
        sql: include_str!("../../migrations/001_create_settings.sql"),
    },
    Migration {
        version: "002_add_sync_lock_columns",
        sql: include_str!("../../migrations/002_add_sync_lock_columns.sql"),
    },
];

/// Tables owned by the migration machinery, never synchronized.
pub const INTERNAL_TABLES: &[&str] = &["schema_migrations"];

/// Run all pending migrations on the database.
///
/// Already-applied migrations (tracked in `schema_migrations`) are skipped,
/// so this is safe to call on every `install`.
///
/// # Errors
///
/// Returns an error if a migration fails to apply. A duplicate column is
/// not an error: the host database may already carry the lock columns.
pub fn run_migrations(conn: &Connection) -> Result<usize> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let applied: std::collections::HashSet<String> = conn
        .prepare("SELECT version FROM schema_migrations")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let mut count = 0;
    for migration in MIGRATIONS {
        if applied.contains(migration.version) {
            continue;
        }

        info!(version = migration.version, "Applying migration");

        // statement by statement, so one existing column does not skip the rest
        for statement in migration.sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if let Err(e) = conn.execute_batch(statement) {
                if e.to_string().contains("duplicate column name") {
                    warn!(
                        version = migration.version,
                        "Column already exists, skipping statement"
                    );
                } else {
                    return Err(e);
                }
            }
        }

        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![migration.version, chrono::Utc::now().timestamp_millis()],
        )?;
        count += 1;

        info!(version = migration.version, "Migration complete");
    }

    Ok(count)
}

/// Whether the lock columns exist.
///
/// # Errors
///
/// Returns an error if the table info cannot be read.
pub fn is_installed(conn: &Connection) -> Result<bool> {
    let columns: Vec<String> = conn
        .prepare("SELECT name FROM pragma_table_info('settings')")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    Ok(["mv_hash", "mv_ts", "mv_locked"]
        .iter()
        .all(|c| columns.iter().any(|name| name == c)))
}
