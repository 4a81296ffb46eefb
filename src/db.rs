//! Local SQLite storage for the offline cache.
//!
//! Uses rusqlite with WAL mode. The schema is a single key/value table of
//! JSON documents, versioned through `schema_version`.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::{Result, SyncError};

/// Shared handle to the cache database.
#[derive(Clone)]
pub struct DbState {
    pub conn: Arc<Mutex<Connection>>,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Open (or create) the cache database at `path`.
///
/// Creates the parent directory if needed, applies pragmas and runs pending
/// migrations. The cache is disposable: on open failure the file is deleted
/// and opened once more from scratch.
pub fn init(path: &Path) -> Result<DbState> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| SyncError::Cache(format!("failed to create data dir: {e}")))?;
    }
    info!("Opening offline cache at {}", path.display());

    let conn = match open_and_configure(path).and_then(|c| run_migrations(&c).map(|_| c)) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Offline cache open failed ({}), deleting and retrying once",
                first_err
            );
            remove_db_files(path);
            let conn = open_and_configure(path)?;
            run_migrations(&conn)?;
            conn
        }
    };

    info!("Offline cache ready (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Arc::new(Mutex::new(conn)),
    })
}

/// In-memory database with the full schema, for tests and dry runs.
pub fn open_in_memory() -> Result<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Arc::new(Mutex::new(conn)),
    })
}

fn remove_db_files(path: &Path) {
    if !path.exists() {
        return;
    }
    let _ = fs::remove_file(path);
    let mut wal = path.as_os_str().to_owned();
    wal.push("-wal");
    let mut shm = path.as_os_str().to_owned();
    shm.push("-shm");
    let _ = fs::remove_file(PathBuf::from(wal));
    let _ = fs::remove_file(PathBuf::from(shm));
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!("Migrating offline cache from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Migration v1: key/value document store.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS offline_cache (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Key/value helpers
// ---------------------------------------------------------------------------

/// Read a cached document. `None` when the key was never written.
pub fn get_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM offline_cache WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Insert or replace a cached document.
pub fn set_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO offline_cache (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at",
        params![key, value],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
