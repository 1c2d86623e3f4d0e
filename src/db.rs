//! Local SQLite snapshot cache.
//!
//! Mirrors the last fetched `sales`, `payments` and `deliveries` collections
//! so the dashboard can show data before the first remote fetch completes.
//! The backend stays authoritative; nothing here is ever written back.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult};

/// Managed state holding the cache connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

pub const COLLECTION_SALES: &str = "sales";
pub const COLLECTION_PAYMENTS: &str = "payments";
pub const COLLECTION_DELIVERIES: &str = "deliveries";

/// Initialize the cache at `{app_data_dir}/bellaflor.db`.
///
/// On corruption or open failure the file is deleted and opened once more;
/// the cache only holds data that can be fetched again.
pub fn init(app_data_dir: &Path) -> AppResult<DbState> {
    fs::create_dir_all(app_data_dir)
        .map_err(|e| AppError::Cache(format!("Failed to create data dir: {e}")))?;

    let db_path = app_data_dir.join("bellaflor.db");
    info!("Opening snapshot cache at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Cache open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;
    info!("Snapshot cache initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// In-memory cache, used by headless runs and tests.
pub fn open_in_memory() -> AppResult<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_and_configure(path: &Path) -> AppResult<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

fn run_migrations(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!("Migrating snapshot cache from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: key/value settings.
fn migrate_v1(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        AppError::from(e)
    })?;
    info!("Applied migration v1 (local_settings)");
    Ok(())
}

/// Migration v2: one JSON snapshot per collection.
fn migrate_v2(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS snapshot_cache (
            collection TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            row_count INTEGER NOT NULL DEFAULT 0,
            fetched_at TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        AppError::from(e)
    })?;
    info!("Applied migration v2 (snapshot_cache)");
    Ok(())
}

fn lock(db: &DbState) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
    db.conn
        .lock()
        .map_err(|e| AppError::State(format!("cache connection: {e}")))
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> AppResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Replace the cached snapshot of `collection`.
pub fn save_snapshot<T: Serialize>(
    db: &DbState,
    collection: &str,
    rows: &[T],
    fetched_at: DateTime<Utc>,
) -> AppResult<()> {
    let payload = serde_json::to_string(rows)?;
    let conn = lock(db)?;
    conn.execute(
        "INSERT INTO snapshot_cache (collection, payload, row_count, fetched_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(collection) DO UPDATE SET
            payload = excluded.payload,
            row_count = excluded.row_count,
            fetched_at = excluded.fetched_at",
        params![collection, payload, rows.len() as i64, fetched_at.to_rfc3339()],
    )?;
    Ok(())
}

/// Cached rows and their fetch time; `None` when nothing was cached yet.
pub fn load_snapshot<T: DeserializeOwned>(
    db: &DbState,
    collection: &str,
) -> AppResult<Option<(Vec<T>, DateTime<Utc>)>> {
    let conn = lock(db)?;
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT payload, fetched_at FROM snapshot_cache WHERE collection = ?1",
            params![collection],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    drop(conn);

    let Some((payload, fetched_at)) = row else {
        return Ok(None);
    };
    let rows: Vec<T> = serde_json::from_str(&payload)?;
    let fetched_at = DateTime::parse_from_rfc3339(&fetched_at)
        .map_err(|e| AppError::Cache(format!("bad fetched_at in cache: {e}")))?
        .with_timezone(&Utc);
    Ok(Some((rows, fetched_at)))
}

/// Row count and fetch time per cached collection.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub collection: String,
    pub row_count: i64,
    pub fetched_at: String,
}

pub fn snapshot_summaries(db: &DbState) -> AppResult<Vec<SnapshotInfo>> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(
        "SELECT collection, row_count, fetched_at FROM snapshot_cache ORDER BY collection",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SnapshotInfo {
                collection: row.get(0)?,
                row_count: row.get(1)?,
                fetched_at: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn schema_version(db: &DbState) -> AppResult<i32> {
    let conn = lock(db)?;
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

pub fn clear_snapshots(db: &DbState) -> AppResult<()> {
    let conn = lock(db)?;
    conn.execute("DELETE FROM snapshot_cache", [])?;
    Ok(())
}
