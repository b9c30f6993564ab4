//! Local SQLite database layer for Print Shop Desk.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! and the shared connection state used by every domain module.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info};

use crate::error::{AppError, AppResult};

/// Shared database state. One connection, serialized by the mutex.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection, mapping a poisoned mutex to [`AppError::Lock`].
    pub fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| AppError::Lock)
    }
}

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Database file name inside the data directory.
const DB_FILE_NAME: &str = "desk.db";

/// Initialize the database at `{data_dir}/desk.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. Unlike a cache, the ledger is the only
/// copy of the data, so an unreadable file is reported, never recreated.
pub fn init(data_dir: &Path) -> AppResult<DbState> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = open_and_configure(&db_path)?;
    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> AppResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current = schema_version(conn);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Highest applied migration, 0 on a fresh file.
pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Migration v1: settings, customers and the meters ledger.
fn migrate_v1(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- customers_
        CREATE TABLE IF NOT EXISTS customers_ (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT,
            phone_digits TEXT,
            email TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- loyalty_programs (one meters package bought by a customer)
        CREATE TABLE IF NOT EXISTS loyalty_programs (
            id TEXT PRIMARY KEY,
            customer_id TEXT NOT NULL,
            program_type TEXT NOT NULL,
            total_meters REAL NOT NULL CHECK (total_meters > 0),
            remaining_meters REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'activo' CHECK (status IN ('activo', 'completado', 'expirado')),
            purchase_date TEXT NOT NULL,
            folio TEXT,
            completed_at TEXT,
            edit_reason TEXT,
            edited_by TEXT,
            edited_at TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(customer_id) REFERENCES customers_(id) ON DELETE CASCADE
        );

        -- order_history (append-only meters log: consumption and signed manual adjustments)
        CREATE TABLE IF NOT EXISTS order_history (
            id TEXT PRIMARY KEY,
            program_id TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            folio TEXT,
            entry_type TEXT NOT NULL DEFAULT 'consumo' CHECK (entry_type IN ('consumo', 'ajuste')),
            meters_consumed REAL NOT NULL CHECK (entry_type = 'ajuste' OR meters_consumed > 0),
            remaining_before REAL NOT NULL,
            remaining_after REAL NOT NULL,
            recorded_by TEXT NOT NULL,
            register_id TEXT,
            notes TEXT,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY(program_id) REFERENCES loyalty_programs(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_customers_name ON customers_(name);
        CREATE INDEX IF NOT EXISTS idx_customers_phone_digits ON customers_(phone_digits);
        CREATE INDEX IF NOT EXISTS idx_programs_customer ON loyalty_programs(customer_id);
        CREATE INDEX IF NOT EXISTS idx_programs_status ON loyalty_programs(status);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_programs_folio ON loyalty_programs(folio) WHERE folio IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_history_program ON order_history(program_id);
        CREATE INDEX IF NOT EXISTS idx_history_recorded_at ON order_history(recorded_at);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_history_folio ON order_history(folio) WHERE folio IS NOT NULL;

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        AppError::from(e)
    })?;

    info!("Applied migration v1 (customers + loyalty ledger)");
    Ok(())
}

/// Migration v2: cash cuts and the denomination catalog.
fn migrate_v2(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cash_cuts (
            id TEXT PRIMARY KEY,
            register_id TEXT,
            operator TEXT NOT NULL,
            total REAL NOT NULL DEFAULT 0,
            notes TEXT,
            is_draft INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            finalized_at TEXT
        );

        CREATE TABLE IF NOT EXISTS cash_cut_items (
            id TEXT PRIMARY KEY,
            cash_cut_id TEXT NOT NULL,
            denomination_value REAL NOT NULL,
            denomination_label TEXT NOT NULL,
            quantity REAL NOT NULL CHECK (quantity >= 0),
            subtotal REAL NOT NULL,
            FOREIGN KEY(cash_cut_id) REFERENCES cash_cuts(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS denominations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            value REAL NOT NULL UNIQUE,
            label TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('bill', 'coin')),
            sort_order INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1
        );

        INSERT OR IGNORE INTO denominations (value, label, kind, sort_order) VALUES
            (1000, '$1,000', 'bill', 1),
            (500, '$500', 'bill', 2),
            (200, '$200', 'bill', 3),
            (100, '$100', 'bill', 4),
            (50, '$50', 'bill', 5),
            (20, '$20', 'bill', 6),
            (10, '$10', 'coin', 7),
            (5, '$5', 'coin', 8),
            (2, '$2', 'coin', 9),
            (1, '$1', 'coin', 10),
            (0.5, '$0.50', 'coin', 11);

        CREATE INDEX IF NOT EXISTS idx_cash_cuts_created_at ON cash_cuts(created_at);
        CREATE INDEX IF NOT EXISTS idx_cash_cuts_draft ON cash_cuts(is_draft);
        CREATE INDEX IF NOT EXISTS idx_cash_cut_items_cut ON cash_cut_items(cash_cut_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        AppError::from(e)
    })?;

    info!("Applied migration v2 (cash cuts + denominations)");
    Ok(())
}

/// Migration v3: portal credentials and the customer deletion audit.
fn migrate_v3(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS client_access_credentials (
            id TEXT PRIMARY KEY,
            customer_id TEXT NOT NULL UNIQUE,
            access_id TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(customer_id) REFERENCES customers_(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS deleted_clients_audit (
            id TEXT PRIMARY KEY,
            customer_id TEXT NOT NULL,
            snapshot TEXT NOT NULL,
            reason TEXT,
            deleted_by TEXT NOT NULL,
            deleted_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_deleted_audit_customer ON deleted_clients_audit(customer_id);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        AppError::from(e)
    })?;

    info!("Applied migration v3 (access credentials + deletion audit)");
    Ok(())
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

/// All settings of one category as a JSON object (`key -> value`).
pub fn get_category_settings(conn: &Connection, category: &str) -> AppResult<serde_json::Value> {
    let mut stmt = conn.prepare(
        "SELECT setting_key, setting_value FROM local_settings
         WHERE setting_category = ?1 ORDER BY setting_key",
    )?;
    let rows = stmt.query_map(params![category], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut map = serde_json::Map::new();
    for row in rows {
        let (key, value) = row?;
        map.insert(key, serde_json::Value::String(value));
    }
    Ok(serde_json::Value::Object(map))
}

pub fn delete_all_settings(conn: &Connection, category: &str) -> AppResult<()> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1",
        params![category],
    )?;
    Ok(())
}

/// Extract a column value from a row using SQLite's actual stored type.
/// Uses `get_ref` so REAL values like 100.0 stay floats in the JSON output.
pub fn row_value_at(row: &rusqlite::Row, idx: usize) -> serde_json::Value {
    use rusqlite::types::ValueRef;
    match row.get_ref(idx) {
        Ok(ValueRef::Integer(v)) => serde_json::Value::Number(serde_json::Number::from(v)),
        Ok(ValueRef::Real(v)) => serde_json::json!(v),
        Ok(ValueRef::Text(v)) => serde_json::Value::String(String::from_utf8_lossy(v).into_owned()),
        Ok(ValueRef::Null) | Ok(ValueRef::Blob(_)) | Err(_) => serde_json::Value::Null,
    }
}

#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// Fresh in-memory database with every migration applied.
#[cfg(test)]
pub fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}
