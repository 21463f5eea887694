//! Local SQLite database layer for Salon Desk.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings
//! helpers (including the business-hours singleton), and the managed
//! connection state shared by every service module.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Managed state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/salon.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("salon.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

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

/// Migration v1: settings and reference collections.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store, business hours live here)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- customers
        CREATE TABLE IF NOT EXISTS customers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT DEFAULT '',
            notes TEXT DEFAULT '',
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- personnel
        CREATE TABLE IF NOT EXISTS personnel (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- service_categories
        CREATE TABLE IF NOT EXISTS service_categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        );

        -- services
        CREATE TABLE IF NOT EXISTS services (
            id TEXT PRIMARY KEY,
            category_id TEXT,
            name TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL DEFAULT 30,
            price REAL NOT NULL DEFAULT 0
        );

        -- packages (bundles of sessions over a set of services)
        CREATE TABLE IF NOT EXISTS packages (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            price REAL NOT NULL DEFAULT 0,
            session_count INTEGER NOT NULL DEFAULT 1,
            service_ids TEXT NOT NULL DEFAULT '[]'
        );

        -- products
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            price REAL NOT NULL DEFAULT 0
        );

        -- stock_batches (per-product ordered purchase batches)
        CREATE TABLE IF NOT EXISTS stock_batches (
            id TEXT PRIMARY KEY,
            product_id TEXT NOT NULL,
            purchase_date TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            remaining INTEGER NOT NULL,
            FOREIGN KEY (product_id) REFERENCES products(id)
        );
        ",
    )
    .map_err(|e| format!("migrate_v1: {e}"))?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])
        .map_err(|e| format!("record v1: {e}"))?;
    Ok(())
}

/// Migration v2: operational collections (appointments, sales, ledger).
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- appointments (one row per service line, grouped per visit)
        CREATE TABLE IF NOT EXISTS appointments (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            customer_name TEXT NOT NULL,
            personnel_id TEXT NOT NULL,
            personnel_name TEXT NOT NULL,
            service_id TEXT NOT NULL,
            service_name TEXT NOT NULL,
            price REAL NOT NULL DEFAULT 0,
            is_package INTEGER NOT NULL DEFAULT 0,
            is_package_session INTEGER NOT NULL DEFAULT 0,
            package_sale_id TEXT,
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            notes TEXT DEFAULT '',
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- package_sales (session pool per purchased bundle)
        CREATE TABLE IF NOT EXISTS package_sales (
            id TEXT PRIMARY KEY,
            package_id TEXT NOT NULL,
            package_name TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            customer_name TEXT NOT NULL,
            personnel_id TEXT,
            price REAL NOT NULL DEFAULT 0,
            paid_amount REAL NOT NULL DEFAULT 0,
            remaining_amount REAL NOT NULL DEFAULT 0,
            total_sessions INTEGER NOT NULL,
            remaining_sessions INTEGER NOT NULL,
            service_ids TEXT NOT NULL DEFAULT '[]',
            sale_date TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- sales (product line items)
        CREATE TABLE IF NOT EXISTS sales (
            id TEXT PRIMARY KEY,
            product_id TEXT NOT NULL,
            product_name TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            total_amount REAL NOT NULL DEFAULT 0,
            customer_id TEXT,
            personnel_id TEXT,
            appointment_group_id TEXT,
            sale_date TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- payment_transactions (cash-register ledger)
        -- appointment_group_id is dual-purpose: appointment group id for
        -- payment_type='appointment', package sale id for 'package'.
        CREATE TABLE IF NOT EXISTS payment_transactions (
            id TEXT PRIMARY KEY,
            appointment_group_id TEXT NOT NULL,
            customer_id TEXT,
            customer_name TEXT DEFAULT '',
            service_amount REAL NOT NULL DEFAULT 0,
            product_amount REAL NOT NULL DEFAULT 0,
            grand_total REAL NOT NULL DEFAULT 0,
            method TEXT NOT NULL,
            payment_date TEXT NOT NULL,
            payment_type TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );
        ",
    )
    .map_err(|e| format!("migrate_v2: {e}"))?;

    conn.execute("INSERT INTO schema_version (version) VALUES (2)", [])
        .map_err(|e| format!("record v2: {e}"))?;
    Ok(())
}

/// Migration v3: lookup indexes for the hot read paths.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_appointments_group ON appointments(group_id);
        CREATE INDEX IF NOT EXISTS idx_appointments_start ON appointments(start_at);
        CREATE INDEX IF NOT EXISTS idx_sales_group ON sales(appointment_group_id);
        CREATE INDEX IF NOT EXISTS idx_stock_batches_product ON stock_batches(product_id, purchase_date);
        CREATE INDEX IF NOT EXISTS idx_payment_tx_group ON payment_transactions(appointment_group_id);
        CREATE INDEX IF NOT EXISTS idx_payment_tx_date ON payment_transactions(payment_date);
        ",
    )
    .map_err(|e| format!("migrate_v3: {e}"))?;

    conn.execute("INSERT INTO schema_version (version) VALUES (3)", [])
        .map_err(|e| format!("record v3: {e}"))?;
    Ok(())
}

// ===========================================================================
// Settings helpers
// ===========================================================================

/// Get a setting value, or None if not set.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// Default opening hours used until the owner edits them.
const DEFAULT_BUSINESS_HOURS: &str = r#"{"open":"09:00","close":"20:00","closedDays":[]}"#;

/// Read the business-hours singleton as JSON.
pub fn get_business_hours(conn: &Connection) -> serde_json::Value {
    let raw = get_setting(conn, "settings", "business_hours")
        .unwrap_or_else(|| DEFAULT_BUSINESS_HOURS.to_string());
    serde_json::from_str(&raw)
        .unwrap_or_else(|_| serde_json::from_str(DEFAULT_BUSINESS_HOURS).unwrap_or_default())
}

/// Replace the business-hours singleton.
pub fn set_business_hours(conn: &Connection, hours: &serde_json::Value) -> Result<(), String> {
    set_setting(conn, "settings", "business_hours", &hours.to_string())
}

/// Test helper: run migrations on an arbitrary connection.
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    /// Open an in-memory database and apply pragmas (mirrors open_and_configure).
    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        conn
    }

    /// Helper: list table names in the database.
    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_create_all_collections() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let tables = table_names(&conn);
        for expected in [
            "appointments",
            "customers",
            "local_settings",
            "package_sales",
            "packages",
            "payment_transactions",
            "personnel",
            "products",
            "sales",
            "service_categories",
            "services",
            "stock_batches",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_settings_roundtrip() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        assert!(get_setting(&conn, "settings", "theme").is_none());
        set_setting(&conn, "settings", "theme", "dark").unwrap();
        assert_eq!(
            get_setting(&conn, "settings", "theme").as_deref(),
            Some("dark")
        );
        set_setting(&conn, "settings", "theme", "light").unwrap();
        assert_eq!(
            get_setting(&conn, "settings", "theme").as_deref(),
            Some("light")
        );
    }

    #[test]
    fn test_business_hours_default_and_update() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let hours = get_business_hours(&conn);
        assert_eq!(hours["open"], "09:00");

        let updated =
            serde_json::json!({"open": "10:00", "close": "19:00", "closedDays": ["Sunday"]});
        set_business_hours(&conn, &updated).unwrap();
        let hours = get_business_hours(&conn);
        assert_eq!(hours["open"], "10:00");
        assert_eq!(hours["closedDays"][0], "Sunday");
    }
}
