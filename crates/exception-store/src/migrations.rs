//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::StoreResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_exception_record(conn)?;
    }
    if current_version < 2 {
        migrate_v2_pending_index(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: exception_record table.
fn migrate_v1_exception_record(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS exception_record (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            service_name TEXT NOT NULL,
            severity TEXT NOT NULL,
            message TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            security_id TEXT NOT NULL,
            processed_at TEXT,
            stacktrace TEXT,
            correlation_id TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_exception_security_id
            ON exception_record(security_id);
        ",
    )?;
    record_migration(conn, 1, "exception_record")
}

/// V2: covering index for the pending-page query.
fn migrate_v2_pending_index(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_exception_pending
            ON exception_record(security_id, processed_at, occurred_at, id);
        ",
    )?;
    record_migration(conn, 2, "pending_index")
}
