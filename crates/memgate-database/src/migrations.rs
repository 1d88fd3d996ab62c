//! Database migrations.
//!
//! This module contains all SQL migrations for the gateway schema.
//! Migrations are run in order and tracked in the `migrations` table.

use crate::{DatabaseError, DatabaseResult};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    // Create migrations tracking table
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_write_outbox(conn)
            .map_err(|e| DatabaseError::Migration(format!("v1 write_outbox: {e}")))?;
    }
    if current_version < 2 {
        migrate_v2_write_audit(conn)
            .map_err(|e| DatabaseError::Migration(format!("v2 write_audit: {e}")))?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: outbox table for deferred memory writes.
///
/// Rows are never deleted; `sent` and `dead` are terminal. The lease columns
/// (`locked_by`, `locked_at`) are only meaningful while `status = 'pending'`.
fn migrate_v1_write_outbox(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: write outbox");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memory_write_outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payload TEXT NOT NULL,
            target_space TEXT NOT NULL,
            payload_sha TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_attempt_at TEXT NOT NULL,
            last_error TEXT,
            locked_by TEXT,
            locked_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_write_outbox_status_next_attempt
            ON memory_write_outbox(status, next_attempt_at);
        CREATE INDEX IF NOT EXISTS idx_write_outbox_dedup
            ON memory_write_outbox(target_space, payload_sha, status);
        CREATE INDEX IF NOT EXISTS idx_write_outbox_locked_at
            ON memory_write_outbox(locked_at);
        ",
    )?;

    record_migration(conn, 1, "write_outbox")?;
    Ok(())
}

/// V2: audit table for the two-phase decision log.
///
/// `refs` is a JSON object; worker/reconciler-authored rows are located by
/// `json_extract(refs, '$.outbox_id')` and `'$.source'`.
fn migrate_v2_write_audit(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: write audit");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memory_write_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            correlation_id TEXT NOT NULL,
            actor TEXT NOT NULL,
            target_space TEXT NOT NULL,
            action TEXT NOT NULL,
            reason TEXT,
            intended_action TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            refs TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            finalized_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_write_audit_correlation
            ON memory_write_audit(correlation_id);
        CREATE INDEX IF NOT EXISTS idx_write_audit_status_created
            ON memory_write_audit(status, created_at);
        ",
    )?;

    record_migration(conn, 2, "write_audit")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_from_scratch() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);

        // Both tables exist
        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('memory_write_outbox', 'memory_write_audit')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_failed_migration_names_the_step() {
        let conn = Connection::open_in_memory().unwrap();
        // A view with the table's name makes the v1 DDL fail
        conn.execute_batch("CREATE VIEW memory_write_outbox AS SELECT 1 AS id")
            .unwrap();

        let err = run_migrations(&conn).unwrap_err();
        assert!(matches!(err, DatabaseError::Migration(_)));
        assert!(err.to_string().contains("write_outbox"));
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let applied: i32 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, CURRENT_VERSION);
    }
}
