//! Database migrations.
//!
//! This module contains all SQL migrations for the pending-event schema.
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
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
        migrate_v1_pending_events(conn)?;
    }
    if current_version < 2 {
        migrate_v2_room_queue_index(conn)?;
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

/// V1: Pending outgoing events, one row per (room, queue position).
fn migrate_v1_pending_events(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: pending events");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pending_events (
            room_id TEXT NOT NULL,
            queue_index INTEGER NOT NULL,
            txn_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            content TEXT NOT NULL,
            related_txn_id TEXT,
            related_event_id TEXT,
            remote_id TEXT,
            needs_upload INTEGER NOT NULL DEFAULT 0,
            needs_encryption INTEGER NOT NULL DEFAULT 0,
            encrypted_event_type TEXT,
            encrypted_content TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (room_id, queue_index)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_pending_events_txn_id
            ON pending_events(txn_id);
        CREATE INDEX IF NOT EXISTS idx_pending_events_related_txn_id
            ON pending_events(room_id, related_txn_id);
        ",
    )?;

    record_migration(conn, 1, "pending_events")?;
    Ok(())
}

/// V2: Per-room high-water mark so queue positions are never reused,
/// even after every row of a room has been removed.
fn migrate_v2_room_queue_index(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: room queue index");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS room_queue_index (
            room_id TEXT PRIMARY KEY,
            max_queue_index INTEGER NOT NULL
        );

        INSERT OR IGNORE INTO room_queue_index (room_id, max_queue_index)
            SELECT room_id, MAX(queue_index) FROM pending_events GROUP BY room_id;
        ",
    )?;

    record_migration(conn, 2, "room_queue_index")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_successfully() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"pending_events".to_string()));
        assert!(tables.contains(&"room_queue_index".to_string()));
        assert!(tables.contains(&"migrations".to_string()));
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM migrations", [], |row| row.get(0))
            .unwrap();

        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_txn_id_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let insert = "INSERT INTO pending_events (room_id, queue_index, txn_id, event_type, content, created_at)
                      VALUES (?1, ?2, 't1', 'm.room.message', '{}', '2024-01-01T00:00:00Z')";
        conn.execute(insert, rusqlite::params!["!a:x", 1]).unwrap();
        assert!(conn.execute(insert, rusqlite::params!["!a:x", 2]).is_err());
    }
}
