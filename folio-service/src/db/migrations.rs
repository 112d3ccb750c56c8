//! Database schema migrations.

use rusqlite::Connection;

use crate::error::{DatabaseError, ServiceResult};

/// Bring the schema up to date. Safe to run on every start.
pub(super) fn run_migrations(conn: &Connection) -> ServiceResult<()> {
    conn.execute_batch(
        r#"
        -- Work queue messages, one table for every named queue
        CREATE TABLE IF NOT EXISTS queue_messages (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            body TEXT NOT NULL,
            delivery_count INTEGER NOT NULL DEFAULT 0,
            lease_token TEXT,
            -- Unix millis; the message is invisible to receivers until then
            visible_at INTEGER NOT NULL,
            inserted_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_queue_messages_visible
            ON queue_messages(queue, visible_at);

        -- Job status table
        CREATE TABLE IF NOT EXISTS job_status (
            partition_key TEXT NOT NULL,
            job_id TEXT NOT NULL,
            status TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (partition_key, job_id)
        );
        "#,
    )
    .map_err(|e| DatabaseError::Migration {
        message: format!("Failed to create schema: {}", e),
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('queue_messages', 'job_status')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }
}
