//! Database schema migrations.
//!
//! Applies the settings key-value table, the history table, and the
//! schema_migrations tracking table.

use rusqlite::Connection;
use tracing::info;

use tambourine_core::error::TambourineError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), TambourineError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| TambourineError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| {
            TambourineError::Storage(format!("Failed to query migration version: {}", e))
        })?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: settings and history.
fn apply_v1(conn: &Connection) -> Result<(), TambourineError> {
    conn.execute_batch(
        "
        -- String key-value pairs. Values of user settings are JSON documents.
        CREATE TABLE IF NOT EXISTS settings (
            key         TEXT PRIMARY KEY NOT NULL,
            value       TEXT NOT NULL,
            updated_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE TABLE IF NOT EXISTS history (
            id          TEXT PRIMARY KEY NOT NULL,
            timestamp   INTEGER NOT NULL,
            text        TEXT NOT NULL,
            raw_text    TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_history_timestamp
            ON history (timestamp DESC);

        INSERT INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| TambourineError::Storage(format!("Migration v1 failed: {}", e)))?;
    Ok(())
}
