//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS request_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL,
            schedule_name TEXT,
            timestamp TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 1,
            success INTEGER NOT NULL,
            status_code INTEGER,
            response_time_ms INTEGER,
            url TEXT,
            method TEXT,
            request_headers TEXT,
            request_body TEXT,
            response_body TEXT,
            response_headers TEXT,
            error TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_request_history_timestamp ON request_history(timestamp);
        CREATE INDEX IF NOT EXISTS idx_request_history_request_id ON request_history(request_id);
        CREATE INDEX IF NOT EXISTS idx_request_history_success ON request_history(success);

        CREATE TABLE IF NOT EXISTS schedule_stats (
            schedule_id TEXT PRIMARY KEY,
            total_requests INTEGER NOT NULL DEFAULT 0,
            successful_requests INTEGER NOT NULL DEFAULT 0,
            failed_requests INTEGER NOT NULL DEFAULT 0,
            last_request_at TEXT,
            last_success_at TEXT,
            last_failure_at TEXT,
            avg_response_time_ms REAL,
            updated_at TEXT NOT NULL
        );",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
