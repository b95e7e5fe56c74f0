//! Database schema and migrations.

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::info;

/// Recorded in `PRAGMA user_version` once all migrations have run.
pub const SCHEMA_VERSION: i64 = 2;

/// Columns added after the first release. Older databases gain them in place.
const CANDIDATE_COLUMNS: &[(&str, &str)] = &[
    ("delay", "INTEGER"),
    ("download", "REAL"),
    ("upload", "REAL"),
    ("location", "TEXT"),
    ("last_tested", "TEXT"),
    ("speed_tested_at", "TEXT"),
    ("retry_count", "INTEGER NOT NULL DEFAULT 0"),
];

/// Run all pending migrations. Never drops data.
pub fn migrate(conn: &Connection) -> Result<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS candidates (
            link TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'untested'
        );

        CREATE TABLE IF NOT EXISTS source_cursors (
            source TEXT PRIMARY KEY,
            last_seen_offset INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )?;

    for (name, decl) in CANDIDATE_COLUMNS {
        if !has_column(conn, "candidates", name)? {
            conn.execute(&format!("ALTER TABLE candidates ADD COLUMN {name} {decl}"), [])
                .with_context(|| format!("failed to add column candidates.{name}"))?;
        }
    }

    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_candidates_location_status ON candidates(location, status);
         CREATE INDEX IF NOT EXISTS idx_candidates_status ON candidates(status);",
    )?;

    if current < SCHEMA_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
        info!(from = current, to = SCHEMA_VERSION, "database schema migrated");
    }

    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM pragma_table_info(?1) WHERE name = ?2",
        rusqlite::params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
