//! SQLite storage layer -- candidate pool, source cursors, migrations.

pub mod candidates;
pub mod cursor;
pub mod schema;

pub use candidates::{Candidate, CandidateStatus, IngestSummary, LocationSummary};

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool as R2D2Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

const FILE_PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA temp_store = MEMORY;
     PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

/// Durable candidate store. Owns the connection pool for one process run.
///
/// Cloning is cheap and shares the pool, which is how blocking work is handed
/// to `spawn_blocking` without giving up ownership.
#[derive(Clone)]
pub struct CandidateStore {
    pool: Pool,
}

impl std::fmt::Debug for CandidateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.pool.state();
        f.debug_struct("CandidateStore")
            .field("connections", &state.connections)
            .field("idle", &state.idle_connections)
            .finish()
    }
}

impl CandidateStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let manager =
            SqliteConnectionManager::file(path).with_init(|c| c.execute_batch(FILE_PRAGMAS));
        let pool = R2D2Pool::builder()
            .connection_timeout(Duration::from_secs(10))
            .build(manager)
            .with_context(|| format!("failed to open database {}", path.display()))?;

        info!(path = %path.display(), "candidate store opened");
        Self::from_pool(pool)
    }

    /// Open a private in-memory store. Used by tests and dry runs.
    ///
    /// Every SQLite in-memory connection is its own database, so the pool is
    /// pinned to a single connection that never expires.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = R2D2Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: Pool) -> Result<Self> {
        {
            let conn = pool.get()?;
            schema::migrate(&conn)?;
        }
        Ok(Self { pool })
    }

    pub(crate) fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("failed to get database connection")
    }

    /// Close the store. Pending pooled connections are dropped with it.
    pub fn close(self) {
        let state = self.pool.state();
        drop(self.pool);
        info!(connections = state.connections, "candidate store closed");
    }
}

/// Fixed-width RFC 3339 so that text order equals time order in SQL.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
