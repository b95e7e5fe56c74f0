//! Per-source progress markers for the collection stage.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{encode_ts, CandidateStore};

impl CandidateStore {
    /// Last offset seen for `source`, if it was ever collected.
    pub fn cursor(&self, source: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let offset = conn
            .query_row(
                "SELECT last_seen_offset FROM source_cursors WHERE source = ?1",
                params![source],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset)
    }

    /// Stored offsets for each of `sources` that has one.
    pub fn cursors(&self, sources: &[String]) -> Result<BTreeMap<String, i64>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT last_seen_offset FROM source_cursors WHERE source = ?1")?;
        let mut found = BTreeMap::new();
        for source in sources {
            let offset: Option<i64> = stmt.query_row(params![source], |row| row.get(0)).optional()?;
            if let Some(offset) = offset {
                found.insert(source.clone(), offset);
            }
        }
        Ok(found)
    }

    /// Write the offset for one source.
    pub fn set_cursor(&self, source: &str, offset: i64, now: DateTime<Utc>) -> Result<()> {
        self.set_cursors(&[(source.to_string(), offset)], now)
    }

    /// Write several offsets in one transaction.
    pub fn set_cursors(&self, cursors: &[(String, i64)], now: DateTime<Utc>) -> Result<()> {
        if cursors.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = encode_ts(now);
        for (source, offset) in cursors {
            tx.execute(
                "INSERT INTO source_cursors (source, last_seen_offset, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(source) DO UPDATE SET
                    last_seen_offset = excluded.last_seen_offset,
                    updated_at = excluded.updated_at",
                params![source, offset, now],
            )?;
        }
        tx.commit().context("failed to commit source cursors")?;
        Ok(())
    }
}
