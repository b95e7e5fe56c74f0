//! Candidate rows: latency merge with per-location eviction, speed results,
//! retest and ranking queries.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info};

use super::{decode_ts, encode_ts, CandidateStore};
use crate::ingest::eviction::{self, Admission, PoolSlot};
use crate::measure::{LatencyResult, LatencyVerdict};
use crate::proxy::SelectorMode;

/// Lifecycle state of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Untested,
    LatencyPassed,
    Failed,
    SpeedPassed,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Untested => "untested",
            CandidateStatus::LatencyPassed => "latency_passed",
            CandidateStatus::Failed => "failed",
            CandidateStatus::SpeedPassed => "speed_passed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "untested" => Some(CandidateStatus::Untested),
            "latency_passed" => Some(CandidateStatus::LatencyPassed),
            "failed" => Some(CandidateStatus::Failed),
            "speed_passed" => Some(CandidateStatus::SpeedPassed),
            _ => None,
        }
    }
}

impl std::fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proxy link plus its accumulated test metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub link: String,
    pub status: CandidateStatus,
    pub delay: Option<u32>,
    pub download: Option<f64>,
    pub upload: Option<f64>,
    pub location: Option<String>,
    pub last_tested: Option<DateTime<Utc>>,
    pub speed_tested_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl Candidate {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        let last_tested: Option<String> = row.get("last_tested")?;
        let speed_tested_at: Option<String> = row.get("speed_tested_at")?;
        Ok(Self {
            link: row.get("link")?,
            status: CandidateStatus::parse(&status).unwrap_or(CandidateStatus::Untested),
            delay: row.get("delay")?,
            download: row.get("download")?,
            upload: row.get("upload")?,
            location: row.get("location")?,
            last_tested: last_tested.as_deref().and_then(decode_ts),
            speed_tested_at: speed_tested_at.as_deref().and_then(decode_ts),
            retry_count: row.get("retry_count")?,
        })
    }
}

/// Outcome counts for one latency batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    /// Passed results written to the store (new rows and refreshes).
    pub admitted: usize,
    /// Pool members deleted to make room for a faster newcomer.
    pub evicted: usize,
    /// Passed results dropped because their pool was full of faster members.
    pub discarded: usize,
    /// Failures recorded.
    pub failed: usize,
}

/// Occupancy of one location pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationSummary {
    pub location: String,
    pub active: u64,
    pub speed_passed: u64,
    pub failed: u64,
}

const COLUMNS: &str =
    "link, status, delay, download, upload, location, last_tested, speed_tested_at, retry_count";

/// Worst-first ordering inside a location pool.
const WORST_FIRST: &str = "delay IS NULL DESC, delay DESC, last_tested ASC, link ASC";

impl CandidateStore {
    /// Merge a latency batch in one `IMMEDIATE` transaction.
    ///
    /// Taking the write lock before the first count means two concurrent
    /// batches can never both pick the same worst row to evict.
    pub fn upsert_latency_batch(
        &self,
        results: &[LatencyResult],
        cap: u32,
        now: DateTime<Utc>,
    ) -> Result<IngestSummary> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin latency batch")?;
        let now = encode_ts(now);
        let mut summary = IngestSummary::default();

        for result in results {
            let (delay, location) = match &result.verdict {
                LatencyVerdict::Failed => {
                    record_failure(&tx, &result.link, &now)?;
                    summary.failed += 1;
                    continue;
                }
                LatencyVerdict::Passed { delay, location } => (*delay, location.as_deref()),
            };

            let admission = match location {
                None => Admission::Insert,
                Some(location) => {
                    let active = count_active(&tx, location, &result.link)?;
                    let worst = if active >= u64::from(cap) {
                        worst_active(&tx, location, &result.link)?
                    } else {
                        None
                    };
                    eviction::decide(active, cap, worst.as_ref(), delay)
                }
            };

            match admission {
                Admission::Insert => {
                    record_pass(&tx, &result.link, delay, location, &now)?;
                    summary.admitted += 1;
                }
                Admission::Replace(victim) => {
                    tx.execute("DELETE FROM candidates WHERE link = ?1", params![victim.link])?;
                    record_pass(&tx, &result.link, delay, location, &now)?;
                    debug!(
                        link = %result.link,
                        evicted = %victim.link,
                        delay,
                        evicted_delay = ?victim.delay,
                        location = ?location,
                        "evicted slower candidate"
                    );
                    summary.evicted += 1;
                    summary.admitted += 1;
                }
                Admission::Discard => {
                    debug!(link = %result.link, delay, location = ?location, "pool full, result discarded");
                    summary.discarded += 1;
                }
            }
        }

        tx.commit().context("failed to commit latency batch")?;
        Ok(summary)
    }

    /// Store speed metrics for an existing candidate and mark it `speed_passed`.
    ///
    /// Returns `false` when no such candidate exists. Repeating the call with the
    /// same values leaves the row in the same state.
    pub fn record_speed_result(
        &self,
        link: &str,
        download: f64,
        upload: f64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE candidates
             SET status = 'speed_passed', download = ?2, upload = ?3, speed_tested_at = ?4
             WHERE link = ?1",
            params![link, download, upload, encode_ts(now)],
        )?;
        Ok(changed > 0)
    }

    /// Links due for latency measurement: every new link, failed links with
    /// retries left, and anything not tested within `retest_window`.
    ///
    /// Failed links out of retries stay excluded unless re-supplied as new.
    pub fn candidates_needing_test(
        &self,
        new_links: &BTreeSet<String>,
        retest_window: Duration,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<BTreeSet<String>> {
        let conn = self.conn()?;
        let threshold = encode_ts(now - retest_window);
        let mut stmt = conn.prepare(
            "SELECT link FROM candidates
             WHERE (status = 'failed' AND retry_count < ?1)
                OR (status != 'failed' AND (last_tested IS NULL OR last_tested < ?2))",
        )?;

        let mut links = new_links.clone();
        let rows = stmt.query_map(params![max_retries, threshold], |row| row.get::<_, String>(0))?;
        for link in rows {
            links.insert(link?);
        }
        Ok(links)
    }

    /// Up to `k` `latency_passed` links per location, fastest first.
    pub fn top_candidates_per_location(&self, k: u32) -> Result<BTreeMap<String, Vec<String>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT location, link FROM (
                SELECT location, link, ROW_NUMBER() OVER (
                    PARTITION BY location ORDER BY delay ASC, last_tested DESC, link ASC
                ) AS rn
                FROM candidates
                WHERE status = 'latency_passed'
                  AND location IS NOT NULL AND location != ''
                  AND delay IS NOT NULL
             )
             WHERE rn <= ?1
             ORDER BY location, rn",
        )?;

        let mut by_location: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let rows = stmt.query_map(params![k], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (location, link) = row?;
            by_location.entry(location).or_default().push(link);
        }
        Ok(by_location)
    }

    /// Ranked links for bootstrapping a local proxy.
    ///
    /// `SpeedPassed` ranks by download (newest measurement breaks ties) and
    /// falls back to the latency ranking when it finds nothing.
    pub fn proxy_candidates(&self, mode: SelectorMode, max_links: u32) -> Result<Vec<String>> {
        if max_links == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let query_links = |sql: &str| -> Result<Vec<String>> {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![max_links], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        };

        if mode == SelectorMode::SpeedPassed {
            let links = query_links(
                "SELECT link FROM candidates
                 WHERE status = 'speed_passed'
                 ORDER BY download IS NULL ASC, download DESC,
                          speed_tested_at IS NULL ASC, speed_tested_at DESC, link ASC
                 LIMIT ?1",
            )?;
            if !links.is_empty() {
                return Ok(links);
            }
            info!("no speed_passed candidates, falling back to latency ranking");
        }

        query_links(
            "SELECT link FROM candidates
             WHERE status = 'latency_passed'
             ORDER BY delay IS NULL ASC, delay ASC,
                      last_tested IS NULL ASC, last_tested DESC, link ASC
             LIMIT ?1",
        )
    }

    /// Fetch a single candidate.
    pub fn get(&self, link: &str) -> Result<Option<Candidate>> {
        let conn = self.conn()?;
        let candidate = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM candidates WHERE link = ?1"),
                params![link],
                Candidate::from_row,
            )
            .optional()?;
        Ok(candidate)
    }

    /// All candidates in one location, fastest first.
    pub fn location_members(&self, location: &str) -> Result<Vec<Candidate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM candidates WHERE location = ?1 ORDER BY delay IS NULL, delay, link"
        ))?;
        let rows = stmt.query_map(params![location], Candidate::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Per-location occupancy, ordered by location.
    pub fn location_summary(&self) -> Result<Vec<LocationSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT location,
                    SUM(status != 'failed'),
                    SUM(status = 'speed_passed'),
                    SUM(status = 'failed')
             FROM candidates
             WHERE location IS NOT NULL AND location != ''
             GROUP BY location
             ORDER BY location",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(LocationSummary {
                location: row.get(0)?,
                active: row.get::<_, i64>(1)? as u64,
                speed_passed: row.get::<_, i64>(2)? as u64,
                failed: row.get::<_, i64>(3)? as u64,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Row counts per status.
    pub fn status_counts(&self) -> Result<BTreeMap<String, u64>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM candidates GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        Ok(rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()?)
    }
}

fn record_failure(tx: &Transaction<'_>, link: &str, now: &str) -> Result<()> {
    tx.execute(
        "INSERT INTO candidates (link, status, last_tested, retry_count)
         VALUES (?1, 'failed', ?2, 1)
         ON CONFLICT(link) DO UPDATE SET
            status = 'failed',
            last_tested = excluded.last_tested,
            retry_count = candidates.retry_count + 1",
        params![link, now],
    )?;
    Ok(())
}

fn record_pass(
    tx: &Transaction<'_>,
    link: &str,
    delay: u32,
    location: Option<&str>,
    now: &str,
) -> Result<()> {
    tx.execute(
        "INSERT INTO candidates (link, status, delay, location, last_tested, retry_count)
         VALUES (?1, 'latency_passed', ?2, ?3, ?4, 0)
         ON CONFLICT(link) DO UPDATE SET
            status = 'latency_passed',
            delay = excluded.delay,
            location = excluded.location,
            last_tested = excluded.last_tested,
            retry_count = 0",
        params![link, delay, location, now],
    )?;
    Ok(())
}

/// Active members of `location` other than `link`.
fn count_active(tx: &Transaction<'_>, location: &str, link: &str) -> Result<u64> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM candidates
         WHERE location = ?1 AND status != 'failed' AND link != ?2",
        params![location, link],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn worst_active(tx: &Transaction<'_>, location: &str, link: &str) -> Result<Option<PoolSlot>> {
    let slot = tx
        .query_row(
            &format!(
                "SELECT link, delay, last_tested FROM candidates
                 WHERE location = ?1 AND status != 'failed' AND link != ?2
                 ORDER BY {WORST_FIRST}
                 LIMIT 1"
            ),
            params![location, link],
            |row| {
                let last_tested: Option<String> = row.get(2)?;
                Ok(PoolSlot {
                    link: row.get(0)?,
                    delay: row.get(1)?,
                    last_tested: last_tested.as_deref().and_then(decode_ts),
                })
            },
        )
        .optional()?;
    Ok(slot)
}
