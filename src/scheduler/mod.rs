//! Retest scheduling: decide which links the next latency run measures.

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cancel;
use crate::config::DatabaseConfig;
use crate::storage::CandidateStore;

/// Picks new links plus stored candidates that are stale or still retrying.
///
/// Output is a sorted set, so the same store state and clock reading always
/// produce the same batch.
#[derive(Debug, Clone, Copy)]
pub struct RetestScheduler {
    window: Duration,
    max_retries: u32,
}

impl RetestScheduler {
    pub fn new(retest_window_hours: u32, max_retries: u32) -> Self {
        Self {
            window: Duration::hours(i64::from(retest_window_hours)),
            max_retries,
        }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(config.retest_window_hours, config.max_retries)
    }

    pub fn links_to_test(
        &self,
        store: &CandidateStore,
        new_links: &BTreeSet<String>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<BTreeSet<String>> {
        cancel::check(cancel)?;
        let due = store.candidates_needing_test(new_links, self.window, self.max_retries, now)?;
        info!(
            new = new_links.len(),
            retest = due.len().saturating_sub(new_links.len()),
            total = due.len(),
            "retest batch scheduled"
        );
        Ok(due)
    }
}
