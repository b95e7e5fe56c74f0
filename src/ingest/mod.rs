//! Latency ingestion: merge measurement batches into the candidate store.

pub mod eviction;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cancel;
use crate::config::DatabaseConfig;
use crate::measure::LatencyResult;
use crate::storage::{CandidateStore, IngestSummary};

/// Applies latency batches under a per-location capacity.
#[derive(Debug, Clone, Copy)]
pub struct LatencyIngester {
    cap: u32,
}

impl LatencyIngester {
    pub fn new(cap: u32) -> Self {
        Self { cap }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(config.max_servers_per_location)
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    /// Merge `results` in one transaction. Nothing is written once `cancel`
    /// has tripped.
    pub fn ingest(
        &self,
        store: &CandidateStore,
        results: &[LatencyResult],
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<IngestSummary> {
        cancel::check(cancel)?;
        let summary = store.upsert_latency_batch(results, self.cap, now)?;
        info!(
            results = results.len(),
            admitted = summary.admitted,
            evicted = summary.evicted,
            discarded = summary.discarded,
            failed = summary.failed,
            cap = self.cap,
            "latency batch ingested"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CandidateStatus;

    #[test]
    fn test_cap_from_config() {
        let config = DatabaseConfig {
            max_servers_per_location: 4,
            ..DatabaseConfig::default()
        };
        assert_eq!(LatencyIngester::from_config(&config).cap(), 4);
    }

    #[test]
    fn test_cancelled_ingest_writes_nothing() {
        let store = CandidateStore::open_in_memory().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = LatencyIngester::new(2)
            .ingest(&store, &[LatencyResult::passed("vless://a", 10, Some("US"))], Utc::now(), &cancel)
            .unwrap_err();
        assert!(cancel::is_cancelled(&err));
        assert!(store.get("vless://a").unwrap().is_none());
    }

    #[test]
    fn test_mixed_batch_summary() {
        let store = CandidateStore::open_in_memory().unwrap();
        let batch = vec![
            LatencyResult::passed("vless://a", 100, Some("DE")),
            LatencyResult::passed("vless://b", 200, Some("DE")),
            LatencyResult::passed("vless://c", 300, Some("DE")),
            LatencyResult::passed("vless://d", 50, Some("DE")),
            LatencyResult::failed("vless://e"),
        ];

        let summary = LatencyIngester::new(2)
            .ingest(&store, &batch, Utc::now(), &CancellationToken::new())
            .unwrap();
        assert_eq!(
            summary,
            IngestSummary { admitted: 3, evicted: 1, discarded: 1, failed: 1 }
        );

        let members: Vec<_> = store
            .location_members("DE")
            .unwrap()
            .into_iter()
            .map(|c| c.link)
            .collect();
        assert_eq!(members, vec!["vless://d", "vless://a"]);
        assert_eq!(store.get("vless://e").unwrap().unwrap().status, CandidateStatus::Failed);
    }
}
