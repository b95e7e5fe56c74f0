//! Speed stage: pick candidates per location, persist throughput, choose a
//! best link for each location.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SpeedTestConfig;
use crate::measure::{SpeedResult, SpeedVerdict};
use crate::storage::CandidateStore;

#[derive(Debug, Clone, Copy)]
pub struct SpeedSelector {
    max_candidates_per_location: u32,
    min_download_mbps: f64,
}

/// Outcome of one speed reduction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpeedSelection {
    /// Location to best link, ordered by location.
    pub best: BTreeMap<String, String>,
    /// Speed results persisted to the store.
    pub recorded: usize,
    /// Persisted results that fell below the download threshold.
    pub below_threshold: usize,
}

struct Pick<'a> {
    link: &'a str,
    download: f64,
    rank: usize,
}

impl SpeedSelector {
    /// `min_download_mbps` of zero disables the threshold.
    pub fn new(max_candidates_per_location: u32, min_download_mbps: f64) -> Self {
        Self {
            max_candidates_per_location,
            min_download_mbps,
        }
    }

    pub fn from_config(config: &SpeedTestConfig) -> Self {
        Self::new(
            config.max_candidates_per_location,
            config.min_download_mbps.unwrap_or(0.0),
        )
    }

    /// The fastest latency-passed links per location.
    pub fn candidates(&self, store: &CandidateStore) -> Result<BTreeMap<String, Vec<String>>> {
        let pool = store.top_candidates_per_location(self.max_candidates_per_location)?;
        info!(
            locations = pool.len(),
            candidates = pool.values().map(Vec::len).sum::<usize>(),
            "speed candidates selected"
        );
        Ok(pool)
    }

    /// Persist every passed result for a pool member, then choose the best
    /// qualifying link per location.
    ///
    /// Ties on download keep the member that appears first in `pool`, which
    /// is the lower-delay one.
    pub fn reduce(
        &self,
        store: &CandidateStore,
        pool: &BTreeMap<String, Vec<String>>,
        results: &[SpeedResult],
        now: DateTime<Utc>,
    ) -> Result<SpeedSelection> {
        let mut membership: HashMap<&str, (&str, usize)> = HashMap::new();
        for (location, links) in pool {
            for (rank, link) in links.iter().enumerate() {
                membership.insert(link.as_str(), (location.as_str(), rank));
            }
        }

        let mut selection = SpeedSelection::default();
        let mut picks: BTreeMap<&str, Pick<'_>> = BTreeMap::new();

        for result in results {
            let SpeedVerdict::Passed { download, upload } = result.verdict else {
                debug!(link = %result.link, "speed test failed");
                continue;
            };
            let Some(&(location, rank)) = membership.get(result.link.as_str()) else {
                warn!(link = %result.link, "speed result for a link outside the candidate pool, ignoring");
                continue;
            };

            if !store.record_speed_result(&result.link, download, upload, now)? {
                warn!(link = %result.link, "speed result for a candidate no longer stored");
                continue;
            }
            selection.recorded += 1;

            if self.min_download_mbps > 0.0 && download < self.min_download_mbps {
                debug!(link = %result.link, download, min = self.min_download_mbps, "below download threshold");
                selection.below_threshold += 1;
                continue;
            }

            let link = result.link.as_str();
            let better = match picks.get(location) {
                None => true,
                Some(current) => {
                    download > current.download || (download == current.download && rank < current.rank)
                }
            };
            if better {
                picks.insert(location, Pick { link, download, rank });
            }
        }

        selection.best = picks
            .into_iter()
            .map(|(location, pick)| (location.to_string(), pick.link.to_string()))
            .collect();
        info!(
            recorded = selection.recorded,
            below_threshold = selection.below_threshold,
            locations = selection.best.len(),
            "speed results reduced"
        );
        Ok(selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::LatencyResult;
    use crate::storage::CandidateStatus;

    fn seed(store: &CandidateStore, rows: &[(&str, u32, &str)]) {
        let batch: Vec<_> = rows
            .iter()
            .map(|(link, delay, location)| LatencyResult::passed(*link, *delay, Some(location)))
            .collect();
        store.upsert_latency_batch(&batch, 10, Utc::now()).unwrap();
    }

    #[test]
    fn test_threshold_picks_only_qualifying_and_persists_all() {
        let store = CandidateStore::open_in_memory().unwrap();
        seed(&store, &[("vless://d1", 40, "DE"), ("vless://d2", 60, "DE"), ("vless://d3", 80, "DE")]);

        let selector = SpeedSelector::new(3, 6.0);
        let pool = selector.candidates(&store).unwrap();
        assert_eq!(pool["DE"], vec!["vless://d1", "vless://d2", "vless://d3"]);

        let results = vec![
            SpeedResult::passed("vless://d1", 5.0, 1.0),
            SpeedResult::passed("vless://d2", 9.0, 1.0),
            SpeedResult::passed("vless://d3", 3.0, 1.0),
        ];
        let selection = selector.reduce(&store, &pool, &results, Utc::now()).unwrap();

        assert_eq!(selection.best.get("DE").map(String::as_str), Some("vless://d2"));
        assert_eq!(selection.recorded, 3);
        assert_eq!(selection.below_threshold, 2);
        for (link, download) in [("vless://d1", 5.0), ("vless://d2", 9.0), ("vless://d3", 3.0)] {
            let candidate = store.get(link).unwrap().unwrap();
            assert_eq!(candidate.status, CandidateStatus::SpeedPassed);
            assert_eq!(candidate.download, Some(download));
        }
    }

    #[test]
    fn test_no_qualifying_candidate_means_no_selection() {
        let store = CandidateStore::open_in_memory().unwrap();
        seed(&store, &[("vless://a", 40, "FR")]);
        let selector = SpeedSelector::new(1, 50.0);
        let pool = selector.candidates(&store).unwrap();

        let selection = selector
            .reduce(&store, &pool, &[SpeedResult::passed("vless://a", 10.0, 0.0)], Utc::now())
            .unwrap();
        assert!(selection.best.is_empty());
        assert_eq!(selection.recorded, 1);
    }

    #[test]
    fn test_tie_keeps_lower_delay_member() {
        let store = CandidateStore::open_in_memory().unwrap();
        seed(&store, &[("vless://slow", 90, "JP"), ("vless://quick", 30, "JP")]);
        let selector = SpeedSelector::new(2, 0.0);
        let pool = selector.candidates(&store).unwrap();

        let results = vec![
            SpeedResult::passed("vless://slow", 20.0, 0.0),
            SpeedResult::passed("vless://quick", 20.0, 0.0),
        ];
        let selection = selector.reduce(&store, &pool, &results, Utc::now()).unwrap();
        assert_eq!(selection.best["JP"], "vless://quick");
    }

    #[test]
    fn test_failed_and_foreign_results_are_ignored() {
        let store = CandidateStore::open_in_memory().unwrap();
        seed(&store, &[("vless://a", 40, "US"), ("vless://outside", 500, "US")]);
        let selector = SpeedSelector::new(1, 0.0);
        let pool = selector.candidates(&store).unwrap();

        let results = vec![
            SpeedResult::failed("vless://a"),
            SpeedResult::passed("vless://outside", 99.0, 0.0),
        ];
        let selection = selector.reduce(&store, &pool, &results, Utc::now()).unwrap();
        assert!(selection.best.is_empty());
        assert_eq!(selection.recorded, 0);
        assert_eq!(
            store.get("vless://outside").unwrap().unwrap().status,
            CandidateStatus::LatencyPassed
        );
    }
}
