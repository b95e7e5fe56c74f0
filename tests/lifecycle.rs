//! Candidate lifecycle through the public API: eviction, retries, retest
//! window, speed selection and proxy fallback.

use std::collections::BTreeSet;

use chrono::{Duration, Utc};
use proxysift::ingest::LatencyIngester;
use proxysift::measure::{LatencyResult, SpeedResult};
use proxysift::proxy::{ProxyCandidateSelector, SelectorMode};
use proxysift::scheduler::RetestScheduler;
use proxysift::speed::SpeedSelector;
use proxysift::storage::{CandidateStatus, IngestSummary};
use proxysift::CandidateStore;
use tokio_util::sync::CancellationToken;

fn active_links(store: &CandidateStore, location: &str) -> BTreeSet<String> {
    store
        .location_members(location)
        .unwrap()
        .into_iter()
        .filter(|c| c.status != CandidateStatus::Failed)
        .map(|c| c.link)
        .collect()
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_full_pool_evicts_slower_then_discards_slower_newcomer() {
    let store = CandidateStore::open_in_memory().unwrap();
    let ingester = LatencyIngester::new(2);
    let cancel = CancellationToken::new();
    let t0 = Utc::now() - Duration::minutes(10);

    ingester
        .ingest(
            &store,
            &[
                LatencyResult::passed("A", 100, Some("US")),
                LatencyResult::passed("B", 150, Some("US")),
            ],
            t0,
            &cancel,
        )
        .unwrap();

    // C beats the worst member B.
    let summary = ingester
        .ingest(&store, &[LatencyResult::passed("C", 120, Some("US"))], Utc::now(), &cancel)
        .unwrap();
    assert_eq!(summary, IngestSummary { admitted: 1, evicted: 1, discarded: 0, failed: 0 });
    assert_eq!(active_links(&store, "US"), set(&["A", "C"]));
    assert!(store.get("B").unwrap().is_none());

    // D is slower than the worst member C and leaves no trace.
    let summary = ingester
        .ingest(&store, &[LatencyResult::passed("D", 200, Some("US"))], Utc::now(), &cancel)
        .unwrap();
    assert_eq!(summary.discarded, 1);
    assert_eq!(active_links(&store, "US"), set(&["A", "C"]));
    assert!(store.get("D").unwrap().is_none());
}

#[test]
fn test_pool_keeps_lowest_delays_seen() {
    let store = CandidateStore::open_in_memory().unwrap();
    let ingester = LatencyIngester::new(3);
    let cancel = CancellationToken::new();
    let delays = [400u32, 90, 310, 45, 270, 120, 500, 60];

    for (i, delay) in delays.iter().enumerate() {
        let link = format!("vless://n{i}");
        ingester
            .ingest(&store, &[LatencyResult::passed(link, *delay, Some("SG"))], Utc::now(), &cancel)
            .unwrap();
        assert!(active_links(&store, "SG").len() <= 3);
    }

    let kept: Vec<u32> = store
        .location_members("SG")
        .unwrap()
        .into_iter()
        .filter_map(|c| c.delay)
        .collect();
    assert_eq!(kept, vec![45, 60, 90]);
}

#[test]
fn test_repeated_failures_exhaust_retries() {
    let store = CandidateStore::open_in_memory().unwrap();
    let ingester = LatencyIngester::new(5);
    let scheduler = RetestScheduler::new(24, 3);
    let cancel = CancellationToken::new();
    let mut now = Utc::now() - Duration::days(3);

    for expected in 1..=3u32 {
        ingester
            .ingest(&store, &[LatencyResult::failed("X")], now, &cancel)
            .unwrap();
        assert_eq!(store.get("X").unwrap().unwrap().retry_count, expected);
        now += Duration::hours(1);
    }

    let due = scheduler.links_to_test(&store, &BTreeSet::new(), Utc::now(), &cancel).unwrap();
    assert!(!due.contains("X"));

    let due = scheduler.links_to_test(&store, &set(&["X"]), Utc::now(), &cancel).unwrap();
    assert!(due.contains("X"));

    // A pass resets the counter.
    ingester
        .ingest(&store, &[LatencyResult::passed("X", 80, Some("FR"))], Utc::now(), &cancel)
        .unwrap();
    let x = store.get("X").unwrap().unwrap();
    assert_eq!(x.retry_count, 0);
    assert_eq!(x.status, CandidateStatus::LatencyPassed);
}

#[test]
fn test_stale_candidate_is_rescheduled() {
    let store = CandidateStore::open_in_memory().unwrap();
    let cancel = CancellationToken::new();
    let now = Utc::now();

    LatencyIngester::new(5)
        .ingest(
            &store,
            &[LatencyResult::passed("Y", 70, Some("NL"))],
            now - Duration::hours(30),
            &cancel,
        )
        .unwrap();
    LatencyIngester::new(5)
        .ingest(
            &store,
            &[LatencyResult::passed("Z", 70, Some("NL"))],
            now - Duration::hours(1),
            &cancel,
        )
        .unwrap();

    let due = RetestScheduler::new(24, 3)
        .links_to_test(&store, &BTreeSet::new(), now, &cancel)
        .unwrap();
    assert_eq!(due, set(&["Y"]));
}

#[test]
fn test_speed_threshold_selects_only_qualifying_candidate() {
    let store = CandidateStore::open_in_memory().unwrap();
    LatencyIngester::new(5)
        .ingest(
            &store,
            &[
                LatencyResult::passed("de-1", 30, Some("DE")),
                LatencyResult::passed("de-2", 40, Some("DE")),
                LatencyResult::passed("de-3", 50, Some("DE")),
            ],
            Utc::now(),
            &CancellationToken::new(),
        )
        .unwrap();

    let selector = SpeedSelector::new(3, 6.0);
    let pool = selector.candidates(&store).unwrap();
    let selection = selector
        .reduce(
            &store,
            &pool,
            &[
                SpeedResult::passed("de-1", 5.0, 0.5),
                SpeedResult::passed("de-2", 9.0, 0.5),
                SpeedResult::passed("de-3", 3.0, 0.5),
            ],
            Utc::now(),
        )
        .unwrap();

    assert_eq!(selection.best.len(), 1);
    assert_eq!(selection.best["DE"], "de-2");
    for link in ["de-1", "de-2", "de-3"] {
        let candidate = store.get(link).unwrap().unwrap();
        assert_eq!(candidate.status, CandidateStatus::SpeedPassed);
        assert!(candidate.speed_tested_at.is_some());
    }
}

#[test]
fn test_proxy_selector_falls_back_to_latency() {
    let store = CandidateStore::open_in_memory().unwrap();
    LatencyIngester::new(5)
        .ingest(
            &store,
            &[
                LatencyResult::passed("p50", 50, Some("US")),
                LatencyResult::passed("p80", 80, Some("US")),
                LatencyResult::passed("p65", 65, Some("US")),
            ],
            Utc::now(),
            &CancellationToken::new(),
        )
        .unwrap();

    let links = ProxyCandidateSelector::new(SelectorMode::SpeedPassed, 2)
        .select(&store)
        .unwrap();
    assert_eq!(links, vec!["p50", "p65"]);
}

#[test]
fn test_file_store_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("state/pool.db");

    let store = CandidateStore::open(&path).unwrap();
    LatencyIngester::new(2)
        .ingest(
            &store,
            &[LatencyResult::passed("keep", 10, Some("JP"))],
            Utc::now(),
            &CancellationToken::new(),
        )
        .unwrap();
    store.set_cursor("feed", 12, Utc::now()).unwrap();
    store.close();

    let store = CandidateStore::open(&path).unwrap();
    assert_eq!(store.get("keep").unwrap().unwrap().delay, Some(10));
    assert_eq!(store.cursor("feed").unwrap(), Some(12));
}

#[test]
fn test_concurrent_batches_never_share_a_victim() {
    for round in 0..5 {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CandidateStore::open(dir.path().join("pool.db")).unwrap();
        LatencyIngester::new(2)
            .ingest(
                &store,
                &[
                    LatencyResult::passed("seed-a", 200, Some("US")),
                    LatencyResult::passed("seed-b", 210, Some("US")),
                ],
                Utc::now(),
                &CancellationToken::new(),
            )
            .unwrap();

        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    LatencyIngester::new(2)
                        .ingest(
                            &store,
                            &[LatencyResult::passed(format!("n{i}"), 50 + i, Some("US"))],
                            Utc::now(),
                            &CancellationToken::new(),
                        )
                        .unwrap()
                })
            })
            .collect();
        let summaries: Vec<IngestSummary> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for summary in &summaries {
            assert_eq!(summary.admitted + summary.discarded, 1, "round {round}: {summary:?}");
        }
        let admitted: usize = summaries.iter().map(|s| s.admitted).sum();
        let evicted: usize = summaries.iter().map(|s| s.evicted).sum();
        assert_eq!(admitted, evicted, "round {round}");

        let kept: Vec<(String, Option<u32>)> = store
            .location_members("US")
            .unwrap()
            .into_iter()
            .filter(|c| c.status != CandidateStatus::Failed)
            .map(|c| (c.link, c.delay))
            .collect();
        assert_eq!(
            kept,
            vec![("n0".to_string(), Some(50)), ("n1".to_string(), Some(51))],
            "round {round}"
        );
    }
}
