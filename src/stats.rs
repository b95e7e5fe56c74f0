//! Run statistics: counters and per-stage timings.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Timing {
    pub calls: u64,
    pub total_seconds: f64,
}

impl Timing {
    pub fn avg_seconds(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_seconds / self.calls as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    counters: BTreeMap<&'static str, u64>,
    timings: BTreeMap<&'static str, Timing>,
}

#[derive(Serialize)]
struct TimingSummary {
    calls: u64,
    total_seconds: f64,
    avg_seconds: f64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, key: &'static str, by: u64) {
        *self.counters.entry(key).or_default() += by;
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    pub fn record_timing(&mut self, key: &'static str, elapsed: Duration) {
        let timing = self.timings.entry(key).or_default();
        timing.calls += 1;
        timing.total_seconds += elapsed.as_secs_f64();
    }

    pub fn timing(&self, key: &str) -> Option<Timing> {
        self.timings.get(key).copied()
    }

    /// Counters plus a `performance_timings` object, as pretty JSON.
    pub fn summary_json(&self) -> String {
        let round = |v: f64| (v * 10_000.0).round() / 10_000.0;
        let timings: BTreeMap<&str, TimingSummary> = self
            .timings
            .iter()
            .map(|(key, t)| {
                (
                    *key,
                    TimingSummary {
                        calls: t.calls,
                        total_seconds: round(t.total_seconds),
                        avg_seconds: round(t.avg_seconds()),
                    },
                )
            })
            .collect();

        let mut summary = serde_json::Map::new();
        for (key, value) in &self.counters {
            summary.insert(key.to_string(), serde_json::Value::from(*value));
        }
        summary.insert(
            "performance_timings".to_string(),
            serde_json::to_value(timings).unwrap_or_default(),
        );
        serde_json::to_string_pretty(&summary).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_timings() {
        let mut stats = RunStats::new();
        stats.increment("links_collected", 3);
        stats.increment("links_collected", 2);
        stats.record_timing("latency", Duration::from_millis(500));
        stats.record_timing("latency", Duration::from_millis(1500));

        assert_eq!(stats.get("links_collected"), 5);
        assert_eq!(stats.get("missing"), 0);
        let timing = stats.timing("latency").unwrap();
        assert_eq!(timing.calls, 2);
        assert!((timing.avg_seconds() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_json_shape() {
        let mut stats = RunStats::new();
        stats.increment("admitted", 4);
        stats.record_timing("collect", Duration::from_millis(250));

        let value: serde_json::Value = serde_json::from_str(&stats.summary_json()).unwrap();
        assert_eq!(value["admitted"], 4);
        assert_eq!(value["performance_timings"]["collect"]["calls"], 1);
        assert_eq!(value["performance_timings"]["collect"]["total_seconds"], 0.25);
    }
}
