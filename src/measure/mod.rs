//! External measurement: the xray-knife wrapper and typed result records.
//!
//! The measurement binary reports one CSV row per link. Rows are turned into
//! [`LatencyResult`] or [`SpeedResult`] here; anything that cannot be read is
//! skipped with a warning rather than failing the whole batch.

pub mod csv;
pub mod process;
pub mod xray_knife;

use std::collections::BTreeMap;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use xray_knife::XrayKnife;

/// One output row, keyed by CSV header.
pub type Record = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum MeasureError {
    #[error("measurement binary not found: {path}")]
    NotFound { path: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("measurement I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("measurement process exited with code {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("measurement process timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("measurement cancelled")]
    Cancelled,

    #[error("unreadable measurement output: {0}")]
    Output(String),
}

/// Which measurement the binary performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MeasureMode {
    Latency,
    Speed,
}

impl std::fmt::Display for MeasureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeasureMode::Latency => write!(f, "latency"),
            MeasureMode::Speed => write!(f, "speed"),
        }
    }
}

/// Trait for measurement collaborators.
#[async_trait::async_trait]
pub trait Measurer: Send + Sync {
    /// Measure `links` and return the raw rows.
    ///
    /// Must return [`MeasureError::Cancelled`] (and no rows) when `cancel`
    /// trips before the run completes.
    async fn run(
        &self,
        links: &[String],
        mode: MeasureMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, MeasureError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum LatencyVerdict {
    Passed {
        delay: u32,
        location: Option<String>,
    },
    Failed,
}

/// A single latency measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyResult {
    pub link: String,
    pub verdict: LatencyVerdict,
}

impl LatencyResult {
    pub fn passed(link: impl Into<String>, delay: u32, location: Option<&str>) -> Self {
        Self {
            link: link.into(),
            verdict: LatencyVerdict::Passed {
                delay,
                location: normalize_location(location),
            },
        }
    }

    pub fn failed(link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            verdict: LatencyVerdict::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpeedVerdict {
    Passed { download: f64, upload: f64 },
    Failed,
}

/// A single speed measurement. Throughput is in Mbps.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedResult {
    pub link: String,
    pub verdict: SpeedVerdict,
}

impl SpeedResult {
    pub fn passed(link: impl Into<String>, download: f64, upload: f64) -> Self {
        Self {
            link: link.into(),
            verdict: SpeedVerdict::Passed { download, upload },
        }
    }

    pub fn failed(link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            verdict: SpeedVerdict::Failed,
        }
    }
}

fn normalize_location(location: Option<&str>) -> Option<String> {
    location
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
}

fn field<'a>(record: &'a Record, key: &str) -> Option<&'a str> {
    record.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn is_passed(record: &Record) -> Option<bool> {
    field(record, "status").map(|s| s.eq_ignore_ascii_case("passed"))
}

/// Accepts "120", "120.4" and "120ms".
fn parse_delay(raw: &str) -> Option<u32> {
    let value: f64 = raw.trim_end_matches("ms").trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 || value > u32::MAX as f64 {
        return None;
    }
    Some(value.round() as u32)
}

fn parse_throughput(raw: &str) -> Option<f64> {
    let value: f64 = raw.parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// Convert latency rows, skipping malformed ones.
pub fn parse_latency_records(records: &[Record]) -> Vec<LatencyResult> {
    let mut results = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let Some(link) = field(record, "link") else {
            warn!(row = index, "latency row without link, skipping");
            continue;
        };
        match is_passed(record) {
            None => warn!(row = index, link, "latency row without status, skipping"),
            Some(false) => results.push(LatencyResult::failed(link)),
            Some(true) => match field(record, "delay").and_then(parse_delay) {
                Some(delay) => {
                    results.push(LatencyResult::passed(link, delay, field(record, "location")))
                }
                None => warn!(row = index, link, "passed latency row without a usable delay, skipping"),
            },
        }
    }
    results
}

/// Convert speed rows, skipping malformed ones.
pub fn parse_speed_records(records: &[Record]) -> Vec<SpeedResult> {
    let mut results = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let Some(link) = field(record, "link") else {
            warn!(row = index, "speed row without link, skipping");
            continue;
        };
        match is_passed(record) {
            None => warn!(row = index, link, "speed row without status, skipping"),
            Some(false) => results.push(SpeedResult::failed(link)),
            Some(true) => {
                let Some(download) = field(record, "download").and_then(parse_throughput) else {
                    warn!(row = index, link, "passed speed row without a usable download, skipping");
                    continue;
                };
                let upload = field(record, "upload").and_then(parse_throughput).unwrap_or(0.0);
                results.push(SpeedResult::passed(link, download, upload));
            }
        }
    }
    results
}
