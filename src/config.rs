//! TOML configuration.
//!
//! Every section has compiled-in defaults so a partial file is enough. The
//! file is parsed once at startup and checked by [`Config::validate`] before
//! any stage runs; bad values are reported together instead of surfacing
//! deep inside the pipeline.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::proxy::SelectorMode;

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "PROXYSIFT_CONFIG";

#[derive(Debug, Error)]
#[error("invalid configuration:\n  - {}", .problems.join("\n  - "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub measurement: MeasurementConfig,
    #[serde(default)]
    pub speed_test: SpeedTestConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Load and validate in one step.
    pub fn load_validated(path: &Path) -> Result<Self> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value range and cross-field rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.database.max_servers_per_location == 0 {
            problems.push("database.max_servers_per_location must be greater than 0".into());
        }
        if self.measurement.path.trim().is_empty() {
            problems.push("measurement.path must not be empty".into());
        }
        if self.measurement.timeout_secs == 0 {
            problems.push("measurement.timeout_secs must be greater than 0".into());
        }
        if self.speed_test.max_candidates_per_location == 0 {
            problems.push("speed_test.max_candidates_per_location must be greater than 0".into());
        }
        if let Some(min) = self.speed_test.min_download_mbps {
            if !min.is_finite() || min < 0.0 {
                problems.push(format!("speed_test.min_download_mbps must be >= 0 (got {min})"));
            }
        }
        if self.proxy.max_links == 0 {
            problems.push("proxy.max_links must be greater than 0".into());
        }
        if self.proxy.enabled && self.proxy.listen_port == 0 {
            problems.push("proxy.listen_port must be set when the proxy is enabled".into());
        }
        if self.collector.max_messages_per_source == 0 {
            problems.push("collector.max_messages_per_source must be greater than 0".into());
        }

        let mut seen = HashSet::new();
        for source in &self.collector.sources {
            if source.id.trim().is_empty() {
                problems.push("collector.sources entries need a non-empty id".into());
            } else if !seen.insert(source.id.as_str()) {
                problems.push(format!("collector source id '{}' is used twice", source.id));
            }
            match (&source.path, &source.url) {
                (Some(_), None) | (None, Some(_)) => {}
                _ => problems.push(format!(
                    "collector source '{}' needs exactly one of path or url",
                    source.id
                )),
            }
        }

        if self.logging.rotate.enabled && self.logging.rotate.max_bytes == 0 {
            problems.push("logging.rotate.max_bytes must be greater than 0 when rotation is enabled".into());
        }

        if self.publish.enabled {
            if self.publish.file_path.is_none() && self.publish.github.is_none() {
                problems.push("publish is enabled but neither file_path nor [publish.github] is set".into());
            }
            if let Some(github) = &self.publish.github {
                for (name, value) in [("owner", &github.owner), ("repo", &github.repo), ("path", &github.path)] {
                    if value.trim().is_empty() {
                        problems.push(format!("publish.github.{name} must not be empty"));
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { problems })
        }
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Candidate store location and lifecycle thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file.
    pub path: PathBuf,
    /// Cap on active (non-failed) candidates per location.
    pub max_servers_per_location: u32,
    /// Hours after which a tested candidate is measured again.
    pub retest_window_hours: u32,
    /// Consecutive failures after which a candidate is considered dead.
    pub max_retries: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/proxysift.db"),
            max_servers_per_location: 10,
            retest_window_hours: 24,
            max_retries: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Measurement
// ---------------------------------------------------------------------------

/// The external xray-knife binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    /// Path (or bare command name resolved via `$PATH`).
    pub path: String,
    /// Extra arguments appended to every `http` invocation.
    pub test_args: Vec<String>,
    /// Hard limit for one measurement run.
    pub timeout_secs: u64,
    /// Scratch directory the binary leaves behind; removed at run end.
    pub state_dir: Option<PathBuf>,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            path: "xray-knife".to_string(),
            test_args: Vec::new(),
            timeout_secs: 1800,
            state_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Speed test
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedTestConfig {
    pub enabled: bool,
    /// Fastest latency-passed candidates per location that get speed tested.
    pub max_candidates_per_location: u32,
    /// Minimum download (Mbps) for a candidate to be picked as best.
    pub min_download_mbps: Option<f64>,
}

impl Default for SpeedTestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_candidates_per_location: 3,
            min_download_mbps: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Local proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Start a local SOCKS proxy at run start for the collection stage.
    pub enabled: bool,
    pub selector: SelectorMode,
    pub max_links: u32,
    pub listen_host: String,
    pub listen_port: u16,
    /// xray-knife subcommand that serves the proxy.
    pub subcommand: String,
    pub extra_args: Vec<String>,
    /// How long the child must stay up before it counts as started.
    pub startup_grace_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            selector: SelectorMode::SpeedPassed,
            max_links: 5,
            listen_host: "127.0.0.1".to_string(),
            listen_port: 10808,
            subcommand: "proxy".to_string(),
            extra_args: Vec::new(),
            startup_grace_ms: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Upper bound on new messages read from one source per run.
    pub max_messages_per_source: usize,
    pub sources: Vec<SourceConfig>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_messages_per_source: 500,
            sources: Vec::new(),
        }
    }
}

/// A line-oriented feed. Exactly one of `path` or `url` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
}

// ---------------------------------------------------------------------------
// Publish
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub enabled: bool,
    /// Base64-encode the subscription body.
    pub base64: bool,
    pub file_path: Option<PathBuf>,
    pub github: Option<GithubConfig>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base64: true,
            file_path: None,
            github: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    pub owner: String,
    pub repo: String,
    /// File path inside the repository.
    pub path: String,
    #[serde(default)]
    pub branch: Option<String>,
    /// Falls back to `GITHUB_TOKEN`.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_commit_message() -> String {
    "Update subscription".to_string()
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level; `RUST_LOG` wins when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Append logs to this file instead of stderr.
    pub file: Option<PathBuf>,
    /// Size-based rotation of `file`.
    pub rotate: RotateConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
            rotate: RotateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotateConfig {
    pub enabled: bool,
    /// Roll the file over once it would grow past this size.
    pub max_bytes: u64,
    /// Rolled-over files kept as `<file>.1` .. `<file>.N`.
    pub backup_count: u32,
}

impl Default for RotateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_bytes: 5 * 1024 * 1024,
            backup_count: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
