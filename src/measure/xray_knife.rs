//! [`Measurer`] backed by the xray-knife command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::process::run_to_completion;
use super::{csv, MeasureError, MeasureMode, Measurer, Record};
use crate::config::MeasurementConfig;

/// Longest stderr excerpt carried in an [`MeasureError::Exited`].
const STDERR_EXCERPT: usize = 2048;

#[derive(Debug, Clone)]
pub struct XrayKnife {
    path: PathBuf,
    test_args: Vec<String>,
    timeout: Duration,
}

impl XrayKnife {
    /// Resolve the binary named in `config`. Bare names are looked up in `$PATH`.
    pub fn new(config: &MeasurementConfig) -> Result<Self, MeasureError> {
        let path = resolve_binary(&config.path)?;
        Ok(Self {
            path,
            test_args: config.test_args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn command(&self, input: &Path, output: &Path, mode: MeasureMode) -> Command {
        let mut command = Command::new(&self.path);
        command
            .arg("http")
            .arg("-f")
            .arg(input)
            .arg("-o")
            .arg(output)
            .args(&self.test_args)
            .args(["-x", "csv"]);
        if mode == MeasureMode::Speed {
            command.arg("-p");
        }
        command
    }
}

/// Resolve a configured binary path or command name.
pub fn resolve_binary(configured: &str) -> Result<PathBuf, MeasureError> {
    let candidate = Path::new(configured);
    if candidate.components().count() > 1 {
        return if candidate.is_file() {
            Ok(candidate.to_path_buf())
        } else {
            Err(MeasureError::NotFound { path: configured.to_string() })
        };
    }
    which::which(configured).map_err(|_| MeasureError::NotFound { path: configured.to_string() })
}

#[async_trait]
impl Measurer for XrayKnife {
    async fn run(
        &self,
        links: &[String],
        mode: MeasureMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, MeasureError> {
        if links.is_empty() {
            return Ok(Vec::new());
        }
        if cancel.is_cancelled() {
            return Err(MeasureError::Cancelled);
        }

        let mut input = tempfile::Builder::new()
            .prefix("proxysift-links-")
            .suffix(".txt")
            .tempfile()?;
        for link in links {
            writeln!(input, "{link}")?;
        }
        input.flush()?;

        let output = tempfile::Builder::new()
            .prefix("proxysift-report-")
            .suffix(".csv")
            .tempfile()?;

        info!(%mode, links = links.len(), binary = %self.path.display(), "starting measurement");
        let started = std::time::Instant::now();
        let result = run_to_completion(
            self.command(input.path(), output.path(), mode),
            self.timeout,
            cancel,
        )
        .await?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let stderr: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            return Err(MeasureError::Exited {
                code: result.status.code(),
                stderr,
            });
        }

        let report = tokio::fs::read_to_string(output.path()).await?;
        let records = csv::parse(&report)?;
        if records.len() != links.len() {
            warn!(%mode, expected = links.len(), got = records.len(), "report row count differs from input");
        }
        info!(
            %mode,
            rows = records.len(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "measurement finished"
        );
        Ok(records)
    }
}
