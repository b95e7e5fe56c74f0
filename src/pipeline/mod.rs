//! The run orchestrator: bootstrap → collect → latency → speed → publish.
//!
//! Stages run sequentially against one [`CandidateStore`]. The cancellation
//! token is checked between stages and inside every measurement; a tripped
//! token ends the run with [`PipelineError::Cancelled`] after cleanup, and no
//! partial batch from the interrupted stage is merged.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cancel;
use crate::collect::{Collection, Collector};
use crate::config::Config;
use crate::ingest::LatencyIngester;
use crate::measure::{self, MeasureError, MeasureMode, Measurer, Record};
use crate::proxy::{LocalProxy, ProxyCandidateSelector};
use crate::publish::{self, Publisher};
use crate::scheduler::RetestScheduler;
use crate::speed::SpeedSelector;
use crate::stats::RunStats;
use crate::storage::CandidateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Bootstrap,
    Collect,
    Latency,
    Speed,
    Publish,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Bootstrap => "bootstrap",
            Stage::Collect => "collect",
            Stage::Latency => "latency",
            Stage::Speed => "speed",
            Stage::Publish => "publish",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("run cancelled during {stage} stage")]
    Cancelled { stage: Stage },
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Best link per location chosen by the speed stage.
    pub best: BTreeMap<String, String>,
    pub stats: RunStats,
}

/// A run that stopped early, with the statistics gathered up to that point.
#[derive(Debug, Error)]
#[error("{error:#}")]
pub struct RunFailure {
    pub stats: RunStats,
    pub error: anyhow::Error,
}

impl RunFailure {
    /// A failure raised while assembling the run, before any stage started.
    pub fn before_start(error: anyhow::Error) -> Self {
        Self {
            stats: RunStats::new(),
            error,
        }
    }
}

pub struct Pipeline {
    config: Config,
    store: CandidateStore,
    collector: Collector,
    measurer: Arc<dyn Measurer>,
    publishers: Vec<Box<dyn Publisher>>,
    proxy_binary: Option<PathBuf>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: CandidateStore,
        collector: Collector,
        measurer: Arc<dyn Measurer>,
        publishers: Vec<Box<dyn Publisher>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            collector,
            measurer,
            publishers,
            proxy_binary: None,
            cancel,
        }
    }

    /// Binary that serves the local proxy; defaults to the measurement binary.
    pub fn with_proxy_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.proxy_binary = Some(path.into());
        self
    }

    /// Run every stage once. Cleanup (proxy shutdown, state dir removal,
    /// store close, summary) happens whether the stages succeed or not, and a
    /// failure still carries the statistics collected so far.
    pub async fn run(self) -> Result<RunReport, RunFailure> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);

        async move {
            info!("run started");
            let started = Instant::now();
            let mut stats = RunStats::new();
            let mut proxy = None;

            let outcome = self.stages(&mut stats, &mut proxy).await;

            if let Some(proxy) = proxy {
                proxy.stop().await;
            }
            self.remove_state_dir();
            stats.record_timing("run", started.elapsed());
            self.store.close();
            info!(summary = %stats.summary_json(), "run summary");

            match outcome {
                Ok(best) => {
                    info!(locations = best.len(), "run finished");
                    Ok(RunReport { run_id, best, stats })
                }
                Err(error) => {
                    if cancel::is_cancelled(&error) {
                        warn!(%error, "run cancelled");
                    }
                    Err(RunFailure { stats, error })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn stages(
        &self,
        stats: &mut RunStats,
        proxy: &mut Option<LocalProxy>,
    ) -> Result<BTreeMap<String, String>> {
        if self.config.proxy.enabled {
            self.checkpoint(Stage::Bootstrap)?;
            *proxy = self.bootstrap_proxy(stats).await.map_err(|e| stage_error(Stage::Bootstrap, e))?;
        }

        self.checkpoint(Stage::Collect)?;
        let timer = Instant::now();
        let endpoint = proxy.as_ref().map(LocalProxy::endpoint);
        let collection = self
            .collect_stage(endpoint)
            .await
            .map_err(|e| stage_error(Stage::Collect, e))?;
        stats.increment("links_collected", collection.links.len() as u64);
        stats.record_timing("collect", timer.elapsed());

        self.checkpoint(Stage::Latency)?;
        let timer = Instant::now();
        self.latency_stage(collection, stats)
            .await
            .map_err(|e| stage_error(Stage::Latency, e))?;
        stats.record_timing("latency", timer.elapsed());

        if !self.config.speed_test.enabled {
            info!("speed test disabled, nothing to publish");
            return Ok(BTreeMap::new());
        }
        self.checkpoint(Stage::Speed)?;
        let timer = Instant::now();
        let best = self
            .speed_stage(stats)
            .await
            .map_err(|e| stage_error(Stage::Speed, e))?;
        stats.increment("best_servers_found", best.len() as u64);
        stats.record_timing("speed", timer.elapsed());

        self.checkpoint(Stage::Publish)?;
        let timer = Instant::now();
        self.publish_stage(&best, stats)
            .await
            .map_err(|e| stage_error(Stage::Publish, e))?;
        stats.record_timing("publish", timer.elapsed());

        Ok(best)
    }

    async fn bootstrap_proxy(&self, stats: &mut RunStats) -> Result<Option<LocalProxy>> {
        let selector = ProxyCandidateSelector::from_config(&self.config.proxy);
        let links = self.blocking(move |store| selector.select(store)).await?;
        if links.is_empty() {
            warn!("no candidates for the local proxy, collecting without it");
            return Ok(None);
        }

        let binary = match &self.proxy_binary {
            Some(path) => path.clone(),
            None => measure::xray_knife::resolve_binary(&self.config.measurement.path)?,
        };
        match LocalProxy::start(&self.config.proxy, &binary, &links).await {
            Ok(proxy) => {
                stats.increment("proxy_links", links.len() as u64);
                Ok(Some(proxy))
            }
            Err(e) => {
                warn!(error = %e, "local proxy failed to start, collecting without it");
                stats.increment("proxy_failures", 1);
                Ok(None)
            }
        }
    }

    async fn collect_stage(&self, endpoint: Option<&str>) -> Result<Collection> {
        let sources = self.collector.source_ids();
        let cursors = self.blocking(move |store| store.cursors(&sources)).await?;
        self.collector.collect(&cursors, endpoint, &self.cancel).await
    }

    async fn latency_stage(&self, collection: Collection, stats: &mut RunStats) -> Result<()> {
        let scheduler = RetestScheduler::from_config(&self.config.database);
        let new_links = collection.links;
        let cancel = self.cancel.clone();
        let due = self
            .blocking(move |store| scheduler.links_to_test(store, &new_links, Utc::now(), &cancel))
            .await?;
        stats.increment("links_scheduled", due.len() as u64);

        if !due.is_empty() {
            let links: Vec<String> = due.into_iter().collect();
            let Some(records) = self.measure(&links, MeasureMode::Latency, stats).await? else {
                warn!("latency measurement failed, source cursors left unchanged");
                return Ok(());
            };
            let results = measure::parse_latency_records(&records);
            stats.increment("latency_results", results.len() as u64);

            let ingester = LatencyIngester::from_config(&self.config.database);
            let cancel = self.cancel.clone();
            let summary = self
                .blocking(move |store| ingester.ingest(store, &results, Utc::now(), &cancel))
                .await?;
            stats.increment("admitted", summary.admitted as u64);
            stats.increment("evicted", summary.evicted as u64);
            stats.increment("discarded", summary.discarded as u64);
            stats.increment("latency_failed", summary.failed as u64);
        }

        let cursors = collection.cursors;
        if !cursors.is_empty() {
            self.blocking(move |store| store.set_cursors(&cursors, Utc::now()))
                .await
                .context("failed to commit source cursors")?;
        }
        Ok(())
    }

    async fn speed_stage(&self, stats: &mut RunStats) -> Result<BTreeMap<String, String>> {
        let selector = SpeedSelector::from_config(&self.config.speed_test);
        let pool = self.blocking(move |store| selector.candidates(store)).await?;
        let links: Vec<String> = pool.values().flatten().cloned().collect();
        if links.is_empty() {
            warn!("no latency-passed candidates to speed test");
            return Ok(BTreeMap::new());
        }
        stats.increment("speed_candidates", links.len() as u64);

        let Some(records) = self.measure(&links, MeasureMode::Speed, stats).await? else {
            return Ok(BTreeMap::new());
        };
        let results = measure::parse_speed_records(&records);
        cancel::check(&self.cancel)?;

        let selection = self
            .blocking(move |store| selector.reduce(store, &pool, &results, Utc::now()))
            .await?;
        stats.increment("speed_recorded", selection.recorded as u64);
        stats.increment("below_threshold", selection.below_threshold as u64);
        Ok(selection.best)
    }

    async fn publish_stage(&self, best: &BTreeMap<String, String>, stats: &mut RunStats) -> Result<()> {
        if best.is_empty() || self.publishers.is_empty() {
            info!(locations = best.len(), publishers = self.publishers.len(), "nothing to publish");
            return Ok(());
        }

        let body = publish::render_subscription(best, self.config.publish.base64);
        let mut failures = Vec::new();
        for publisher in &self.publishers {
            cancel::check(&self.cancel)?;
            match publisher.publish(&body).await {
                Ok(()) => stats.increment("published", 1),
                Err(e) => {
                    warn!(publisher = publisher.name(), error = %e, "publish failed");
                    failures.push(format!("{}: {e:#}", publisher.name()));
                }
            }
        }
        if !failures.is_empty() {
            anyhow::bail!("publishing failed: {}", failures.join("; "));
        }
        Ok(())
    }

    /// Run one measurement. `None` means it failed for a reason other than
    /// cancellation; the stage then proceeds with an empty batch.
    async fn measure(
        &self,
        links: &[String],
        mode: MeasureMode,
        stats: &mut RunStats,
    ) -> Result<Option<Vec<Record>>> {
        let timer = Instant::now();
        let outcome = self.measurer.run(links, mode, &self.cancel).await;
        stats.record_timing(measure_timing_key(mode), timer.elapsed());

        match outcome {
            Ok(records) => Ok(Some(records)),
            Err(MeasureError::Cancelled) => Err(MeasureError::Cancelled.into()),
            Err(e) => {
                warn!(%mode, error = %e, "measurement failed, continuing with an empty batch");
                stats.increment("measurement_failures", 1);
                Ok(None)
            }
        }
    }

    fn checkpoint(&self, stage: Stage) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled { stage })
        } else {
            Ok(())
        }
    }

    /// Run store work on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&CandidateStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .context("store task panicked")?
    }

    fn remove_state_dir(&self) {
        let Some(dir) = &self.config.measurement.state_dir else {
            return;
        };
        match std::fs::remove_dir_all(dir) {
            Ok(()) => info!(path = %dir.display(), "removed measurement state directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %dir.display(), error = %e, "could not remove measurement state directory"),
        }
    }
}

fn measure_timing_key(mode: MeasureMode) -> &'static str {
    match mode {
        MeasureMode::Latency => "latency_measurement",
        MeasureMode::Speed => "speed_measurement",
    }
}

/// Turn any cancellation inside a stage into a [`PipelineError::Cancelled`]
/// naming that stage.
fn stage_error(stage: Stage, err: anyhow::Error) -> anyhow::Error {
    if cancel::is_cancelled(&err) {
        PipelineError::Cancelled { stage }.into()
    } else {
        err.context(format!("{stage} stage failed"))
    }
}
