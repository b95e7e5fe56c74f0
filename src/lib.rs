//! proxysift -- a durable pool of proxy candidates.
//!
//! Links are collected from feeds, latency tested on a retest schedule,
//! capped per location by evicting the slowest members, speed tested, and
//! the fastest link per location is published as a subscription.

pub mod cancel;
pub mod collect;
pub mod config;
pub mod ingest;
pub mod logfile;
pub mod measure;
pub mod pipeline;
pub mod proxy;
pub mod publish;
pub mod scheduler;
pub mod speed;
pub mod stats;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

pub use pipeline::{Pipeline, PipelineError, RunFailure, RunReport, Stage};
pub use storage::CandidateStore;

/// Run one full pass with the collaborators described by `config`.
pub async fn run(config: config::Config, cancel: CancellationToken) -> Result<RunReport, RunFailure> {
    let (store, knife, collector, publishers) = assemble(&config).map_err(RunFailure::before_start)?;
    let proxy_binary = knife.path().to_path_buf();

    Pipeline::new(config, store, collector, Arc::new(knife), publishers, cancel)
        .with_proxy_binary(proxy_binary)
        .run()
        .await
}

fn assemble(
    config: &config::Config,
) -> Result<(CandidateStore, measure::XrayKnife, collect::Collector, Vec<Box<dyn publish::Publisher>>)> {
    tracing::info!(db = %config.database.path.display(), "opening candidate store");
    let store = CandidateStore::open(&config.database.path)?;
    let knife = measure::XrayKnife::new(&config.measurement)
        .context("measurement binary is required for a run")?;
    let collector = collect::Collector::from_config(&config.collector);
    let publishers = publish::from_config(&config.publish)?;
    Ok((store, knife, collector, publishers))
}
