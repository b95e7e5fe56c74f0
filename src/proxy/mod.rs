//! Proxy candidate selection and the local SOCKS proxy bootstrap.

pub mod local;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use local::LocalProxy;

use crate::config::ProxyConfig;
use crate::storage::CandidateStore;

/// Which status class feeds the proxy bootstrap.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum SelectorMode {
    /// Highest download first; falls back to latency ranking when empty.
    #[default]
    SpeedPassed,
    /// Lowest delay first.
    LatencyPassed,
}

impl std::fmt::Display for SelectorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectorMode::SpeedPassed => write!(f, "speed_passed"),
            SelectorMode::LatencyPassed => write!(f, "latency_passed"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyCandidateSelector {
    mode: SelectorMode,
    max_links: u32,
}

impl ProxyCandidateSelector {
    pub fn new(mode: SelectorMode, max_links: u32) -> Self {
        Self { mode, max_links }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.selector, config.max_links)
    }

    /// At most `max_links` links, best first. May be empty.
    pub fn select(&self, store: &CandidateStore) -> Result<Vec<String>> {
        let links = store.proxy_candidates(self.mode, self.max_links)?;
        info!(mode = %self.mode, max_links = self.max_links, selected = links.len(), "proxy candidates selected");
        Ok(links)
    }
}
