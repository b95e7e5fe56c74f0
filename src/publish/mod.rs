//! Publication of the best-per-location links as a subscription body.

pub mod file;
pub mod github;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;

pub use file::FilePublisher;
pub use github::GithubPublisher;

use crate::config::PublishConfig;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Short name for logs and run statistics.
    fn name(&self) -> &str;

    async fn publish(&self, body: &str) -> Result<()>;
}

/// Best links joined by newlines in location order, optionally base64-encoded.
pub fn render_subscription(best: &BTreeMap<String, String>, base64: bool) -> String {
    let plain = best.values().map(String::as_str).collect::<Vec<_>>().join("\n");
    if base64 {
        base64::engine::general_purpose::STANDARD.encode(plain)
    } else {
        plain
    }
}

/// Publishers enabled by `config`. Empty when publishing is off.
pub fn from_config(config: &PublishConfig) -> Result<Vec<Box<dyn Publisher>>> {
    let mut publishers: Vec<Box<dyn Publisher>> = Vec::new();
    if !config.enabled {
        return Ok(publishers);
    }
    if let Some(path) = &config.file_path {
        publishers.push(Box::new(FilePublisher::new(path)));
    }
    if let Some(github) = &config.github {
        publishers.push(Box::new(GithubPublisher::from_config(github)?));
    }
    Ok(publishers)
}
