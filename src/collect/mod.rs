//! Link collection from line-oriented feeds.
//!
//! Each source is read past its stored cursor. Links found in the new
//! messages are returned together with the cursor advances; the caller
//! commits those only after the links have been measured and ingested.

pub mod file;
pub mod http;

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use file::FileSource;
pub use http::HttpSource;

use crate::cancel;
use crate::config::{CollectorConfig, SourceConfig};

static LINK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\b(?:vless|vmess|ss|ssr|trojan)://[^\s<>"'`]+"#)
        .expect("link regex should compile")
});

/// One feed entry. `offset` increases monotonically within a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub offset: i64,
    pub text: String,
}

/// A feed of messages that may contain proxy links.
#[async_trait]
pub trait LinkSource: Send + Sync {
    /// Stable identifier; keys the stored cursor.
    fn id(&self) -> &str;

    /// Up to `limit` messages with an offset greater than `after`, oldest
    /// first. `proxy` is a SOCKS endpoint network sources should go through.
    async fn fetch(&self, after: Option<i64>, limit: usize, proxy: Option<&str>) -> Result<Vec<Message>>;
}

/// Links found in one collection pass plus the cursors to commit afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collection {
    pub links: BTreeSet<String>,
    pub cursors: Vec<(String, i64)>,
}

pub struct Collector {
    sources: Vec<Box<dyn LinkSource>>,
    max_messages: usize,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.sources.iter().map(|s| s.id()).collect();
        f.debug_struct("Collector")
            .field("sources", &ids)
            .field("max_messages", &self.max_messages)
            .finish()
    }
}

impl Collector {
    pub fn new(sources: Vec<Box<dyn LinkSource>>, max_messages: usize) -> Self {
        Self {
            sources,
            max_messages,
        }
    }

    pub fn from_config(config: &CollectorConfig) -> Self {
        let sources = config.sources.iter().filter_map(source_from_config).collect();
        Self::new(sources, config.max_messages_per_source)
    }

    /// Identifiers of every configured source, in reading order.
    pub fn source_ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.id().to_string()).collect()
    }

    /// Read every source past its entry in `cursors`. A source that fails is
    /// logged and skipped; its cursor stays where it was.
    pub async fn collect(
        &self,
        cursors: &BTreeMap<String, i64>,
        proxy: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Collection> {
        let mut collection = Collection::default();

        for source in &self.sources {
            cancel::check(cancel)?;
            let id = source.id();
            let after = cursors.get(id).copied();

            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Err(cancel::Cancelled.into()),
                fetched = source.fetch(after, self.max_messages, proxy) => fetched,
            };
            let messages = match fetched {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(source = id, error = %e, "source fetch failed, skipping");
                    continue;
                }
            };

            let Some(last) = messages.iter().map(|m| m.offset).max() else {
                debug!(source = id, ?after, "no new messages");
                continue;
            };

            let before = collection.links.len();
            for message in &messages {
                collection.links.extend(extract_links(&message.text));
            }
            info!(
                source = id,
                messages = messages.len(),
                new_links = collection.links.len() - before,
                cursor = last,
                "source collected"
            );
            collection.cursors.push((id.to_string(), last));
        }

        Ok(collection)
    }
}

fn source_from_config(config: &SourceConfig) -> Option<Box<dyn LinkSource>> {
    match (&config.path, &config.url) {
        (Some(path), _) => Some(Box::new(FileSource::new(&config.id, path))),
        (None, Some(url)) => Some(Box::new(HttpSource::new(&config.id, url))),
        (None, None) => {
            warn!(source = %config.id, "source has neither path nor url, ignoring");
            None
        }
    }
}

/// Proxy links in `text`, with trailing `.` and `,` trimmed.
pub fn extract_links(text: &str) -> Vec<String> {
    LINK_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',']))
        .filter(|link| !link.ends_with("://"))
        .map(str::to_string)
        .collect()
}

/// Split a line-oriented feed into messages with 1-based line offsets,
/// keeping non-blank lines after `after`, at most `limit` of them.
pub fn messages_after(text: &str, after: Option<i64>, limit: usize) -> Vec<Message> {
    let after = after.unwrap_or(0);
    text.lines()
        .enumerate()
        .map(|(index, line)| (index as i64 + 1, line))
        .filter(|(offset, line)| *offset > after && !line.trim().is_empty())
        .take(limit)
        .map(|(offset, line)| Message {
            offset,
            text: line.to_string(),
        })
        .collect()
}
