use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::{messages_after, LinkSource, Message};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A remote plain-text feed with the same line semantics as [`super::FileSource`].
#[derive(Debug, Clone)]
pub struct HttpSource {
    id: String,
    url: String,
}

impl HttpSource {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }

    fn client(proxy: Option<&str>) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("proxysift/", env!("CARGO_PKG_VERSION")));
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).context("invalid proxy endpoint")?);
        }
        builder.build().context("failed to build HTTP client")
    }
}

#[async_trait]
impl LinkSource for HttpSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, after: Option<i64>, limit: usize, proxy: Option<&str>) -> Result<Vec<Message>> {
        debug!(source = %self.id, url = %self.url, via_proxy = proxy.is_some(), "fetching feed");
        let text = Self::client(proxy)?
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.url))?
            .error_for_status()
            .with_context(|| format!("feed {} returned an error status", self.url))?
            .text()
            .await
            .context("failed to read feed body")?;
        Ok(messages_after(&text, after, limit))
    }
}
