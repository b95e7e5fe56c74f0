//! Create-or-update a file through the GitHub contents API.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::Publisher;
use crate::config::GithubConfig;

const TOKEN_ENV: &str = "GITHUB_TOKEN";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct GithubPublisher {
    client: reqwest::Client,
    config: GithubConfig,
    token: String,
}

impl std::fmt::Debug for GithubPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubPublisher")
            .field("owner", &self.config.owner)
            .field("repo", &self.config.repo)
            .field("path", &self.config.path)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ExistingFile {
    sha: String,
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    message: &'a str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<&'a str>,
}

impl GithubPublisher {
    /// Token comes from the config, else `GITHUB_TOKEN`.
    pub fn from_config(config: &GithubConfig) -> Result<Self> {
        let token = match &config.token {
            Some(token) if !token.is_empty() => token.clone(),
            _ => std::env::var(TOKEN_ENV)
                .with_context(|| format!("no GitHub token configured and {TOKEN_ENV} is not set"))?,
        };
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("proxysift/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            config: config.clone(),
            token,
        })
    }

    fn contents_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            self.config.path.trim_start_matches('/'),
        )
    }

    async fn existing_sha(&self, url: &str) -> Result<Option<String>> {
        let mut request = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json");
        if let Some(branch) = &self.config.branch {
            request = request.query(&[("ref", branch)]);
        }
        let response = request.send().await.context("GitHub contents lookup failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .context("GitHub contents lookup returned an error status")?;
        let existing: ExistingFile = response.json().await.context("unexpected GitHub contents response")?;
        Ok(Some(existing.sha))
    }
}

#[async_trait]
impl Publisher for GithubPublisher {
    fn name(&self) -> &str {
        "github"
    }

    async fn publish(&self, body: &str) -> Result<()> {
        let url = self.contents_url();
        let sha = self.existing_sha(&url).await?;
        debug!(%url, update = sha.is_some(), "publishing to GitHub");

        let request = UpdateRequest {
            message: &self.config.commit_message,
            content: base64::engine::general_purpose::STANDARD.encode(body),
            sha,
            branch: self.config.branch.as_deref(),
        };
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&request)
            .send()
            .await
            .context("GitHub contents update failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("GitHub contents update returned {status}: {detail}");
        }
        info!(
            owner = %self.config.owner,
            repo = %self.config.repo,
            path = %self.config.path,
            "subscription published to GitHub"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GithubConfig {
        GithubConfig {
            owner: "someone".into(),
            repo: "subs".into(),
            path: "/out/sub.txt".into(),
            branch: Some("main".into()),
            token: Some("t0ken".into()),
            commit_message: "Update subscription".into(),
            api_base: "https://api.github.com/".into(),
        }
    }

    #[test]
    fn test_contents_url() {
        let publisher = GithubPublisher::from_config(&config()).unwrap();
        assert_eq!(
            publisher.contents_url(),
            "https://api.github.com/repos/someone/subs/contents/out/sub.txt"
        );
        assert!(!format!("{publisher:?}").contains("t0ken"));
    }

    #[test]
    fn test_update_request_omits_missing_fields() {
        let request = UpdateRequest {
            message: "m",
            content: "Ym9keQ==".into(),
            sha: None,
            branch: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json, serde_json::json!({ "message": "m", "content": "Ym9keQ==" }));
    }
}
