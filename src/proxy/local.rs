//! A local SOCKS proxy served by the measurement binary.
//!
//! Used to reach link feeds that are only accessible through one of the
//! candidates already in the store.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tempfile::NamedTempFile;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::measure::process::{terminate_child, TERMINATE_GRACE};

/// A running proxy child. Stop it with [`LocalProxy::stop`]; dropping it
/// kills the process without the SIGTERM grace period.
#[derive(Debug)]
pub struct LocalProxy {
    child: Child,
    endpoint: String,
    // Held so the links file outlives the child.
    _links_file: NamedTempFile,
}

impl LocalProxy {
    /// Spawn `<binary> <subcommand> -f <links> -I socks://host:port [extra]`
    /// and wait the startup grace period.
    pub async fn start(config: &ProxyConfig, binary: &Path, links: &[String]) -> Result<Self> {
        if links.is_empty() {
            bail!("no links to serve through the local proxy");
        }

        let mut links_file = tempfile::Builder::new()
            .prefix("proxysift-proxy-")
            .suffix(".txt")
            .tempfile()
            .context("failed to create proxy links file")?;
        for link in links {
            writeln!(links_file, "{link}")?;
        }
        links_file.flush()?;

        let listen = format!("socks://{}:{}", config.listen_host, config.listen_port);
        let mut child = Command::new(binary)
            .arg(&config.subcommand)
            .arg("-f")
            .arg(links_file.path())
            .arg("-I")
            .arg(&listen)
            .args(&config.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start local proxy: {}", binary.display()))?;

        tokio::time::sleep(Duration::from_millis(config.startup_grace_ms)).await;
        if let Some(status) = child.try_wait().context("failed to poll local proxy")? {
            bail!("local proxy exited during startup with code {:?}", status.code());
        }

        let endpoint = format!("socks5://{}:{}", config.listen_host, config.listen_port);
        info!(pid = child.id(), %endpoint, links = links.len(), "local proxy started");
        Ok(Self {
            child,
            endpoint,
            _links_file: links_file,
        })
    }

    /// Proxy URL for HTTP clients.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Terminate the proxy and wait for it to exit.
    pub async fn stop(mut self) {
        if let Ok(Some(status)) = self.child.try_wait() {
            warn!(exit_code = status.code(), "local proxy had already exited");
            return;
        }
        terminate_child(&mut self.child, TERMINATE_GRACE).await;
        info!(endpoint = %self.endpoint, "local proxy stopped");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn config(grace_ms: u64) -> ProxyConfig {
        ProxyConfig {
            enabled: true,
            startup_grace_ms: grace_ms,
            listen_port: 19050,
            ..ProxyConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        // Stays up regardless of the proxy arguments it is given.
        let dir = tempfile::TempDir::new().unwrap();
        let bin = dir.path().join("fake-proxy");
        std::fs::write(&bin, "#!/bin/sh\nexec sleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&bin).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&bin, perms).unwrap();

        let proxy = LocalProxy::start(&config(50), &bin, &["vless://a".to_string()])
            .await
            .unwrap();
        assert_eq!(proxy.endpoint(), "socks5://127.0.0.1:19050");
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_early_exit_is_an_error() {
        let err = LocalProxy::start(&config(200), Path::new("false"), &["vless://a".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited during startup"), "{err}");
    }

    #[tokio::test]
    async fn test_empty_links_rejected() {
        assert!(LocalProxy::start(&config(0), Path::new("true"), &[]).await.is_err());
    }
}
