use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::Publisher;

/// Writes the subscription to a local file. The file is replaced atomically.
#[derive(Debug, Clone)]
pub struct FilePublisher {
    path: PathBuf,
}

impl FilePublisher {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Publisher for FilePublisher {
    fn name(&self) -> &str {
        "file"
    }

    async fn publish(&self, body: &str) -> Result<()> {
        let path = self.path.clone();
        let bytes = body.len();
        let body = body.to_string();
        tokio::task::spawn_blocking(move || write_atomic(&path, &body))
            .await
            .context("file publish task panicked")??;
        info!(path = %self.path.display(), bytes, "subscription written");
        Ok(())
    }
}

fn write_atomic(path: &Path, body: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory: {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    std::io::Write::write_all(&mut tmp, body.as_bytes())?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
