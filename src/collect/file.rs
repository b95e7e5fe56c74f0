use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{messages_after, LinkSource, Message};

/// A local text file, one message per line.
#[derive(Debug, Clone)]
pub struct FileSource {
    id: String,
    path: PathBuf,
}

impl FileSource {
    pub fn new(id: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            id: id.into(),
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl LinkSource for FileSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, after: Option<i64>, limit: usize, _proxy: Option<&str>) -> Result<Vec<Message>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read feed file: {}", self.path.display()))?;
        Ok(messages_after(&text, after, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let source = FileSource::new("gone", "/nonexistent/feed.txt");
        tokio_test::assert_err!(source.fetch(None, 10, None).await);
    }
}
