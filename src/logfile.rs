//! Size-rotated log file for the tracing writer.
//!
//! Once the active file would grow past `max_bytes`, it is renamed to
//! `<path>.1`, older backups shift up by one and anything beyond
//! `backup_count` is deleted. A zero limit or zero backups means plain append.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backup_count: u32,
    file: File,
    written: u64,
}

impl RotatingFile {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(path: &Path, max_bytes: u64, backup_count: u32) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory: {}", dir.display()))?;
        }
        let file = open_append(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            max_bytes,
            backup_count,
            file,
            written,
        })
    }

    fn rotates(&self) -> bool {
        self.max_bytes > 0 && self.backup_count > 0
    }

    fn backup(&self, n: u32) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn roll_over(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let oldest = self.backup(self.backup_count);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        for n in (1..self.backup_count).rev() {
            let from = self.backup(n);
            if from.exists() {
                std::fs::rename(&from, self.backup(n + 1))?;
            }
        }
        std::fs::rename(&self.path, self.backup(1))?;
        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.rotates() && self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.roll_over()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn test_rolls_over_and_keeps_backup_count() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs/proxysift.log");
        let mut log = RotatingFile::open(&path, 10, 2).unwrap();

        for line in ["first-1\n", "second\n", "third-3\n", "fourth\n"] {
            log.write_all(line.as_bytes()).unwrap();
        }
        log.flush().unwrap();

        assert_eq!(read(&path), "fourth\n");
        assert_eq!(read(&dir.path().join("logs/proxysift.log.1")), "third-3\n");
        assert_eq!(read(&dir.path().join("logs/proxysift.log.2")), "second\n");
        assert!(!dir.path().join("logs/proxysift.log.3").exists());
    }

    #[test]
    fn test_zero_limit_appends_forever() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("plain.log");
        std::fs::write(&path, "earlier\n").unwrap();

        let mut log = RotatingFile::open(&path, 0, 3).unwrap();
        log.write_all(b"later line that is long\n").unwrap();
        log.flush().unwrap();

        assert_eq!(read(&path), "earlier\nlater line that is long\n");
        assert!(!dir.path().join("plain.log.1").exists());
    }

    #[test]
    fn test_existing_size_counts_toward_limit() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.log");
        std::fs::write(&path, "12345678\n").unwrap();

        let mut log = RotatingFile::open(&path, 12, 1).unwrap();
        log.write_all(b"next\n").unwrap();
        log.flush().unwrap();

        assert_eq!(read(&path), "next\n");
        assert_eq!(read(&dir.path().join("run.log.1")), "12345678\n");
    }
}
