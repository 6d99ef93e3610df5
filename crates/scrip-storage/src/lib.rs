//! Durable local state (checkpoints, dead-letter files), table readers and
//! HTTP fetch utilities for scrip.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod checkpoint;
mod http;
mod table;

pub use checkpoint::{CheckpointStore, NO_CHECKPOINT};
pub use http::{FetchError, Fetched, FetcherConfig, HttpFetcher, RequestPacer};
pub use table::{column_letter_to_index, parse_csv_table, read_table, ColumnRef, Table, TableError, TableLocation};

pub const CRATE_NAME: &str = "scrip-storage";

/// Where a dead-lettered payload ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterFile {
    pub path: PathBuf,
    pub digest: String,
    /// An identical payload was already on disk; nothing was written.
    pub reused: bool,
}

/// Files kept for manual replay when a sink gives up on a batch.
///
/// Layout: `<root>/<scope>/<YYYY-MM-DD>/<HHMMSS>-<digest16>.<ext>`.
#[derive(Debug, Clone)]
pub struct DeadLetterStore {
    root: PathBuf,
}

impl DeadLetterStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn path_for(&self, written_at: DateTime<Utc>, scope: &str, digest: &str, extension: &str) -> PathBuf {
        let extension = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        let short = &digest[..digest.len().min(16)];
        self.root
            .join(scope)
            .join(written_at.format("%Y-%m-%d").to_string())
            .join(format!("{}-{short}.{extension}", written_at.format("%H%M%S")))
    }

    pub async fn persist(
        &self,
        written_at: DateTime<Utc>,
        scope: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<DeadLetterFile> {
        let digest = Self::digest(bytes);
        let path = self.path_for(written_at, scope, &digest, extension);
        let reused = fs::try_exists(&path)
            .await
            .with_context(|| format!("checking dead-letter path {}", path.display()))?;
        if !reused {
            write_atomically(&path, bytes).await?;
        }
        Ok(DeadLetterFile { path, digest, reused })
    }
}

/// Replace `path` with `bytes` via a sibling temp file and rename, so readers
/// never observe a torn write.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("renaming {} over {}", temp_path.display(), path.display()));
    }
    Ok(())
}

/// Exponential retry schedule: `initial_delay * 2^retry`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay(&self, retry: usize) -> Duration {
        let exponent = u32::try_from(retry).unwrap_or(u32::MAX);
        let factor = 2u32.saturating_pow(exponent);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}
