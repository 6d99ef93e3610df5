use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::write_atomically;

/// Checkpoint value meaning "nothing done yet".
pub const NO_CHECKPOINT: i64 = -1;

/// Single-integer cursor persisted as text. Writes are atomic and never move
/// the stored value backwards; only [`CheckpointStore::reset`] rolls it back.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    persisted: Mutex<i64>,
}

impl CheckpointStore {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let value = Self::read_value(&path).await;
        debug!(path = %path.display(), value, "checkpoint loaded");
        Self {
            path,
            persisted: Mutex::new(value),
        }
    }

    /// Absent, unreadable or garbage files all read as [`NO_CHECKPOINT`].
    pub async fn read_value(path: &Path) -> i64 {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return NO_CHECKPOINT,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "checkpoint unreadable; starting from scratch");
                return NO_CHECKPOINT;
            }
        };
        match text.trim().parse::<i64>() {
            Ok(v) => v.max(NO_CHECKPOINT),
            Err(_) => {
                warn!(path = %path.display(), content = %text.trim(), "checkpoint is not an integer; ignoring it");
                NO_CHECKPOINT
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn current(&self) -> i64 {
        *self.persisted.lock().await
    }

    /// Persist `value` if it is ahead of what is stored. Returns whether a write happened.
    pub async fn advance(&self, value: i64) -> anyhow::Result<bool> {
        let mut persisted = self.persisted.lock().await;
        if value <= *persisted {
            return Ok(false);
        }
        write_atomically(&self.path, value.to_string().as_bytes())
            .await
            .with_context(|| format!("writing checkpoint {}", self.path.display()))?;
        *persisted = value;
        Ok(true)
    }

    /// Operator action: forget all progress for this shard.
    pub async fn reset(&self) -> anyhow::Result<()> {
        let mut persisted = self.persisted.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("removing checkpoint {}", self.path.display()))
            }
        }
        *persisted = NO_CHECKPOINT;
        Ok(())
    }
}
