//! Sink port, the batch writer that feeds it, and the bundled sinks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scrip_core::{ExtractionRecord, RecordStatus};
use scrip_storage::{DeadLetterStore, RetryPolicy};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::progress::{CheckpointProgress, RunTally};

mod grid;
mod mysql;

pub use grid::CsvGridSink;
pub use mysql::{create_table_sql, month_label, upsert_sql, MySqlSink};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("grid write failed: {0}")]
    Grid(String),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    pub rows_written: usize,
}

/// Durable upsert target keyed by `(subject, category)`. Implementations
/// report failure as a value; retries live in [`BatchWriter`].
#[async_trait]
pub trait Sink: Send + Sync {
    fn describe(&self) -> String;

    async fn probe(&self) -> Result<(), SinkError>;

    async fn upsert_batch(&self, records: &[ExtractionRecord]) -> Result<WriteReceipt, SinkError>;
}

/// Keeps rows in memory, one per natural key. Used by `run --dry-run` and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<Vec<ExtractionRecord>>,
    writes: Mutex<usize>,
    failures_left: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` batch writes fail with [`SinkError::Unavailable`].
    pub fn failing_first(n: usize) -> Self {
        Self {
            failures_left: Mutex::new(n),
            ..Self::default()
        }
    }

    pub async fn rows(&self) -> Vec<ExtractionRecord> {
        let mut rows = self.rows.lock().await.clone();
        rows.sort_by_key(|r| r.index);
        rows
    }

    pub async fn successful_writes(&self) -> usize {
        *self.writes.lock().await
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn probe(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn upsert_batch(&self, records: &[ExtractionRecord]) -> Result<WriteReceipt, SinkError> {
        {
            let mut failures_left = self.failures_left.lock().await;
            if *failures_left > 0 {
                *failures_left -= 1;
                return Err(SinkError::Unavailable("injected failure".into()));
            }
        }
        let mut rows = self.rows.lock().await;
        for record in records {
            match rows.iter_mut().find(|r| r.natural_key() == record.natural_key()) {
                Some(existing) => *existing = record.clone(),
                None => rows.push(record.clone()),
            }
        }
        *self.writes.lock().await += 1;
        Ok(WriteReceipt {
            rows_written: records.len(),
        })
    }
}

/// Probe the sink before any work starts.
pub async fn probe_with_retries(sink: &dyn Sink, attempts: usize, pause: Duration) -> Result<(), SinkError> {
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match sink.probe().await {
            Ok(()) => {
                info!(sink = %sink.describe(), attempt, "sink reachable");
                return Ok(());
            }
            Err(err) => {
                warn!(sink = %sink.describe(), attempt, attempts, error = %err, "sink probe failed");
                last = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| SinkError::Unavailable("probe never ran".into())))
}

#[derive(Debug, Serialize)]
struct DeadLetter<'a> {
    written_at: String,
    sink: String,
    error: String,
    first_index: usize,
    last_index: usize,
    records: &'a [ExtractionRecord],
    images: Vec<DeadLetterImage>,
}

#[derive(Debug, Serialize)]
struct DeadLetterImage {
    index: usize,
    path: String,
}

/// Batch totals reported back to the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub batches_written: usize,
    pub batches_dead_lettered: usize,
}

/// Single consumer of extraction records: buffers, flushes by size or
/// interval, retries with backoff and dead-letters what it cannot write.
pub struct BatchWriter {
    sink: Arc<dyn Sink>,
    retry: RetryPolicy,
    batch_size: usize,
    flush_interval: Duration,
    dead_letters: DeadLetterStore,
    scope: String,
}

impl BatchWriter {
    pub fn new(
        sink: Arc<dyn Sink>,
        retry: RetryPolicy,
        batch_size: usize,
        flush_interval: Duration,
        dead_letters: DeadLetterStore,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            retry,
            batch_size: batch_size.max(1),
            flush_interval,
            dead_letters,
            scope: scope.into(),
        }
    }

    /// Drain `rx` until every sender is gone, then flush the remainder.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<ExtractionRecord>,
        tally: Arc<RunTally>,
        progress: Arc<CheckpointProgress>,
    ) -> WriterStats {
        let mut stats = WriterStats::default();
        let mut batch: Vec<ExtractionRecord> = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch, &tally, &progress, &mut stats).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        debug!(records = batch.len(), "interval flush");
                        self.flush(&mut batch, &tally, &progress, &mut stats).await;
                    }
                }
            }
        }
        if !batch.is_empty() {
            self.flush(&mut batch, &tally, &progress, &mut stats).await;
        }
        stats
    }

    async fn flush(
        &self,
        batch: &mut Vec<ExtractionRecord>,
        tally: &RunTally,
        progress: &CheckpointProgress,
        stats: &mut WriterStats,
    ) {
        let records = std::mem::take(batch);
        match self.write_with_retries(&records).await {
            Ok(receipt) => {
                stats.batches_written += 1;
                let complete = records
                    .iter()
                    .filter(|r| r.status == RecordStatus::Complete)
                    .count() as u64;
                tally.update(|c| c.succeeded += complete);
                info!(sink = %self.sink.describe(), rows = receipt.rows_written, "batch written");
            }
            Err(err) => {
                stats.batches_dead_lettered += 1;
                tally.update(|c| c.failed_sink += records.len() as u64);
                self.dead_letter(&records, &err).await;
            }
        }
        let indices = records.iter().map(|r| r.index).collect::<Vec<_>>();
        progress.mark_complete(&indices).await;
    }

    async fn write_with_retries(&self, records: &[ExtractionRecord]) -> Result<WriteReceipt, SinkError> {
        let mut attempt = 0usize;
        loop {
            match self.sink.upsert_batch(records).await {
                Ok(receipt) => return Ok(receipt),
                Err(err) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "sink write failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn dead_letter(&self, records: &[ExtractionRecord], err: &SinkError) {
        let first_index = records.iter().map(|r| r.index).min().unwrap_or_default();
        let last_index = records.iter().map(|r| r.index).max().unwrap_or_default();
        let keys = records
            .iter()
            .map(|r| r.subject_key.as_str())
            .collect::<Vec<_>>()
            .join(",");
        error!(
            sink = %self.sink.describe(),
            first_index,
            last_index,
            keys = %keys,
            error = %err,
            "batch exhausted retries; dead-lettering"
        );

        let written_at = Utc::now();
        let mut images = Vec::new();
        for record in records {
            let Some(bytes) = &record.image else { continue };
            match self.dead_letters.persist(written_at, &self.scope, "png", bytes).await {
                Ok(stored) => images.push(DeadLetterImage {
                    index: record.index,
                    path: stored.path.display().to_string(),
                }),
                Err(e) => error!(index = record.index, error = %format!("{e:#}"), "dead-letter image write failed"),
            }
        }

        let letter = DeadLetter {
            written_at: written_at.to_rfc3339(),
            sink: self.sink.describe(),
            error: err.to_string(),
            first_index,
            last_index,
            records,
            images,
        };
        let stored = match serde_json::to_vec_pretty(&letter) {
            Ok(bytes) => self.dead_letters.persist(written_at, &self.scope, "json", &bytes).await,
            Err(e) => Err(e.into()),
        };
        match stored {
            Ok(stored) => warn!(path = %stored.path.display(), reused = stored.reused, "dead-letter batch saved"),
            Err(e) => error!(error = %format!("{e:#}"), "dead-letter batch could not be saved"),
        }
    }
}
