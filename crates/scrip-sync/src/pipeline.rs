use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use scrip_adapters::{
    cookie_header_from_json, ExtractorChain, HttpPageRetriever, HttpRetrieverConfig, Retriever,
};
use scrip_core::{RunCounters, CANONICAL_DATE_FORMAT};
use scrip_storage::{
    column_letter_to_index, read_table, CheckpointStore, ColumnRef, DeadLetterStore, FetcherConfig,
    HttpFetcher, RequestPacer, RetryPolicy,
};
use serde::Serialize;
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{JobConfig, MySqlCredentials, RunConfig, SinkConfig};
use crate::coordinator::{run_workers, RunContext, RunSettings};
use crate::partition::{partition, Plan, PrimaryLayout, ShardSpec};
use crate::progress::{CheckpointProgress, ProgressTracker, RunTally};
use crate::reference::ReferenceMap;
use crate::sink::{probe_with_retries, BatchWriter, CsvGridSink, MemorySink, MySqlSink, Sink};

/// Plan plus the inputs it was derived from.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub checkpoint: i64,
    pub primary_rows: usize,
    pub reference_size: usize,
    pub plan: Plan,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub shard: ShardSpec,
    pub sink: String,
    pub retriever: String,
    pub planned: usize,
    pub malformed: usize,
    pub counters: RunCounters,
    pub checkpoint_before: i64,
    pub checkpoint_after: i64,
    pub batches_written: usize,
    pub batches_dead_lettered: usize,
    pub sessions_opened: u32,
    pub panicked_workers: usize,
    pub cancelled: bool,
    pub report_path: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ProbePolicy {
    pub attempts: usize,
    pub pause: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            pause: Duration::from_secs(6),
        }
    }
}

pub struct Pipeline {
    run: RunConfig,
    job: JobConfig,
    probe: ProbePolicy,
}

impl Pipeline {
    pub fn new(run: RunConfig, job: JobConfig) -> Self {
        Self {
            run,
            job,
            probe: ProbePolicy::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let run = RunConfig::from_env().context("invalid run configuration")?;
        let job = JobConfig::load(&run.job_file)?;
        Ok(Self::new(run, job))
    }

    pub fn with_probe_policy(mut self, probe: ProbePolicy) -> Self {
        self.probe = probe;
        self
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run
    }

    pub fn job(&self) -> &JobConfig {
        &self.job
    }

    pub async fn open_checkpoint(&self) -> CheckpointStore {
        CheckpointStore::open(&self.run.checkpoint_file).await
    }

    fn table_fetcher(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(60),
            user_agent: Some(self.run.user_agent.clone()),
            ..Default::default()
        })
    }

    /// Read both tables, build the reference map and the shard's plan.
    /// Any failure here is fatal: no worker has started yet.
    pub async fn prepare(&self, checkpoint: i64) -> Result<Prepared> {
        let fetcher = self.table_fetcher()?;

        let references = match &self.job.reference {
            Some(source) => {
                let table = read_table(&source.location, source.has_header, Some(&fetcher))
                    .await
                    .context("reading reference table")?;
                let subject = table.resolve_column(&source.subject_column)?;
                let date = table.resolve_column(&source.date_column)?;
                ReferenceMap::from_rows(&table.rows, subject, date)
            }
            None => {
                if self.job.require_reference {
                    warn!("require_reference is set but no reference source is configured; ignoring it");
                }
                ReferenceMap::empty()
            }
        };

        let primary = &self.job.primary;
        let table = read_table(&primary.location, primary.has_header, Some(&fetcher))
            .await
            .context("reading primary table")?;
        let layout = PrimaryLayout {
            subject: table.resolve_column(&primary.subject_column)?,
            target: table.resolve_column(&primary.target_column)?,
            target_host: primary.target_host.clone(),
        };

        let plan = partition(
            &table.rows,
            &layout,
            self.run.shard,
            checkpoint,
            self.run.max_index,
            &references,
        );
        info!(
            rows = table.rows.len(),
            shard_index = self.run.shard.index,
            shard_step = self.run.shard.step,
            checkpoint,
            planned = plan.len(),
            malformed = plan.malformed_count(),
            "work planned"
        );
        Ok(Prepared {
            checkpoint,
            primary_rows: table.rows.len(),
            reference_size: references.len(),
            plan,
        })
    }

    pub fn build_retriever(&self) -> Result<Arc<dyn Retriever>> {
        let retrieval = &self.job.retrieval;
        let chain = ExtractorChain::from_specs(&retrieval.extractors, self.job.min_values)
            .context("building extraction chain")?;
        let cookie_header = match &self.run.cookies_json {
            Some(json) => cookie_header_from_json(json).context("parsing SCRIP_COOKIES")?,
            None => None,
        };
        let pacer = retrieval
            .rate_limit
            .map(|limit| Arc::new(RequestPacer::new(limit.burst, Duration::from_millis(limit.period_ms))));
        let config = HttpRetrieverConfig {
            user_agent: Some(self.run.user_agent.clone()),
            cookie_header,
            settle_delay: Duration::from_millis(retrieval.settle_delay_ms),
            pacer,
        };
        Ok(Arc::new(HttpPageRetriever::new(config, chain)))
    }

    /// The configured sink, or an in-memory one for dry runs.
    pub fn build_sink(&self, dry_run: bool) -> Result<Arc<dyn Sink>> {
        if dry_run {
            return Ok(Arc::new(MemorySink::new()));
        }
        match &self.job.sink {
            SinkConfig::Mysql { table, max_connections } => {
                let credentials = MySqlCredentials::from_env().context("mysql sink needs credentials")?;
                let sink = MySqlSink::connect(&credentials, table, max_connections.unwrap_or(2))?;
                Ok(Arc::new(sink))
            }
            SinkConfig::CsvGrid {
                path,
                header_rows,
                start_column,
            } => {
                let start = match start_column {
                    None => 0,
                    Some(ColumnRef::Index(i)) => *i,
                    Some(ColumnRef::Letter(letter)) => column_letter_to_index(letter)?,
                    Some(ColumnRef::Header(name)) => {
                        anyhow::bail!("grid start_column must be a letter or index, got header `{name}`")
                    }
                };
                Ok(Arc::new(CsvGridSink::new(path.clone(), *header_rows, start)))
            }
        }
    }

    /// Create the MySQL table if it does not exist.
    pub async fn migrate(&self) -> Result<String> {
        let SinkConfig::Mysql { table, .. } = &self.job.sink else {
            anyhow::bail!("migrate only applies to the mysql sink ({} configured)", self.job.sink.describe());
        };
        let credentials = MySqlCredentials::from_env().context("mysql sink needs credentials")?;
        let sink = MySqlSink::connect(&credentials, table, 1)?;
        sink.ensure_table().await.context("creating sink table")?;
        sink.close().await;
        Ok(table.clone())
    }

    /// One full pass over this shard's pending work.
    pub async fn run_once(
        &self,
        sink: Arc<dyn Sink>,
        retriever: Arc<dyn Retriever>,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        probe_with_retries(sink.as_ref(), self.probe.attempts, self.probe.pause)
            .await
            .with_context(|| format!("sink {} is unreachable", sink.describe()))?;

        let store = Arc::new(self.open_checkpoint().await);
        let checkpoint_before = store.current().await;
        let prepared = self.prepare(checkpoint_before).await?;
        let planned = prepared.plan.len();
        let malformed = prepared.plan.malformed_count();

        let tally = Arc::new(RunTally::default());
        let progress = Arc::new(CheckpointProgress::new(
            ProgressTracker::new(prepared.plan.indices(), checkpoint_before),
            store.clone(),
        ));
        let settings = RunSettings {
            category: self.job.category.clone(),
            value_count: self.job.value_count,
            timeout: self.run.timeout,
            pace: self.run.pace,
            require_reference: self.job.requires_reference(),
            run_date: started_at.format(CANONICAL_DATE_FORMAT).to_string(),
        };
        let ctx = Arc::new(RunContext::new(
            prepared.plan,
            settings,
            tally.clone(),
            progress.clone(),
            cancel.clone(),
        ));

        info!(%run_id, sink = %sink.describe(), retriever = retriever.name(), workers = self.run.workers, planned, "run starting");

        let (tx, rx) = mpsc::channel(self.run.batch_size.saturating_mul(2).max(1));
        let writer = BatchWriter::new(
            sink.clone(),
            RetryPolicy {
                max_retries: self.run.sink_retries,
                ..RetryPolicy::default()
            },
            self.run.batch_size,
            self.run.flush_interval,
            DeadLetterStore::new(&self.run.dead_letter_dir),
            format!("shard-{}", self.run.shard.index),
        );
        let writer = tokio::spawn(writer.run(rx, tally.clone(), progress.clone()));

        let workers = run_workers(ctx, retriever.clone(), self.run.workers, tx).await;
        let written = writer.await.context("batch writer task failed")?;

        let checkpoint_after = store.current().await;
        let finished_at = Utc::now();
        let report_dir = self.run.reports_dir.join(run_id.to_string());
        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            shard: self.run.shard,
            sink: sink.describe(),
            retriever: retriever.name().to_string(),
            planned,
            malformed,
            counters: tally.snapshot(),
            checkpoint_before,
            checkpoint_after,
            batches_written: written.batches_written,
            batches_dead_lettered: written.batches_dead_lettered,
            sessions_opened: workers.sessions_opened,
            panicked_workers: workers.panicked_workers,
            cancelled: cancel.is_cancelled(),
            report_path: report_dir.join("summary.json").display().to_string(),
        };

        if let Err(err) = write_report(&report_dir, &summary).await {
            warn!(error = %format!("{err:#}"), "run report could not be written");
            summary.report_path.clear();
        }
        info!(%run_id, counters = %summary.counters, checkpoint = checkpoint_after, cancelled = summary.cancelled, "run finished");
        Ok(summary)
    }
}

async fn write_report(dir: &Path, summary: &RunSummary) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;
    Ok(())
}

/// Environment-driven entry point used by `scrip run`.
pub async fn run_from_env(dry_run: bool, cancel: CancellationToken) -> Result<RunSummary> {
    let pipeline = Pipeline::from_env()?;
    let sink = pipeline.build_sink(dry_run)?;
    let retriever = pipeline.build_retriever()?;
    pipeline.run_once(sink, retriever, cancel).await
}
