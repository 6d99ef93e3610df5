//! Bounded worker pool over the immutable plan.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scrip_adapters::{Retriever, SessionSlot};
use scrip_core::ExtractionRecord;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::PaceRange;
use crate::partition::{Plan, Planned};
use crate::progress::{CheckpointProgress, RunTally};

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub category: String,
    pub value_count: usize,
    pub timeout: Duration,
    pub pace: PaceRange,
    pub require_reference: bool,
    /// Fallback as-of date for subjects without a reference date.
    pub run_date: String,
}

/// Everything a worker needs, passed explicitly instead of through globals.
pub struct RunContext {
    plan: Arc<[Planned]>,
    cursor: AtomicUsize,
    settings: RunSettings,
    tally: Arc<RunTally>,
    progress: Arc<CheckpointProgress>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(
        plan: Plan,
        settings: RunSettings,
        tally: Arc<RunTally>,
        progress: Arc<CheckpointProgress>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            plan: plan.entries.into(),
            cursor: AtomicUsize::new(0),
            settings,
            tally,
            progress,
            cancel,
        }
    }

    fn next_entry(&self) -> Option<&Planned> {
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.plan.get(slot)
    }

    pub fn tally(&self) -> &Arc<RunTally> {
        &self.tally
    }

    pub fn progress(&self) -> &Arc<CheckpointProgress> {
        &self.progress
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorReport {
    pub sessions_opened: u32,
    pub panicked_workers: usize,
}

#[derive(Debug, Default)]
struct WorkerReport {
    items: usize,
    sessions_opened: u32,
}

/// Run `workers` tasks until the plan is drained or the run is cancelled.
/// Returns once every worker has exited; `records` is dropped by then.
pub async fn run_workers(
    ctx: Arc<RunContext>,
    retriever: Arc<dyn Retriever>,
    workers: usize,
    records: mpsc::Sender<ExtractionRecord>,
) -> CoordinatorReport {
    let mut set = JoinSet::new();
    for worker_id in 0..workers.max(1) {
        let ctx = ctx.clone();
        let retriever = retriever.clone();
        let records = records.clone();
        set.spawn(worker_loop(worker_id, ctx, retriever, records));
    }
    drop(records);

    let mut report = CoordinatorReport::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(worker) => {
                report.sessions_opened += worker.sessions_opened;
                debug!(items = worker.items, sessions = worker.sessions_opened, "worker finished");
            }
            Err(err) if err.is_panic() => {
                report.panicked_workers += 1;
                error!(error = %err, "worker panicked; its in-flight item stays incomplete");
            }
            Err(err) => warn!(error = %err, "worker task ended abnormally"),
        }
    }
    report
}

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<RunContext>,
    retriever: Arc<dyn Retriever>,
    records: mpsc::Sender<ExtractionRecord>,
) -> WorkerReport {
    let settings = &ctx.settings;
    let mut slot = SessionSlot::new(retriever, worker_id);
    let mut report = WorkerReport::default();

    while !ctx.cancel.is_cancelled() {
        let Some(entry) = ctx.next_entry() else { break };
        report.items += 1;

        let item = match entry {
            Planned::Malformed { index, subject, reason } => {
                warn!(worker = worker_id, index, subject = %subject, reason = %reason, "skipping malformed row");
                ctx.tally.update(|c| c.skipped_malformed += 1);
                ctx.progress.mark_complete(&[*index]).await;
                continue;
            }
            Planned::Ready(item) => item,
        };

        if settings.require_reference && item.aux_date.is_none() {
            info!(worker = worker_id, index = item.index, subject = %item.subject_key, "no reference date; skipping");
            ctx.tally.update(|c| c.skipped_no_reference += 1);
            ctx.progress.mark_complete(&[item.index]).await;
            continue;
        }

        let as_of = item.aux_date.as_deref().unwrap_or(&settings.run_date);
        ctx.tally.update(|c| c.processed += 1);

        let span = info_span!("retrieve", worker = worker_id, index = item.index, subject = %item.subject_key);
        let record = match slot.retrieve(&item.target, settings.timeout).instrument(span).await {
            Ok(payload) => {
                debug!(index = item.index, kind = payload.kind(), "retrieved");
                ExtractionRecord::from_payload(item, &settings.category, as_of, payload, settings.value_count)
            }
            Err(err) => {
                warn!(worker = worker_id, index = item.index, subject = %item.subject_key, kind = ?err.kind(), error = %err, "retrieval failed");
                ctx.tally.update(|c| c.failed_retrieval += 1);
                ExtractionRecord::degraded(item, &settings.category, as_of, settings.value_count)
            }
        };

        if records.send(record).await.is_err() {
            error!(worker = worker_id, index = item.index, "batch writer is gone; stopping worker");
            break;
        }

        let pause = settings.pace.sample();
        if !pause.is_zero() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    slot.shutdown().await;
    report.sessions_opened = slot.sessions_opened();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressTracker;
    use async_trait::async_trait;
    use scrip_adapters::{RetrievalError, RetrievalSession};
    use scrip_core::{RawPayload, RecordStatus, WorkItem};
    use scrip_storage::CheckpointStore;
    use tempfile::tempdir;

    struct Echo;

    struct EchoSession;

    #[async_trait]
    impl Retriever for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn open_session(&self, _worker_id: usize) -> Result<Box<dyn RetrievalSession>, RetrievalError> {
            Ok(Box::new(EchoSession))
        }
    }

    #[async_trait]
    impl RetrievalSession for EchoSession {
        async fn retrieve(&mut self, target: &str, _timeout: Duration) -> Result<RawPayload, RetrievalError> {
            match target {
                t if t.ends_with("/fail") => Err(RetrievalError::Navigation("refused".into())),
                t if t.ends_with("/panic") => panic!("retriever bug"),
                t => Ok(RawPayload::Values(vec![t.to_string()])),
            }
        }
    }

    fn ready(index: usize, suffix: &str, date: Option<&str>) -> Planned {
        Planned::Ready(WorkItem {
            index,
            subject_key: format!("S{index}"),
            target: format!("https://example.com/{suffix}"),
            aux_date: date.map(ToString::to_string),
        })
    }

    fn settings(require_reference: bool) -> RunSettings {
        RunSettings {
            category: "day".into(),
            value_count: 2,
            timeout: Duration::from_secs(1),
            pace: PaceRange::none(),
            require_reference,
            run_date: "2024-01-01".into(),
        }
    }

    async fn context(dir: &std::path::Path, entries: Vec<Planned>, require_reference: bool) -> Arc<RunContext> {
        let plan = Plan { entries };
        let store = Arc::new(CheckpointStore::open(dir.join("checkpoint.txt")).await);
        let progress = Arc::new(CheckpointProgress::new(ProgressTracker::new(plan.indices(), -1), store));
        Arc::new(RunContext::new(
            plan,
            settings(require_reference),
            Arc::new(RunTally::default()),
            progress,
            CancellationToken::new(),
        ))
    }

    async fn drain(mut rx: mpsc::Receiver<ExtractionRecord>) -> Vec<ExtractionRecord> {
        let mut out = Vec::new();
        while let Some(record) = rx.recv().await {
            out.push(record);
        }
        out.sort_by_key(|r| r.index);
        out
    }

    #[tokio::test]
    async fn failures_degrade_and_skips_complete_immediately() {
        let dir = tempdir().expect("tempdir");
        let ctx = context(
            dir.path(),
            vec![
                ready(0, "ok", Some("2024-03-05")),
                Planned::Malformed {
                    index: 1,
                    subject: String::new(),
                    reason: "missing subject key".into(),
                },
                ready(2, "fail", None),
                ready(3, "ok", None),
            ],
            false,
        )
        .await;
        let (tx, rx) = mpsc::channel(16);
        let collector = tokio::spawn(drain(rx));
        let report = run_workers(ctx.clone(), Arc::new(Echo), 2, tx).await;
        let records = collector.await.expect("collector");

        assert_eq!(report.panicked_workers, 0);
        assert_eq!(records.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 2, 3]);
        assert_eq!(records[0].as_of_date, "2024-03-05");
        assert_eq!(records[1].status, RecordStatus::Degraded);
        assert_eq!(records[2].as_of_date, "2024-01-01");

        let counters = ctx.tally().snapshot();
        assert_eq!(counters.processed, 3);
        assert_eq!(counters.failed_retrieval, 1);
        assert_eq!(counters.skipped_malformed, 1);
    }

    #[tokio::test]
    async fn missing_reference_is_skipped_when_required() {
        let dir = tempdir().expect("tempdir");
        let ctx = context(dir.path(), vec![ready(0, "ok", None), ready(1, "ok", Some("2024-03-05"))], true).await;
        let (tx, rx) = mpsc::channel(16);
        let collector = tokio::spawn(drain(rx));
        run_workers(ctx.clone(), Arc::new(Echo), 1, tx).await;
        let records = collector.await.expect("collector");

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].index, 1);
        assert_eq!(ctx.tally().snapshot().skipped_no_reference, 1);
        // Only the skip has been checkpointed; record 1 waits for its flush.
        assert_eq!(ctx.progress().store().current().await, 0);
    }

    #[tokio::test]
    async fn panicking_worker_blocks_checkpoint_at_its_item() {
        let dir = tempdir().expect("tempdir");
        let ctx = context(
            dir.path(),
            vec![
                Planned::Malformed { index: 0, subject: String::new(), reason: "x".into() },
                ready(1, "panic", None),
                Planned::Malformed { index: 2, subject: String::new(), reason: "x".into() },
            ],
            false,
        )
        .await;
        let (tx, rx) = mpsc::channel(16);
        let collector = tokio::spawn(drain(rx));
        let report = run_workers(ctx.clone(), Arc::new(Echo), 2, tx).await;
        collector.await.expect("collector");

        assert_eq!(report.panicked_workers, 1);
        assert_eq!(ctx.progress().store().current().await, 0);
    }

    #[tokio::test]
    async fn cancelled_run_dispatches_nothing() {
        let dir = tempdir().expect("tempdir");
        let ctx = context(dir.path(), vec![ready(0, "ok", None)], false).await;
        ctx.cancel.cancel();
        let (tx, rx) = mpsc::channel(16);
        let collector = tokio::spawn(drain(rx));
        run_workers(ctx.clone(), Arc::new(Echo), 2, tx).await;
        assert!(collector.await.expect("collector").is_empty());
        assert_eq!(ctx.tally().snapshot().processed, 0);
    }
}
