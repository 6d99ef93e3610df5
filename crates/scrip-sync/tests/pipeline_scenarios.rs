use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scrip_adapters::{RetrievalError, RetrievalSession, Retriever};
use scrip_core::{RawPayload, RecordStatus, SENTINEL};
use scrip_sync::{JobConfig, MemorySink, PaceRange, Pipeline, RunConfig, ShardSpec};
use tempfile::tempdir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Answers every target with two values, except targets listed as timing out.
struct FakeRetriever {
    timeouts: BTreeSet<String>,
    visited: Arc<Mutex<Vec<String>>>,
}

struct FakeSession {
    timeouts: BTreeSet<String>,
    visited: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Retriever for FakeRetriever {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn open_session(&self, _worker_id: usize) -> Result<Box<dyn RetrievalSession>, RetrievalError> {
        Ok(Box::new(FakeSession {
            timeouts: self.timeouts.clone(),
            visited: self.visited.clone(),
        }))
    }
}

#[async_trait]
impl RetrievalSession for FakeSession {
    async fn retrieve(&mut self, target: &str, timeout: Duration) -> Result<RawPayload, RetrievalError> {
        self.visited.lock().expect("visited").push(target.to_string());
        if self.timeouts.contains(target) {
            return Err(RetrievalError::Timeout(timeout));
        }
        Ok(RawPayload::Values(vec!["1.5B".into(), "\u{2212}2%".into()]))
    }
}

fn fake(timeouts: &[String]) -> (Arc<FakeRetriever>, Arc<Mutex<Vec<String>>>) {
    let visited = Arc::new(Mutex::new(Vec::new()));
    let retriever = Arc::new(FakeRetriever {
        timeouts: timeouts.iter().cloned().collect(),
        visited: visited.clone(),
    });
    (retriever, visited)
}

fn target(i: usize) -> String {
    format!("https://www.example.com/symbols/S{i}/")
}

fn write_primary(dir: &Path, subjects: &[String]) -> PathBuf {
    let path = dir.join("primary.csv");
    let mut text = String::from("symbol,day\n");
    for (i, subject) in subjects.iter().enumerate() {
        text.push_str(&format!("{subject},{}\n", target(i)));
    }
    std::fs::write(&path, text).expect("primary");
    path
}

fn subjects(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("S{i}")).collect()
}

fn job(primary: &Path, reference: Option<&Path>) -> JobConfig {
    let mut yaml = format!(
        r#"
category: day
value_count: 3
primary:
  location: {{ kind: csv_file, path: "{}" }}
  subject_column: {{ header: symbol }}
  target_column: {{ header: day }}
  target_host: example.com
retrieval:
  extractors:
    - {{ kind: text, selector: "div.valueValue" }}
sink:
  kind: csv_grid
  path: unused.csv
"#,
        primary.display()
    );
    if let Some(reference) = reference {
        yaml.push_str(&format!(
            r#"reference:
  location: {{ kind: csv_file, path: "{}" }}
  subject_column: {{ letter: A }}
  date_column: {{ letter: B }}
"#,
            reference.display()
        ));
    }
    JobConfig::from_yaml(&yaml).expect("job")
}

fn run_config(dir: &Path, shard: ShardSpec) -> RunConfig {
    RunConfig {
        shard,
        workers: 2,
        timeout: Duration::from_secs(1),
        checkpoint_file: dir.join(format!("checkpoint_{}.txt", shard.index)),
        pace: PaceRange::none(),
        reports_dir: dir.join("reports"),
        dead_letter_dir: dir.join("dead-letter"),
        ..RunConfig::default()
    }
}

#[tokio::test]
async fn scenario_a_shard_zero_of_two_takes_even_rows() {
    let dir = tempdir().expect("tempdir");
    let primary = write_primary(dir.path(), &subjects(5));
    let pipeline = Pipeline::new(run_config(dir.path(), ShardSpec { index: 0, step: 2 }), job(&primary, None));
    let sink = Arc::new(MemorySink::new());
    let (retriever, _) = fake(&[]);

    let summary = pipeline
        .run_once(sink.clone(), retriever, CancellationToken::new())
        .await
        .expect("run");

    let indices = sink.rows().await.iter().map(|r| r.index).collect::<Vec<_>>();
    assert_eq!(indices, vec![0, 2, 4]);
    assert_eq!(summary.counters.processed, 3);
    assert_eq!(summary.counters.succeeded, 3);
    assert_eq!(summary.checkpoint_before, -1);
    assert_eq!(summary.checkpoint_after, 4);
    assert!(Path::new(&summary.report_path).exists());
}

#[tokio::test]
async fn scenario_b_reference_dates_match_case_insensitively() {
    let dir = tempdir().expect("tempdir");
    let primary = write_primary(dir.path(), &["aaa".to_string()]);
    let reference = dir.path().join("reference.csv");
    std::fs::write(&reference, "AAA,2024/03/05\n").expect("reference");
    let pipeline = Pipeline::new(run_config(dir.path(), ShardSpec::single()), job(&primary, Some(&reference)));
    let sink = Arc::new(MemorySink::new());
    let (retriever, _) = fake(&[]);

    pipeline
        .run_once(sink.clone(), retriever, CancellationToken::new())
        .await
        .expect("run");

    let rows = sink.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].subject_key, "AAA");
    assert_eq!(rows[0].as_of_date, "2024-03-05");
    assert_eq!(rows[0].values, vec!["1.5B", "-2%", SENTINEL]);
}

#[tokio::test]
async fn scenario_c_timeout_degrades_one_item_and_checkpoint_still_completes() {
    let dir = tempdir().expect("tempdir");
    let primary = write_primary(dir.path(), &subjects(10));
    let pipeline = Pipeline::new(run_config(dir.path(), ShardSpec::single()), job(&primary, None));
    let sink = Arc::new(MemorySink::new());
    let (retriever, _) = fake(&[target(3)]);

    let summary = pipeline
        .run_once(sink.clone(), retriever, CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.counters.failed_retrieval, 1);
    assert_eq!(summary.counters.succeeded, 9);
    assert_eq!(summary.checkpoint_after, 9);
    let rows = sink.rows().await;
    assert_eq!(rows.len(), 10);
    assert_eq!(rows[3].status, RecordStatus::Degraded);
    assert_eq!(rows[3].values, vec![SENTINEL; 3]);
}

#[tokio::test]
async fn scenario_d_transient_sink_failures_converge_to_one_row_per_key() {
    let dir = tempdir().expect("tempdir");
    let primary = write_primary(dir.path(), &subjects(3));
    let pipeline = Pipeline::new(run_config(dir.path(), ShardSpec::single()), job(&primary, None));
    let sink = Arc::new(MemorySink::failing_first(2));
    let (retriever, _) = fake(&[]);

    let summary = pipeline
        .run_once(sink.clone(), retriever, CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.counters.failed_sink, 0);
    assert_eq!(summary.batches_written, 1);
    assert_eq!(sink.successful_writes().await, 1);
    let first = sink.rows().await;
    assert_eq!(first.len(), 3);

    // Replaying the same keys changes nothing but freshness.
    pipeline.open_checkpoint().await.reset().await.expect("reset");
    let (retriever, _) = fake(&[]);
    pipeline
        .run_once(sink.clone(), retriever, CancellationToken::new())
        .await
        .expect("rerun");
    assert_eq!(sink.rows().await, first);
}

#[tokio::test]
async fn restart_processes_only_rows_after_checkpoint() {
    let dir = tempdir().expect("tempdir");
    let primary = write_primary(dir.path(), &subjects(10));
    let config = run_config(dir.path(), ShardSpec::single());
    std::fs::write(&config.checkpoint_file, "5").expect("seed checkpoint");
    let pipeline = Pipeline::new(config, job(&primary, None));
    let sink = Arc::new(MemorySink::new());
    let (retriever, visited) = fake(&[]);

    let summary = pipeline
        .run_once(sink.clone(), retriever, CancellationToken::new())
        .await
        .expect("run");

    let mut seen = visited.lock().expect("visited").clone();
    seen.sort();
    assert_eq!(seen, (6..10).map(target).collect::<Vec<_>>());
    assert_eq!(summary.checkpoint_before, 5);
    assert_eq!(summary.checkpoint_after, 9);
}

#[tokio::test]
async fn shards_cover_the_table_exactly_once() {
    let dir = tempdir().expect("tempdir");
    let primary = write_primary(dir.path(), &subjects(11));
    let step = 3;
    let mut seen = Vec::new();
    for index in 0..step {
        let pipeline = Pipeline::new(run_config(dir.path(), ShardSpec { index, step }), job(&primary, None));
        let sink = Arc::new(MemorySink::new());
        let (retriever, _) = fake(&[]);
        pipeline
            .run_once(sink.clone(), retriever, CancellationToken::new())
            .await
            .expect("run");
        seen.extend(sink.rows().await.iter().map(|r| r.index));
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..11).collect::<Vec<_>>());
}

#[tokio::test]
async fn malformed_rows_are_counted_and_checkpointed() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("primary.csv");
    std::fs::write(
        &path,
        "symbol,day\nS0,https://www.example.com/a\n,https://www.example.com/b\nS2,not a url\nS3,https://www.example.com/d\n",
    )
    .expect("primary");
    let pipeline = Pipeline::new(run_config(dir.path(), ShardSpec::single()), job(&path, None));
    let sink = Arc::new(MemorySink::new());
    let (retriever, _) = fake(&[]);

    let summary = pipeline
        .run_once(sink.clone(), retriever, CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.counters.skipped_malformed, 2);
    assert_eq!(summary.counters.processed, 2);
    assert_eq!(summary.checkpoint_after, 3);
}

#[tokio::test]
async fn cancelled_run_keeps_checkpoint_and_reports() {
    let dir = tempdir().expect("tempdir");
    let primary = write_primary(dir.path(), &subjects(4));
    let pipeline = Pipeline::new(run_config(dir.path(), ShardSpec::single()), job(&primary, None));
    let sink = Arc::new(MemorySink::new());
    let (retriever, _) = fake(&[]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = pipeline.run_once(sink.clone(), retriever, cancel).await.expect("run");

    assert!(summary.cancelled);
    assert_eq!(summary.counters.processed, 0);
    assert_eq!(summary.checkpoint_after, -1);
    assert!(sink.rows().await.is_empty());
}

/// Holds one target until released, announcing when it is reached.
struct GatedRetriever {
    gate: String,
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

struct GatedSession {
    gate: String,
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl Retriever for GatedRetriever {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn open_session(&self, _worker_id: usize) -> Result<Box<dyn RetrievalSession>, RetrievalError> {
        Ok(Box::new(GatedSession {
            gate: self.gate.clone(),
            reached: self.reached.clone(),
            release: self.release.clone(),
        }))
    }
}

#[async_trait]
impl RetrievalSession for GatedSession {
    async fn retrieve(&mut self, target: &str, _timeout: Duration) -> Result<RawPayload, RetrievalError> {
        if target == self.gate {
            self.reached.notify_one();
            self.release.notified().await;
        }
        Ok(RawPayload::Values(vec![target.to_string()]))
    }
}

#[tokio::test]
async fn interrupt_mid_run_flushes_in_flight_item_and_stops() {
    let dir = tempdir().expect("tempdir");
    let primary = write_primary(dir.path(), &subjects(6));
    let config = RunConfig {
        workers: 1,
        timeout: Duration::from_secs(30),
        ..run_config(dir.path(), ShardSpec::single())
    };
    let pipeline = Pipeline::new(config, job(&primary, None));
    let sink = Arc::new(MemorySink::new());
    let reached = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let retriever = Arc::new(GatedRetriever {
        gate: target(2),
        reached: reached.clone(),
        release: release.clone(),
    });
    let cancel = CancellationToken::new();

    let interrupt = async {
        reached.notified().await;
        cancel.cancel();
        release.notify_one();
    };
    let (summary, ()) = tokio::join!(pipeline.run_once(sink.clone(), retriever, cancel.clone()), interrupt);
    let summary = summary.expect("run");

    assert!(summary.cancelled);
    assert_eq!(summary.counters.processed, 3);
    assert_eq!(summary.checkpoint_after, 2);
    let indices = sink.rows().await.iter().map(|r| r.index).collect::<Vec<_>>();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(pipeline.open_checkpoint().await.current().await, 2);
}

#[tokio::test]
async fn unreadable_primary_fails_before_any_work() {
    let dir = tempdir().expect("tempdir");
    let pipeline = Pipeline::new(
        run_config(dir.path(), ShardSpec::single()),
        job(&dir.path().join("missing.csv"), None),
    );
    let sink = Arc::new(MemorySink::new());
    let (retriever, visited) = fake(&[]);

    let err = pipeline
        .run_once(sink, retriever, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("reading primary table"));
    assert!(visited.lock().expect("visited").is_empty());
}
