//! Run orchestration: configuration, reference resolution, partitioning, the
//! worker pool, batched sink writes and checkpoint advancement.

pub mod config;
pub mod coordinator;
pub mod partition;
pub mod pipeline;
pub mod progress;
pub mod reference;
pub mod sink;

pub use config::{ConfigError, JobConfig, MySqlCredentials, PaceRange, RunConfig, SinkConfig};
pub use coordinator::{run_workers, CoordinatorReport, RunContext, RunSettings};
pub use partition::{partition, validate_target, Plan, Planned, PrimaryLayout, ShardSpec};
pub use pipeline::{run_from_env, Pipeline, Prepared, ProbePolicy, RunSummary};
pub use progress::{CheckpointProgress, ProgressTracker, RunTally};
pub use reference::{normalize_subject, ReferenceMap};
pub use sink::{
    probe_with_retries, BatchWriter, CsvGridSink, MemorySink, MySqlSink, Sink, SinkError, WriteReceipt,
    WriterStats,
};

pub const CRATE_NAME: &str = "scrip-sync";
