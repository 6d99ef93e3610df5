//! Job file (YAML) plus environment-driven run settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use scrip_adapters::ExtractorSpec;
use scrip_storage::{ColumnRef, TableLocation};
use serde::Deserialize;
use thiserror::Error;

use crate::partition::ShardSpec;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got `{value}`")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("shard index {index} is out of range for shard step {step}")]
    ShardOutOfRange { index: usize, step: usize },
    #[error("missing required settings: {}", .0.join(", "))]
    MissingCredentials(Vec<&'static str>),
    #[error("sink table name `{0}` may only contain letters, digits and underscores")]
    BadTableName(String),
}

fn default_true() -> bool {
    true
}

fn default_min_values() -> usize {
    1
}

fn default_category() -> String {
    "day".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrimarySourceConfig {
    pub location: TableLocation,
    #[serde(default = "default_true")]
    pub has_header: bool,
    pub subject_column: ColumnRef,
    pub target_column: ColumnRef,
    /// Host fragment every target must contain, e.g. `tradingview.com`.
    #[serde(default)]
    pub target_host: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceSourceConfig {
    pub location: TableLocation,
    #[serde(default)]
    pub has_header: bool,
    pub subject_column: ColumnRef,
    pub date_column: ColumnRef,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed back to back before spacing kicks in.
    pub burst: u32,
    /// Window the burst is measured over.
    pub period_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub settle_delay_ms: u64,
    pub extractors: Vec<ExtractorSpec>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    Mysql {
        table: String,
        #[serde(default)]
        max_connections: Option<u32>,
    },
    CsvGrid {
        path: PathBuf,
        #[serde(default)]
        header_rows: usize,
        #[serde(default)]
        start_column: Option<ColumnRef>,
    },
}

impl SinkConfig {
    pub fn describe(&self) -> String {
        match self {
            SinkConfig::Mysql { table, .. } => format!("mysql table `{table}`"),
            SinkConfig::CsvGrid { path, .. } => format!("csv grid {}", path.display()),
        }
    }
}

/// The job file: what to scrape, how to read it, where to put it.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    #[serde(default = "default_category")]
    pub category: String,
    /// Declared width N of every extraction record.
    pub value_count: usize,
    #[serde(default = "default_min_values")]
    pub min_values: usize,
    pub primary: PrimarySourceConfig,
    #[serde(default)]
    pub reference: Option<ReferenceSourceConfig>,
    /// Skip (and checkpoint) subjects that have no reference date.
    #[serde(default)]
    pub require_reference: bool,
    pub retrieval: RetrievalConfig,
    pub sink: SinkConfig,
}

impl JobConfig {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let job: JobConfig = serde_yaml::from_str(text).context("parsing job file")?;
        job.validate()?;
        Ok(job)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading job file {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.category.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: "category",
                expected: "non-empty",
                value: self.category.clone(),
            });
        }
        if self.min_values > self.value_count.max(1) {
            return Err(ConfigError::Invalid {
                name: "min_values",
                expected: "at most value_count",
                value: self.min_values.to_string(),
            });
        }
        if let SinkConfig::Mysql { table, .. } = &self.sink {
            validate_table_name(table)?;
        }
        Ok(())
    }

    /// Whether missing reference dates skip the item. Without a reference
    /// source there is nothing to require.
    pub fn requires_reference(&self) -> bool {
        self.require_reference && self.reference.is_some()
    }
}

pub fn validate_table_name(table: &str) -> Result<(), ConfigError> {
    if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConfigError::BadTableName(table.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaceRange {
    pub min: Duration,
    pub max: Duration,
}

impl PaceRange {
    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let spread = (self.max - self.min).as_millis() as u64;
        self.min + Duration::from_millis(fastrand::u64(0..=spread))
    }
}

/// Per-execution knobs, read from the environment.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub job_file: PathBuf,
    pub shard: ShardSpec,
    pub workers: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub timeout: Duration,
    pub checkpoint_file: PathBuf,
    pub max_index: Option<usize>,
    pub pace: PaceRange,
    pub sink_retries: usize,
    pub user_agent: String,
    pub cookies_json: Option<String>,
    pub reports_dir: PathBuf,
    pub dead_letter_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            job_file: PathBuf::from("scrip.yaml"),
            shard: ShardSpec::single(),
            workers: 2,
            batch_size: 50,
            flush_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(75),
            checkpoint_file: PathBuf::from("checkpoint_0.txt"),
            max_index: None,
            pace: PaceRange {
                min: Duration::from_millis(1500),
                max: Duration::from_millis(3000),
            },
            sink_retries: 3,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36".to_string(),
            cookies_json: None,
            reports_dir: PathBuf::from("./reports"),
            dead_letter_dir: PathBuf::from("./dead-letter"),
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| ConfigError::Invalid {
            name,
            expected,
            value: raw,
        }),
    }
}

impl RunConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let shard = ShardSpec {
            index: parse_var(&lookup, "SHARD_INDEX", "a non-negative integer")?.unwrap_or(0),
            step: parse_var(&lookup, "SHARD_STEP", "a positive integer")?.unwrap_or(1),
        };
        let pace_min: Option<u64> = parse_var(&lookup, "SCRIP_PACE_MIN_MS", "milliseconds")?;
        let pace_max: Option<u64> = parse_var(&lookup, "SCRIP_PACE_MAX_MS", "milliseconds")?;
        let pace = PaceRange {
            min: pace_min.map(Duration::from_millis).unwrap_or(defaults.pace.min),
            max: pace_max.map(Duration::from_millis).unwrap_or(defaults.pace.max),
        };

        let config = Self {
            job_file: lookup("SCRIP_JOB_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.job_file),
            shard,
            workers: parse_var(&lookup, "SCRIP_WORKERS", "a positive integer")?
                .unwrap_or(defaults.workers),
            batch_size: parse_var(&lookup, "SCRIP_BATCH_SIZE", "a positive integer")?
                .unwrap_or(defaults.batch_size),
            flush_interval: parse_var(&lookup, "SCRIP_FLUSH_SECS", "seconds")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.flush_interval),
            timeout: parse_var(&lookup, "SCRIP_TIMEOUT_SECS", "seconds")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            checkpoint_file: lookup("CHECKPOINT_FILE")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(format!("checkpoint_{}.txt", shard.index))),
            max_index: parse_var(&lookup, "SCRIP_MAX_INDEX", "a non-negative integer")?,
            pace,
            sink_retries: parse_var(&lookup, "SCRIP_SINK_RETRIES", "a non-negative integer")?
                .unwrap_or(defaults.sink_retries),
            user_agent: lookup("SCRIP_USER_AGENT").unwrap_or(defaults.user_agent),
            cookies_json: lookup("SCRIP_COOKIES").filter(|v| !v.trim().is_empty()),
            reports_dir: lookup("SCRIP_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            dead_letter_dir: lookup("SCRIP_DEAD_LETTER_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.dead_letter_dir),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shard.validate()?;
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                name: "SCRIP_WORKERS",
                expected: "at least 1",
                value: "0".into(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "SCRIP_BATCH_SIZE",
                expected: "at least 1",
                value: "0".into(),
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "SCRIP_TIMEOUT_SECS",
                expected: "at least 1",
                value: "0".into(),
            });
        }
        if self.pace.max < self.pace.min {
            return Err(ConfigError::Invalid {
                name: "SCRIP_PACE_MAX_MS",
                expected: "at least SCRIP_PACE_MIN_MS",
                value: self.pace.max.as_millis().to_string(),
            });
        }
        Ok(())
    }
}

/// Connection settings for the MySQL sink.
#[derive(Clone)]
pub enum MySqlCredentials {
    Url(String),
    Parts {
        host: String,
        port: u16,
        user: String,
        password: String,
        database: String,
    },
}

impl std::fmt::Debug for MySqlCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MySqlCredentials::Url(_) => f.write_str("MySqlCredentials::Url(<redacted>)"),
            MySqlCredentials::Parts { host, port, user, database, .. } => f
                .debug_struct("MySqlCredentials::Parts")
                .field("host", host)
                .field("port", port)
                .field("user", user)
                .field("database", database)
                .finish_non_exhaustive(),
        }
    }
}

impl MySqlCredentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `DATABASE_URL` wins; otherwise every `DB_*` part is required.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            return Ok(MySqlCredentials::Url(url));
        }
        let required = ["DB_HOST", "DB_USER", "DB_PASSWORD", "DB_NAME"];
        let missing = required
            .iter()
            .copied()
            .filter(|k| lookup(k).map_or(true, |v| v.trim().is_empty()))
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(ConfigError::MissingCredentials(missing));
        }
        let get = |k: &str| lookup(k).unwrap_or_default();
        Ok(MySqlCredentials::Parts {
            host: get("DB_HOST"),
            port: parse_var(&lookup, "DB_PORT", "a port number")?.unwrap_or(3306),
            user: get("DB_USER"),
            password: get("DB_PASSWORD"),
            database: get("DB_NAME"),
        })
    }
}
