use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const TABLE_SCHEMA_ENV: &str = "TABLE_SCHEMA";
pub const TABLE_NAME_ENV: &str = "TABLE_NAME";
pub const LOG_FILE_ENV: &str = "LOG_FILE";
pub const FLUSH_MS_ENV: &str = "FLUSH_MS";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    #[serde(default)]
    pub database_url: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Attempts per batch including the first; connection failures only.
    #[serde(default = "default_write_retry_max_attempts")]
    pub write_retry_max_attempts: u32,
    #[serde(default = "default_write_retry_base_delay_ms")]
    pub write_retry_base_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default)]
    pub log_file: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Start following at the current end of the file (DEFAULT: true)
    /// - true: only lines written after startup are ingested
    /// - false: the whole file is read; the high-water mark drops what is already stored
    #[serde(default = "default_start_at_end")]
    pub start_at_end: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BatchConfig {
    /// Flush window in milliseconds. Required.
    #[serde(default)]
    pub flush_ms: Option<u64>,
    /// Lets the first flush check after startup fire regardless of elapsed time (DEFAULT: false).
    /// Whichever record arrives first is written right away, even if that is long after startup;
    /// the regular window applies from then on.
    #[serde(default)]
    pub flush_on_first_tick: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Consecutive unparseable lines tolerated before the agent gives up. 0 = first one is fatal.
    #[serde(default = "default_max_consecutive_parse_failures")]
    pub max_consecutive_parse_failures: u32,
    #[serde(default = "default_advance_mark_after_write")]
    pub advance_mark_after_write: bool,
    #[serde(default)]
    pub drain_on_shutdown: bool,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen_addr")]
    pub listen_addr: String,
}

const DEFAULT_MAX_CONNECTIONS: u32 = 2;
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_WRITE_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_WRITE_RETRY_BASE_DELAY_MS: u64 = 500;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_QUEUE_CAPACITY: usize = 10;
const DEFAULT_START_AT_END: bool = true;
const DEFAULT_MAX_CONSECUTIVE_PARSE_FAILURES: u32 = 100;
const DEFAULT_ADVANCE_MARK_AFTER_WRITE: bool = true;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
const DEFAULT_METRICS_ENABLED: bool = true;
const DEFAULT_METRICS_LISTEN_ADDR: &str = "0.0.0.0:9090";

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_acquire_timeout_ms() -> u64 {
    DEFAULT_ACQUIRE_TIMEOUT_MS
}

fn default_write_retry_max_attempts() -> u32 {
    DEFAULT_WRITE_RETRY_MAX_ATTEMPTS
}

fn default_write_retry_base_delay_ms() -> u64 {
    DEFAULT_WRITE_RETRY_BASE_DELAY_MS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_start_at_end() -> bool {
    DEFAULT_START_AT_END
}

fn default_max_consecutive_parse_failures() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_PARSE_FAILURES
}

fn default_advance_mark_after_write() -> bool {
    DEFAULT_ADVANCE_MARK_AFTER_WRITE
}

fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

fn default_metrics_enabled() -> bool {
    DEFAULT_METRICS_ENABLED
}

fn default_metrics_listen_addr() -> String {
    DEFAULT_METRICS_LISTEN_ADDR.to_string()
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            schema: String::new(),
            table: String::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            write_retry_max_attempts: DEFAULT_WRITE_RETRY_MAX_ATTEMPTS,
            write_retry_base_delay_ms: DEFAULT_WRITE_RETRY_BASE_DELAY_MS,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            log_file: String::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            start_at_end: DEFAULT_START_AT_END,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_consecutive_parse_failures: DEFAULT_MAX_CONSECUTIVE_PARSE_FAILURES,
            advance_mark_after_write: DEFAULT_ADVANCE_MARK_AFTER_WRITE,
            drain_on_shutdown: false,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: DEFAULT_METRICS_ENABLED,
            listen_addr: default_metrics_listen_addr(),
        }
    }
}

/// Loads a `.env` file from the working directory or one of its parents into the process
/// environment. Variables that are already set keep their value.
///
/// Returns the file that was read, or `None` when there is no `.env` file.
pub fn load_dotenv() -> Result<Option<PathBuf>> {
    match dotenvy::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(err) if err.not_found() => Ok(None),
        Err(err) => Err(err).context("failed to load .env file"),
    }
}

impl Config {
    /// Loads `path` when it exists, otherwise builds the configuration from the environment.
    ///
    /// Environment variables override file values in both cases.
    pub fn load_or_env(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Self::from_env()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config = Self::parse(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies the deployment variables (`DATABASE_URL`, `TABLE_SCHEMA`, `TABLE_NAME`,
    /// `LOG_FILE`, `FLUSH_MS`) looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = non_empty(DATABASE_URL_ENV) {
            self.sink.database_url = value;
        }
        if let Some(value) = non_empty(TABLE_SCHEMA_ENV) {
            self.sink.schema = value;
        }
        if let Some(value) = non_empty(TABLE_NAME_ENV) {
            self.sink.table = value;
        }
        if let Some(value) = non_empty(LOG_FILE_ENV) {
            self.source.log_file = value;
        }
        if let Some(value) = non_empty(FLUSH_MS_ENV) {
            let flush_ms = value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{FLUSH_MS_ENV} must be a whole number, got {value:?}"))?;
            self.batch.flush_ms = Some(flush_ms);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("sink.database_url", DATABASE_URL_ENV, &self.sink.database_url),
            ("sink.schema", TABLE_SCHEMA_ENV, &self.sink.schema),
            ("sink.table", TABLE_NAME_ENV, &self.sink.table),
            ("source.log_file", LOG_FILE_ENV, &self.source.log_file),
        ];
        for (key, env, value) in required {
            if value.trim().is_empty() {
                anyhow::bail!("{key} is required (set it in the config file or via {env})");
            }
        }
        if self.batch.flush_ms.is_none() {
            anyhow::bail!("batch.flush_ms is required (set it in the config file or via {FLUSH_MS_ENV})");
        }
        if self.source.queue_capacity == 0 {
            anyhow::bail!("source.queue_capacity must be greater than zero");
        }
        if self.metrics.enabled {
            self.metrics_addr()?;
        }
        Ok(())
    }

    pub fn log_file_path(&self) -> PathBuf {
        let expanded = shellexpand::tilde(&self.source.log_file);
        PathBuf::from(expanded.as_ref())
    }

    pub fn flush_window(&self) -> Duration {
        Duration::from_millis(self.batch.flush_ms.unwrap_or_default())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.source.poll_interval_ms)
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        self.metrics
            .listen_addr
            .parse()
            .with_context(|| format!("invalid metrics.listen_addr {:?}", self.metrics.listen_addr))
    }
}
