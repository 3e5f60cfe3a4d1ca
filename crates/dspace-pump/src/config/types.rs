//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Destination REST API.
    pub backend: BackendConfig,

    /// The three relational stores.
    pub databases: DatabasesConfig,

    /// Transport retry and circuit breaker settings.
    #[serde(default)]
    pub http: RetryPolicy,

    /// Relational retry and chunking settings.
    #[serde(default)]
    pub sql: SqlRetryPolicy,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Destination REST API configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the server API, e.g. `http://localhost:8080/server/api/`.
    pub endpoint: String,

    /// Administrator login (email).
    pub user: String,

    /// Administrator password.
    pub password: String,

    /// Log in before the first call (default: true).
    #[serde(default = "default_true")]
    pub authenticate: bool,
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("endpoint", &self.endpoint)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("authenticate", &self.authenticate)
            .finish()
    }
}

/// Connection settings for the legacy and destination databases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabasesConfig {
    /// Destination store, used for verification and corrective writes.
    pub dspace7: DatabaseConfig,

    /// Legacy primary store.
    pub dspace5: DatabaseConfig,

    /// Legacy auxiliary store (licenses, user metadata).
    pub utilities5: DatabaseConfig,
}

/// A single PostgreSQL connection.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode: disable, require or verify-full (default: disable).
    #[serde(default = "default_disable")]
    pub ssl_mode: String,

    /// Connect timeout in seconds (default: 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Server-side limit per statement in seconds, 0 disables it (default: 600).
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("statement_timeout_secs", &self.statement_timeout_secs)
            .finish()
    }
}

/// Retry, backoff and circuit breaker settings for the remote API.
///
/// Defaults: 3 attempts, 1s base delay growing by 1.5x per attempt,
/// 10s connect / 120s read timeouts, breaker opening after 5 consecutive
/// server errors and cooling down for 60s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first one.
    #[serde(default = "default_http_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt.
    #[serde(default = "default_http_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Multiplier applied to the delay for each further attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Consecutive server errors that open the breaker.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    /// How long the breaker stays open before allowing a trial call.
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_http_attempts(),
            base_delay_ms: default_http_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown(),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given zero-based failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt as i32);
        Duration::from_millis((self.base_delay_ms as f64 * factor) as u64)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Retry and chunking settings for relational reads and writes.
///
/// Defaults: 5 attempts with 500ms doubling backoff capped at 30s; tables
/// above 100k rows are read in 50k windows with 100ms between windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlRetryPolicy {
    #[serde(default = "default_sql_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_sql_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_sql_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Row count above which reads are windowed.
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: u64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Pause between windows.
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

impl Default for SqlRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_sql_attempts(),
            base_delay_ms: default_sql_base_delay_ms(),
            max_delay_ms: default_sql_max_delay_ms(),
            chunk_threshold: default_chunk_threshold(),
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

impl SqlRetryPolicy {
    /// Exponential delay after the given zero-based failed attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Directory holding one checkpoint file per stage.
    #[serde(default = "default_resume_dir")]
    pub resume_dir: String,

    /// Directory with `<table>.json` dumps of the legacy stores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_dir: Option<String>,

    /// Read legacy tables from `snapshot_dir` instead of the live stores.
    #[serde(default)]
    pub use_snapshots: bool,

    /// Worker pool size for bulk writes. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Flush the checkpoint after this many records within a sub-phase.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,

    /// Metadata fields tried in order for a version date.
    #[serde(default = "default_version_date_fields")]
    pub version_date_fields: Vec<String>,

    /// Legacy eperson ids that are never imported.
    #[serde(default)]
    pub ignored_epersons: Vec<i64>,

    /// Legacy metadata fields renamed on the way in.
    #[serde(default = "default_replaced_fields")]
    pub replaced_metadata_fields: BTreeMap<String, String>,

    /// Legacy metadata fields dropped on the way in.
    #[serde(default)]
    pub ignored_metadata_fields: Vec<String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            resume_dir: default_resume_dir(),
            snapshot_dir: None,
            use_snapshots: false,
            workers: None,
            checkpoint_every: default_checkpoint_every(),
            version_date_fields: default_version_date_fields(),
            ignored_epersons: Vec::new(),
            replaced_metadata_fields: default_replaced_fields(),
            ignored_metadata_fields: Vec::new(),
        }
    }
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // The API server, not the client, is the bottleneck: half the cores, 1-8.
        if self.workers.is_none() {
            self.workers = Some((resources.cpu_cores / 2).clamp(1, 8));
        }

        info!("Auto-tuned config: workers={}", self.get_workers());
        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_pg_port() -> u16 {
    5432
}

fn default_disable() -> String {
    "disable".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_statement_timeout() -> u64 {
    600
}

fn default_read_timeout() -> u64 {
    120
}

fn default_http_attempts() -> u32 {
    3
}

fn default_http_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown() -> u64 {
    60
}

fn default_sql_attempts() -> u32 {
    5
}

fn default_sql_base_delay_ms() -> u64 {
    500
}

fn default_sql_max_delay_ms() -> u64 {
    30_000
}

fn default_chunk_threshold() -> u64 {
    100_000
}

fn default_chunk_size() -> u64 {
    50_000
}

fn default_chunk_delay_ms() -> u64 {
    100
}

fn default_resume_dir() -> String {
    "__temp/resume".to_string()
}

fn default_checkpoint_every() -> usize {
    500
}

fn default_version_date_fields() -> Vec<String> {
    vec!["dc.date.issued".to_string(), "dc.date.accessioned".to_string()]
}

fn default_replaced_fields() -> BTreeMap<String, String> {
    BTreeMap::from([("local.hasMetadata".to_string(), "local.hasCMDI".to_string())])
}
