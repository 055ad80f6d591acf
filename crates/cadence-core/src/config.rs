use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_INSTANCE_NAME: &str = "CadenceScheduler";
/// Instance id placeholder that is replaced by a generated UUID at startup.
pub const AUTO_INSTANCE_ID: &str = "AUTO";
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
pub const DEFAULT_MISFIRE_THRESHOLD_MS: u64 = 60_000;
pub const DEFAULT_IDLE_WAIT_MS: u64 = 1_000;
pub const DEFAULT_CHECKIN_INTERVAL_MS: u64 = 7_500;
pub const DEFAULT_LOCK_LEASE_MS: u64 = 30_000;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Acquisition loop and worker pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Logical scheduler name shared by every instance of one cluster.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    /// Unique id of this process. `AUTO` generates one at startup.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    /// Upper bound on concurrently executing jobs in this instance.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Maximum number of triggers claimed per acquisition cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How far ahead of `now` a trigger may be acquired.
    #[serde(default = "default_lookahead_ms")]
    pub lookahead_ms: u64,
    /// Sleep between acquisition cycles that found nothing to fire.
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
    /// A trigger overdue by more than this is treated as misfired.
    #[serde(default = "default_misfire_threshold_ms")]
    pub misfire_threshold_ms: u64,
    #[serde(default = "default_max_misfires_per_pass")]
    pub max_misfires_per_pass: usize,
    /// Attempts made to persist a job completion before leaving it to recovery.
    #[serde(default = "default_completion_retries")]
    pub completion_retries: u32,
    /// Base delay of the capped exponential backoff used after store failures.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Maximum in-place re-executions requested through `refire_immediately`.
    #[serde(default = "default_max_refires")]
    pub max_refires: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            instance_id: default_instance_id(),
            max_concurrency: default_max_concurrency(),
            batch_size: default_batch_size(),
            lookahead_ms: default_lookahead_ms(),
            idle_wait_ms: default_idle_wait_ms(),
            misfire_threshold_ms: default_misfire_threshold_ms(),
            max_misfires_per_pass: default_max_misfires_per_pass(),
            completion_retries: default_completion_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_refires: default_max_refires(),
        }
    }
}

impl SchedulerConfig {
    /// The configured instance id, or a fresh UUID when set to `AUTO`.
    pub fn resolved_instance_id(&self) -> String {
        if self.instance_id.eq_ignore_ascii_case(AUTO_INSTANCE_ID) {
            uuid::Uuid::new_v4().to_string()
        } else {
            self.instance_id.clone()
        }
    }

    pub fn misfire_threshold(&self) -> Duration {
        Duration::from_millis(self.misfire_threshold_ms)
    }

    pub fn lookahead(&self) -> Duration {
        Duration::from_millis(self.lookahead_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Create missing tables on startup. When false a missing schema is fatal.
    #[serde(default = "bool_true")]
    pub create_schema: bool,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            create_schema: true,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Multi-instance coordination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// When false this instance assumes it is the only user of the database.
    #[serde(default)]
    pub clustered: bool,
    #[serde(default = "default_checkin_interval_ms")]
    pub checkin_interval_ms: u64,
    /// Extra time past a missed check-in before a peer is declared failed.
    #[serde(default = "default_failure_grace_ms")]
    pub failure_grace_ms: u64,
    /// Lease length of a cluster lock row; a dead holder loses it after this.
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_lock_retry_ms")]
    pub lock_retry_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            clustered: false,
            checkin_interval_ms: default_checkin_interval_ms(),
            failure_grace_ms: default_failure_grace_ms(),
            lock_lease_ms: default_lock_lease_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_retry_ms: default_lock_retry_ms(),
        }
    }
}

impl ClusterConfig {
    pub fn checkin_interval(&self) -> Duration {
        Duration::from_millis(self.checkin_interval_ms)
    }

    pub fn failure_grace(&self) -> Duration {
        Duration::from_millis(self.failure_grace_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }
}

fn bool_true() -> bool {
    true
}
fn default_instance_name() -> String {
    DEFAULT_INSTANCE_NAME.to_string()
}
fn default_instance_id() -> String {
    AUTO_INSTANCE_ID.to_string()
}
fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}
fn default_batch_size() -> usize {
    1
}
fn default_lookahead_ms() -> u64 {
    DEFAULT_IDLE_WAIT_MS
}
fn default_idle_wait_ms() -> u64 {
    DEFAULT_IDLE_WAIT_MS
}
fn default_misfire_threshold_ms() -> u64 {
    DEFAULT_MISFIRE_THRESHOLD_MS
}
fn default_max_misfires_per_pass() -> usize {
    20
}
fn default_completion_retries() -> u32 {
    10
}
fn default_retry_backoff_ms() -> u64 {
    1_000
}
fn default_max_refires() -> u32 {
    3
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_checkin_interval_ms() -> u64 {
    DEFAULT_CHECKIN_INTERVAL_MS
}
fn default_failure_grace_ms() -> u64 {
    7_500
}
fn default_lock_lease_ms() -> u64 {
    DEFAULT_LOCK_LEASE_MS
}
fn default_lock_timeout_ms() -> u64 {
    5_000
}
fn default_lock_retry_ms() -> u64 {
    50
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CADENCE_SCHEDULER__MAX_CONCURRENCY=4`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        Self::figment(config_path)
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))
    }

    /// The provider chain used by [`CadenceConfig::load`]. Exposed so callers
    /// can extract their own sections from the same sources.
    pub fn figment(config_path: Option<&str>) -> Figment {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CADENCE_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
