//! Configuration for drover.
//!
//! Loaded once from `drover.toml`, validated, then passed down as an immutable
//! `Arc<DroverConfig>`. Nothing reads ambient global state: secrets are only
//! referenced by environment variable name.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::RetryPolicy;
use crate::error::{DroverError, Result};

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "drover.toml";

// ---------------------------------------------------------------------------
// Config structs (matching drover.toml)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DroverConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub claim: ClaimConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub recorder: RecorderConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub http: HttpConfig,
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the libSQL database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// How long a connection waits on a locked database before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("drover.db")
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// `[worker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker loops the supervisor runs.
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Delay between consecutive worker start-ups.
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,

    /// First sleep after finding nothing to claim.
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,

    /// Idle sleeps grow up to this bound.
    #[serde(default = "default_max_idle_backoff_ms")]
    pub max_idle_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            stagger_ms: default_stagger_ms(),
            idle_backoff_ms: default_idle_backoff_ms(),
            max_idle_backoff_ms: default_max_idle_backoff_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn idle_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.idle_backoff_ms),
            Duration::from_millis(self.max_idle_backoff_ms.max(self.idle_backoff_ms)),
        )
        .with_jitter(0.2)
    }
}

fn default_worker_count() -> usize {
    4
}
fn default_stagger_ms() -> u64 {
    500
}
fn default_idle_backoff_ms() -> u64 {
    1_000
}
fn default_max_idle_backoff_ms() -> u64 {
    30_000
}

/// `[claim]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimConfig {
    /// Age after which an unresolved claim counts as abandoned.
    #[serde(default = "default_staleness_timeout_secs")]
    pub staleness_timeout_secs: u64,

    /// How many of the oldest eligible rows are fetched per claim round.
    #[serde(default = "default_candidate_window")]
    pub candidate_window: usize,

    /// Rounds of lost races before `claim_one` reports a conflict.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Only claim items of this category.
    #[serde(default)]
    pub category: Option<String>,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            staleness_timeout_secs: default_staleness_timeout_secs(),
            candidate_window: default_candidate_window(),
            max_rounds: default_max_rounds(),
            category: None,
        }
    }
}

impl ClaimConfig {
    /// Saturates at `TimeDelta::MAX`; `validate` keeps real configs far below it.
    pub fn staleness_timeout(&self) -> chrono::Duration {
        i64::try_from(self.staleness_timeout_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .unwrap_or(chrono::TimeDelta::MAX)
    }
}

/// Upper bound on `claim.staleness_timeout_secs` (100 years).
pub const MAX_STALENESS_TIMEOUT_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn default_staleness_timeout_secs() -> u64 {
    1_800
}
fn default_candidate_window() -> usize {
    8
}
fn default_max_rounds() -> u32 {
    3
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Time budget for a single stage call. `None` = unbounded.
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,

    /// Time budget for a whole run; must stay below the staleness timeout.
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: None,
            max_duration_secs: default_max_duration_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

fn default_max_duration_secs() -> u64 {
    900
}

/// `[recorder]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Retries after the first failed write.
    #[serde(default = "default_recorder_retries")]
    pub max_retries: u32,

    #[serde(default = "default_recorder_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_recorder_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_retries: default_recorder_retries(),
            base_delay_ms: default_recorder_base_delay_ms(),
            max_delay_ms: default_recorder_max_delay_ms(),
        }
    }
}

impl RecorderConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
        )
    }
}

fn default_recorder_retries() -> u32 {
    5
}
fn default_recorder_base_delay_ms() -> u64 {
    200
}
fn default_recorder_max_delay_ms() -> u64 {
    5_000
}

/// `[supervisor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// How often worker liveness is checked.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Delay before a crashed worker is started again.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    /// Restarts allowed per worker slot. `None` = unlimited.
    #[serde(default)]
    pub max_restarts: Option<u32>,

    /// Graceful drain window before workers are aborted.
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: default_monitor_interval_ms(),
            restart_backoff_ms: default_restart_backoff_ms(),
            max_restarts: None,
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
        }
    }
}

impl SupervisorConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }
}

fn default_monitor_interval_ms() -> u64 {
    1_000
}
fn default_restart_backoff_ms() -> u64 {
    2_000
}
fn default_shutdown_deadline_secs() -> u64 {
    60
}

/// `[http]` section, used by the CLI's HTTP collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Name of the env var holding a bearer token (never store the token itself).
    #[serde(default)]
    pub auth_token_env: Option<String>,

    /// Directory the artifact sink writes into.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
            auth_token_env: None,
            output_dir: default_output_dir(),
        }
    }
}

impl HttpConfig {
    /// Resolve the token from the environment, if configured and set.
    pub fn auth_token(&self) -> Option<String> {
        let var = self.auth_token_env.as_deref()?;
        std::env::var(var).ok().filter(|v| !v.is_empty())
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    concat!("drover/", env!("CARGO_PKG_VERSION")).into()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl DroverConfig {
    /// Reject combinations that break the claim protocol.
    pub fn validate(&self) -> Result<()> {
        if self.worker.count == 0 {
            return Err(DroverError::config("worker.count must be at least 1"));
        }
        if self.claim.candidate_window == 0 {
            return Err(DroverError::config("claim.candidate_window must be at least 1"));
        }
        if self.claim.max_rounds == 0 {
            return Err(DroverError::config("claim.max_rounds must be at least 1"));
        }
        if self.claim.staleness_timeout_secs > MAX_STALENESS_TIMEOUT_SECS {
            return Err(DroverError::config(format!(
                "claim.staleness_timeout_secs ({}) must not exceed {MAX_STALENESS_TIMEOUT_SECS}",
                self.claim.staleness_timeout_secs
            )));
        }
        if self.claim.staleness_timeout_secs <= self.pipeline.max_duration_secs {
            return Err(DroverError::config(format!(
                "claim.staleness_timeout_secs ({}) must exceed pipeline.max_duration_secs ({}), \
                 otherwise in-progress work gets reclaimed",
                self.claim.staleness_timeout_secs, self.pipeline.max_duration_secs
            )));
        }
        if let Some(stage) = self.pipeline.stage_timeout_secs
            && stage > self.pipeline.max_duration_secs
        {
            return Err(DroverError::config(
                "pipeline.stage_timeout_secs must not exceed pipeline.max_duration_secs",
            ));
        }
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| DroverError::config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DroverError::config(e.to_string()))
    }
}

/// Load config from `path`. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<DroverConfig> {
    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(DroverConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| DroverError::config(format!("failed to read {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| DroverError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Write a default config file to `path`, refusing to overwrite.
pub fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(DroverError::config(format!(
            "{} already exists",
            path.display()
        )));
    }
    let content = DroverConfig::default().to_toml_string()?;
    std::fs::write(path, content)
        .map_err(|e| DroverError::config(format!("failed to write {}: {e}", path.display())))?;
    tracing::info!(?path, "created default config file");
    Ok(())
}
