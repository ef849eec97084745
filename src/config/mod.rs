use garde::Validate;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::completion::DetectorConfig;
use crate::services::pool::PoolSettings;
use crate::services::retry::RetryPolicy;
use crate::services::worker::WorkerConfig;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// SQLite job store, e.g. "sqlite://jobs.db".
    #[garde(length(min = 1))]
    pub database_url: String,

    /// Number of concurrent workers (and agent sessions).
    #[serde(default = "default_worker_count")]
    #[garde(range(min = 1, max = 64))]
    pub worker_count: usize,

    /// Maximum distinct jobs one run may claim. Unset means no limit.
    #[serde(default)]
    #[garde(skip)]
    pub batch_limit: Option<u32>,

    #[serde(default = "default_max_attempts")]
    #[garde(range(min = 1, max = 100))]
    pub max_attempts: u32,

    /// Time between buffer samples.
    #[serde(default = "default_poll_interval_ms")]
    #[garde(range(min = 1))]
    pub poll_interval_ms: u64,

    /// Consecutive unchanged samples that count as completion.
    #[serde(default = "default_stable_samples")]
    #[garde(range(min = 1, max = 100))]
    pub stable_samples: u32,

    #[serde(default = "default_timeout_ceiling_secs")]
    #[garde(range(min = 1))]
    pub timeout_ceiling_secs: u64,

    #[serde(default = "default_start_grace_secs")]
    #[garde(skip)]
    pub start_grace_secs: u64,

    #[serde(default = "default_retry_delay_ms")]
    #[garde(skip)]
    pub retry_delay_ms: u64,

    #[serde(default = "default_idle_poll_ms")]
    #[garde(range(min = 1))]
    pub idle_poll_ms: u64,

    #[serde(default = "default_idle_grace_secs")]
    #[garde(skip)]
    pub idle_grace_secs: u64,

    /// Claims older than this are reclaimed at startup.
    #[serde(default = "default_stale_claim_secs")]
    #[garde(range(min = 1))]
    pub stale_claim_secs: u64,

    /// Periodic reconcile while the pool runs. 0 disables it.
    #[serde(default)]
    #[garde(skip)]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_session_connect_attempts")]
    #[garde(range(min = 1, max = 20))]
    pub session_connect_attempts: u32,

    /// OpenAI-compatible API base, e.g. "https://api.openai.com/v1".
    #[serde(default = "default_agent_base_url")]
    #[garde(length(min = 1))]
    pub agent_base_url: String,

    #[serde(default)]
    #[garde(skip)]
    pub agent_api_key: String,

    #[serde(default = "default_agent_model")]
    #[garde(length(min = 1))]
    pub agent_model: String,

    /// Replaces the built-in agent instructions.
    #[serde(default)]
    #[garde(skip)]
    pub instructions_file: Option<PathBuf>,

    /// Top-level key the agent's JSON must carry.
    #[serde(default = "default_output_required_key")]
    #[garde(length(min = 1))]
    pub output_required_key: String,

    /// Directory for per-job result files. Unset disables the file sink.
    #[serde(default)]
    #[garde(skip)]
    pub output_dir: Option<PathBuf>,

    /// Prometheus listener for the worker process, e.g. "0.0.0.0:9100".
    #[serde(default)]
    #[garde(skip)]
    pub metrics_addr: Option<String>,

    /// Status API bind address.
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,
}

fn default_worker_count() -> usize {
    2
}

fn default_max_attempts() -> u32 {
    4
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

fn default_stable_samples() -> u32 {
    2
}

fn default_timeout_ceiling_secs() -> u64 {
    15 * 60
}

fn default_start_grace_secs() -> u64 {
    30
}

fn default_retry_delay_ms() -> u64 {
    10_000
}

fn default_idle_poll_ms() -> u64 {
    1_000
}

fn default_idle_grace_secs() -> u64 {
    30
}

fn default_stale_claim_secs() -> u64 {
    3_600
}

fn default_session_connect_attempts() -> u32 {
    3
}

fn default_agent_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_agent_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_output_required_key() -> String {
    "extracted_tables".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl AppConfig {
    /// Load from the process environment (and `.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::checked(envy::from_env()?)
    }

    /// Load from explicit `(NAME, value)` pairs.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self::checked(envy::from_iter(vars)?)
    }

    fn checked(config: Self) -> Result<Self, ConfigError> {
        config.validate()?;
        config.check_policy()?;
        Ok(config)
    }

    fn check_policy(&self) -> Result<(), ConfigError> {
        if self.batch_limit == Some(0) {
            return Err(ConfigError::Policy("BATCH_LIMIT must be at least 1 when set".into()));
        }
        if self.stale_claim_secs <= self.timeout_ceiling_secs {
            return Err(ConfigError::Policy(format!(
                "STALE_CLAIM_SECS ({}) must exceed TIMEOUT_CEILING_SECS ({}) or live claims would be reclaimed",
                self.stale_claim_secs, self.timeout_ceiling_secs
            )));
        }
        let window = self.detector_config().stability_window();
        if window >= self.timeout_ceiling() {
            return Err(ConfigError::Policy(format!(
                "stability window {window:?} (POLL_INTERVAL_MS x STABLE_SAMPLES) must be shorter than TIMEOUT_CEILING_SECS"
            )));
        }
        Ok(())
    }

    pub fn timeout_ceiling(&self) -> Duration {
        Duration::from_secs(self.timeout_ceiling_secs)
    }

    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stable_samples: self.stable_samples,
            timeout_ceiling: self.timeout_ceiling(),
            start_grace: Duration::from_secs(self.start_grace_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            idle_poll: Duration::from_millis(self.idle_poll_ms),
            idle_grace: Duration::from_secs(self.idle_grace_secs),
            session_connect_attempts: self.session_connect_attempts,
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            worker_count: self.worker_count,
            batch_limit: self.batch_limit,
            reconcile_interval: (self.reconcile_interval_secs > 0)
                .then(|| Duration::from_secs(self.reconcile_interval_secs)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),

    #[error("Invalid configuration: {0}")]
    Policy(String),
}
