//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::store::{StoreBackend, StoreStrategy};

/// Prefix of environment variables that override file settings,
/// e.g. `TURNSTILE__GATE__ALLOWED_PERIOD_MS=5000`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Admission gate configuration
    #[serde(default)]
    pub gate: GateConfig,

    /// Store selection and connection settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Retention sweep configuration
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the gate behaves when another decision holds the user's lock.
///
/// Only fail-fast is supported: a long wait is worse than a quick rejection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockWaitPolicy {
    #[default]
    FailFast,
}

/// Admission gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Minimum spacing between permitted actions per user, in milliseconds
    #[serde(default = "default_allowed_period_ms")]
    pub allowed_period_ms: u64,

    /// Lock wait policy
    #[serde(default)]
    pub lock_wait_policy: LockWaitPolicy,

    /// Optional deadline for a single decision, in milliseconds
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            allowed_period_ms: default_allowed_period_ms(),
            lock_wait_policy: LockWaitPolicy::default(),
            call_timeout_ms: None,
        }
    }
}

impl GateConfig {
    pub fn allowed_period(&self) -> Duration {
        Duration::from_millis(self.allowed_period_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

fn default_allowed_period_ms() -> u64 {
    2000
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Where records live
    #[serde(default)]
    pub backend: StoreBackend,

    /// How the check-and-record step is made atomic
    #[serde(default)]
    pub strategy: StoreStrategy,

    /// Postgres connection URL, required for the postgres backend
    #[serde(default)]
    pub database_url: Option<String>,

    /// Connection pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long to wait for a pooled connection, in milliseconds
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            strategy: StoreStrategy::default(),
            database_url: None,
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

/// Retention sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Records older than this are deleted, in seconds
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// Interval between sweeps, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RetentionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_max_age_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig =
            serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file, then apply
    /// `TURNSTILE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::new(
                &path.to_string_lossy(),
                ::config::FileFormat::Yaml,
            ));
        }

        let config: TurnstileConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gate cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.gate.allowed_period_ms == 0 {
            return Err(TurnstileError::Config(
                "gate.allowed_period_ms must be greater than zero".to_string(),
            ));
        }

        if self.store.backend == StoreBackend::Postgres
            && self.store.database_url.as_deref().map_or(true, str::is_empty)
        {
            return Err(TurnstileError::Config(
                "store.database_url is required for the postgres backend".to_string(),
            ));
        }

        if self.retention.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "retention.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }

        // A shorter max age could purge a record that still blocks its user.
        if self.retention.max_age() < self.gate.allowed_period() {
            return Err(TurnstileError::Config(
                "retention.max_age_secs must cover gate.allowed_period_ms".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.gate.allowed_period(), Duration::from_secs(2));
        assert_eq!(config.gate.lock_wait_policy, LockWaitPolicy::FailFast);
        assert_eq!(config.gate.call_timeout(), None);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.strategy, StoreStrategy::ConditionalUpsert);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
gate:
  allowed_period_ms: 5000
  lock_wait_policy: fail_fast
  call_timeout_ms: 250
store:
  backend: postgres
  strategy: locking
  database_url: postgres://localhost/turnstile
  max_connections: 4
retention:
  max_age_secs: 86400
  sweep_interval_secs: 60
logging:
  level: debug
  json: true
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.gate.allowed_period(), Duration::from_secs(5));
        assert_eq!(config.gate.call_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.store.backend, StoreBackend::Postgres);
        assert_eq!(config.store.strategy, StoreStrategy::Locking);
        assert_eq!(config.store.max_connections, 4);
        assert_eq!(config.retention.sweep_interval(), Duration::from_secs(60));
        assert!(config.logging.json);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = TurnstileConfig::from_yaml("gate:\n  allowed_period_ms: 1000\n").unwrap();
        assert_eq!(config.gate.allowed_period_ms, 1000);
        assert_eq!(config.store.max_connections, 10);
        assert_eq!(config.retention.max_age_secs, 3600);
    }

    #[test]
    fn test_blocking_lock_policy_rejected() {
        let yaml = "gate:\n  lock_wait_policy: wait\n";
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_period_rejected() {
        let yaml = "gate:\n  allowed_period_ms: 0\n";
        assert!(matches!(
            TurnstileConfig::from_yaml(yaml),
            Err(TurnstileError::Config(_))
        ));
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let yaml = "retention:\n  sweep_interval_secs: 0\n";
        assert!(matches!(
            TurnstileConfig::from_yaml(yaml),
            Err(TurnstileError::Config(_))
        ));
    }

    #[test]
    fn test_postgres_requires_url() {
        let yaml = "store:\n  backend: postgres\n";
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_retention_shorter_than_period_rejected() {
        let yaml = r#"
gate:
  allowed_period_ms: 120000
retention:
  max_age_secs: 60
"#;
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }
}
