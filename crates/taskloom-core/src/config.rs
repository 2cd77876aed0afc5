//! Worker configuration
//!
//! 読み込み順（後勝ち）:
//! 1. `WorkerConfig::default()`
//! 2. 設定ファイル（任意、toml / json / yaml）
//! 3. 環境変数 `TASKLOOM__*`（例: `TASKLOOM__CONCURRENCY=4`,
//!    `TASKLOOM__RETRY__BASE_DELAY_MS=500`, `TASKLOOM__QUEUES=critical,default`）

use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::domain::{RetryPolicy, TaskloomError};

pub const ENV_PREFIX: &str = "TASKLOOM";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops.
    pub concurrency: usize,
    /// Named queues in priority order.
    pub queues: Vec<String>,
    pub lease_ttl_ms: u64,
    /// Reaper sweep period.
    pub sweep_interval_ms: u64,
    /// How long one pull waits before re-checking for shutdown.
    pub poll_interval_ms: u64,
    /// Drain budget on shutdown.
    pub shutdown_timeout_ms: u64,
    pub retry: RetryConfig,
    pub json_logs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fraction (0.0..=1.0) a delay may be shortened by at random.
    pub jitter: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec![crate::domain::DEFAULT_QUEUE.to_string()],
            lease_ttl_ms: 30_000,
            sweep_interval_ms: 1_000,
            poll_interval_ms: 1_000,
            shutdown_timeout_ms: 8_000,
            retry: RetryConfig::default(),
            json_logs: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 600_000,
            jitter: 0.0,
        }
    }
}

impl WorkerConfig {
    /// Load defaults, then `path` (if it exists), then the environment.
    pub fn load(path: Option<&str>) -> Result<Self, TaskloomError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let config: Self = builder
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults. No environment.
    pub fn from_toml(toml: &str) -> Result<Self, TaskloomError> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TaskloomError> {
        if self.concurrency == 0 {
            return Err(TaskloomError::Config("concurrency must be at least 1".into()));
        }
        if self.queues.iter().all(|q| q.trim().is_empty()) {
            return Err(TaskloomError::Config("at least one queue is required".into()));
        }
        if self.lease_ttl_ms == 0 {
            return Err(TaskloomError::Config("lease_ttl_ms must be positive".into()));
        }
        if self.sweep_interval_ms == 0 || self.poll_interval_ms == 0 {
            return Err(TaskloomError::Config(
                "sweep_interval_ms and poll_interval_ms must be positive".into(),
            ));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(TaskloomError::Config("retry.multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(TaskloomError::Config("retry.jitter must be within 0.0..=1.0".into()));
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry.base_delay_ms),
            self.retry.multiplier,
            Duration::from_millis(self.retry.max_delay_ms),
        )
        .with_jitter(self.retry.jitter)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("queues")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.queues, vec!["default".to_string()]);
        assert_eq!(config.lease_ttl(), Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(8));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_overrides_only_what_it_names() {
        let config = WorkerConfig::from_toml(
            r#"
            concurrency = 4
            queues = ["critical", "default", "low"]

            [retry]
            base_delay_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.queues.len(), 3);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.retry.max_delay_ms, 600_000);
        assert_eq!(config.lease_ttl_ms, 30_000);
    }

    #[test]
    fn retry_jitter_reaches_the_policy() {
        let config = WorkerConfig::from_toml("[retry]\njitter = 0.25").unwrap();
        assert_eq!(config.retry_policy().jitter, 0.25);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = WorkerConfig::load(Some("does-not-exist/taskloom.toml")).unwrap();
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case::zero_concurrency("concurrency = 0")]
    #[case::blank_queues(r#"queues = [" "]"#)]
    #[case::zero_ttl("lease_ttl_ms = 0")]
    #[case::zero_sweep("sweep_interval_ms = 0")]
    #[case::shrinking_backoff("[retry]\nmultiplier = 0.5")]
    #[case::jitter_above_one("[retry]\njitter = 1.5")]
    fn invalid_configs_are_rejected(#[case] toml: &str) {
        let err = WorkerConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, TaskloomError::Config(_)));
    }
}
