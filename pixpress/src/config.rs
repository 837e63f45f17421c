//! Engine configuration loaded from environment variables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::pool::ProcessUnitCommand;
use crate::error::{Error, Result};

/// Which kind of execution unit backs the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// OS threads inside this process.
    #[default]
    Thread,
    /// Child processes running `pixpress unit`.
    Process,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Thread => write!(f, "thread"),
            PoolKind::Process => write!(f, "process"),
        }
    }
}

impl FromStr for PoolKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" | "threads" | "worker" => Ok(PoolKind::Thread),
            "process" | "processes" | "cluster" => Ok(PoolKind::Process),
            other => Err(Error::config(format!("Unknown pool kind: {}", other))),
        }
    }
}

/// Retry policy applied by the scheduler to failed attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enable: bool,
    /// Total number of executions allowed, the first one included.
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enable: true,
            max_attempts: 3,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            enable: false,
            ..Self::default()
        }
    }

    /// Whether another execution is allowed after `attempts` executions.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.enable && attempts < self.max_attempts
    }

    /// Delay before the next execution: `min(initial * 2^attempts, max)`.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        let delay = self
            .backoff_initial_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }
}

/// Configuration for the job engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of execution units.
    pub concurrency: usize,
    pub pool_kind: PoolKind,
    /// Maximum number of queued (not yet running) jobs.
    pub queue_max: usize,
    /// Wall-clock bound for one execution attempt.
    pub job_timeout_ms: u64,
    pub retry: RetryPolicy,
    /// Command used to start process units. Defaults to `<current exe> unit`.
    pub process_command: Option<ProcessUnitCommand>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            pool_kind: PoolKind::Thread,
            queue_max: 1000,
            job_timeout_ms: 180_000,
            retry: RetryPolicy::default(),
            process_command: None,
        }
    }
}

impl EngineConfig {
    /// Load engine config from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `PIXPRESS_CONCURRENCY`
    /// - `PIXPRESS_QUEUE_MAX`
    /// - `PIXPRESS_JOB_TIMEOUT_MS`
    /// - `PIXPRESS_POOL` (`thread` or `process`)
    /// - `PIXPRESS_RETRY_ENABLE`
    /// - `PIXPRESS_RETRY_MAX_ATTEMPTS`
    /// - `PIXPRESS_RETRY_BACKOFF_INITIAL_MS`
    /// - `PIXPRESS_RETRY_BACKOFF_MAX_MS`
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Some(concurrency) = env_parse::<usize>("PIXPRESS_CONCURRENCY")
            && concurrency > 0
        {
            config.concurrency = concurrency;
        }
        if let Some(queue_max) = env_parse::<usize>("PIXPRESS_QUEUE_MAX")
            && queue_max > 0
        {
            config.queue_max = queue_max;
        }
        if let Some(timeout) = env_parse::<u64>("PIXPRESS_JOB_TIMEOUT_MS")
            && timeout > 0
        {
            config.job_timeout_ms = timeout;
        }
        if let Ok(kind) = std::env::var("PIXPRESS_POOL") {
            match kind.parse() {
                Ok(kind) => config.pool_kind = kind,
                Err(e) => tracing::warn!("Ignoring PIXPRESS_POOL: {}", e),
            }
        }
        if let Some(enable) = env_bool("PIXPRESS_RETRY_ENABLE") {
            config.retry.enable = enable;
        }
        if let Some(max_attempts) = env_parse::<u32>("PIXPRESS_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(initial) = env_parse::<u64>("PIXPRESS_RETRY_BACKOFF_INITIAL_MS") {
            config.retry.backoff_initial_ms = initial;
        }
        if let Some(max) = env_parse::<u64>("PIXPRESS_RETRY_BACKOFF_MAX_MS") {
            config.retry.backoff_max_ms = max;
        }

        config
    }

    /// Check the values that would make the engine unusable.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::config("concurrency must be at least 1"));
        }
        if self.queue_max == 0 {
            return Err(Error::config("queue_max must be at least 1"));
        }
        if self.job_timeout_ms == 0 {
            return Err(Error::config("job_timeout_ms must be greater than 0"));
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

/// CPU count minus one, at least one.
fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .saturating_sub(1)
        .max(1)
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn env_bool(name: &str) -> Option<bool> {
    parse_bool(&std::env::var(name).ok()?)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.concurrency >= 1);
        assert_eq!(config.queue_max, 1000);
        assert_eq!(config.job_timeout_ms, 180_000);
        assert_eq!(config.pool_kind, PoolKind::Thread);
        assert!(config.retry.enable);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            enable: true,
            max_attempts: 10,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30_000,
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff_for(5), Duration::from_millis(30_000));
        assert_eq!(policy.backoff_for(200), Duration::from_millis(30_000));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::disabled().should_retry(1));
    }

    #[test]
    fn test_pool_kind_parse() {
        assert_eq!("process".parse::<PoolKind>().unwrap(), PoolKind::Process);
        assert_eq!("Thread".parse::<PoolKind>().unwrap(), PoolKind::Thread);
        assert!("fork".parse::<PoolKind>().is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("yes"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = EngineConfig {
            concurrency: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let config = EngineConfig {
            queue_max: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
