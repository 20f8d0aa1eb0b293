//! Configuration module
//!
//! This module provides the engine configuration consumed by the task
//! system facade. The core components never read the environment
//! themselves; the facade loads an `EngineConfig` and passes settings down.

use std::env;
use std::time::Duration;

/// Engine configuration with environment-variable loading.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Number of worker executors.
    pub worker_concurrency: usize,
    /// Queue names the workers drain, in declared priority-polling order.
    pub worker_queues: Vec<String>,
    /// Maximum outstanding (queued + delayed) tasks across all queues.
    pub queue_capacity: usize,
    /// How long a worker blocks on an empty queue before re-polling.
    pub dequeue_timeout: Duration,
    /// Default per-attempt timeout applied by `TaskConfig::default`.
    pub default_task_timeout: Duration,
    pub default_max_retries: u32,
    pub default_retry_delay: Duration,
    pub default_backoff_multiplier: f64,
    /// Grace window between requesting cancellation on timeout and
    /// abandoning the attempt.
    pub cancel_grace: Duration,
    /// Bound on waiting for in-flight tasks during graceful shutdown.
    pub shutdown_grace: Duration,
    pub enable_scheduler: bool,
    pub enable_monitor: bool,
    /// Age after which terminal result-backend entries may be cleaned up.
    pub result_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: WORKER_CONCURRENCY,
            worker_queues: vec!["default".to_string()],
            queue_capacity: QUEUE_CAPACITY,
            dequeue_timeout: Duration::from_millis(DEQUEUE_TIMEOUT_MS),
            default_task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            default_backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            cancel_grace: Duration::from_millis(CANCEL_GRACE_MS),
            shutdown_grace: Duration::from_secs(SHUTDOWN_GRACE_SECS),
            enable_scheduler: true,
            enable_monitor: true,
            result_retention: Duration::from_secs(RESULT_RETENTION_SECS),
        }
    }
}

const WORKER_CONCURRENCY: usize = 4;
const QUEUE_CAPACITY: usize = 10_000;
const DEQUEUE_TIMEOUT_MS: u64 = 1000;
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const CANCEL_GRACE_MS: u64 = 100;
const SHUTDOWN_GRACE_SECS: u64 = 30;
const RESULT_RETENTION_SECS: u64 = 86_400;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let worker_queues: Vec<String> = env::var("TASKLANE_WORKER_QUEUES")
            .unwrap_or_else(|_| "default".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Self {
            worker_concurrency: env_parse("TASKLANE_WORKER_CONCURRENCY", WORKER_CONCURRENCY),
            worker_queues,
            queue_capacity: env_parse("TASKLANE_QUEUE_CAPACITY", QUEUE_CAPACITY),
            dequeue_timeout: Duration::from_millis(env_parse(
                "TASKLANE_DEQUEUE_TIMEOUT_MS",
                DEQUEUE_TIMEOUT_MS,
            )),
            default_task_timeout: Duration::from_secs(env_parse(
                "TASKLANE_DEFAULT_TASK_TIMEOUT_SECS",
                DEFAULT_TASK_TIMEOUT_SECS,
            )),
            default_max_retries: env_parse("TASKLANE_DEFAULT_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            default_retry_delay: Duration::from_millis(env_parse(
                "TASKLANE_DEFAULT_RETRY_DELAY_MS",
                DEFAULT_RETRY_DELAY_MS,
            )),
            default_backoff_multiplier: env_parse(
                "TASKLANE_DEFAULT_BACKOFF_MULTIPLIER",
                DEFAULT_BACKOFF_MULTIPLIER,
            ),
            cancel_grace: Duration::from_millis(env_parse(
                "TASKLANE_CANCEL_GRACE_MS",
                CANCEL_GRACE_MS,
            )),
            shutdown_grace: Duration::from_secs(env_parse(
                "TASKLANE_SHUTDOWN_GRACE_SECS",
                SHUTDOWN_GRACE_SECS,
            )),
            enable_scheduler: env_parse("TASKLANE_ENABLE_SCHEDULER", true),
            enable_monitor: env_parse("TASKLANE_ENABLE_MONITOR", true),
            result_retention: Duration::from_secs(env_parse(
                "TASKLANE_RESULT_RETENTION_SECS",
                RESULT_RETENTION_SECS,
            )),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.worker_concurrency == 0 {
            return Err(anyhow::anyhow!(
                "TASKLANE_WORKER_CONCURRENCY must be greater than zero"
            ));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow::anyhow!(
                "TASKLANE_QUEUE_CAPACITY must be greater than zero"
            ));
        }
        if self.worker_queues.is_empty() {
            return Err(anyhow::anyhow!(
                "TASKLANE_WORKER_QUEUES must name at least one queue"
            ));
        }
        if self.default_backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!(
                "TASKLANE_DEFAULT_BACKOFF_MULTIPLIER must be at least 1.0"
            ));
        }
        if self.default_task_timeout.is_zero() {
            return Err(anyhow::anyhow!(
                "TASKLANE_DEFAULT_TASK_TIMEOUT_SECS must be greater than zero"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.worker_queues, vec!["default".to_string()]);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = EngineConfig {
            worker_concurrency: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = EngineConfig {
            queue_capacity: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_queue_list() {
        let config = EngineConfig {
            worker_queues: Vec::new(),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_small_multiplier() {
        let config = EngineConfig {
            default_backoff_multiplier: 0.9,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
