//! Configuration management for the speaker bridge
//!
//! Values are resolved in three layers: built-in defaults, the optional TOML
//! file, then `SPEAKER_BRIDGE_*` environment variables. Each component receives
//! its own section by value; there is no process-wide mutable default.

pub mod file;

use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::{Error, Result};
use file::BridgeConfigFile;

/// Speaker bridge configuration
#[derive(Debug, Clone, Default, Serialize)]
pub struct Config {
    /// Job engine configuration
    pub concurrency: ConcurrencyConfig,

    /// Retry/backoff configuration for device calls
    pub recovery: RecoveryConfig,

    /// Circuit breaker configuration for device calls
    pub breaker: BreakerConfig,

    /// Device query polling
    pub poller: PollerConfig,
}

/// Job engine configuration
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencyConfig {
    /// Route queries through the worker pool instead of handling them inline
    pub enabled: bool,

    /// Number of worker tasks
    pub worker_count: usize,

    /// Job queue capacity
    pub queue_size: usize,

    /// Inbound message buffer capacity
    pub message_buffer_size: usize,

    /// Admissions per second
    pub rate_limit: u32,

    /// Jobs per batch flush (1 or less disables batching)
    pub batch_size: usize,

    /// Maximum time a job waits in a partial batch
    pub batch_timeout: Duration,

    /// Collect and expose job metrics
    pub enable_metrics: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_count: 4,
            queue_size: 100,
            message_buffer_size: 50,
            rate_limit: 10,
            batch_size: 5,
            batch_timeout: Duration::from_secs(5),
            enable_metrics: true,
        }
    }
}

/// Retry with exponential backoff
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Delay cap
    pub max_delay: Duration,

    /// Multiplier applied per attempt
    pub backoff_factor: f64,

    /// Run each attempt inside a panic boundary
    pub enable_panic_recovery: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            enable_panic_recovery: true,
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub max_failures: u32,

    /// Cool-down before a half-open trial call
    pub reset_time: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_time: Duration::from_secs(30),
        }
    }
}

/// Device query polling
#[derive(Debug, Clone, Serialize)]
pub struct PollerConfig {
    /// Time between polls of the device
    pub interval: Duration,

    /// Most recent queries requested per poll
    pub fetch_limit: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            fetch_limit: 10,
        }
    }
}

impl Config {
    /// Load configuration from the standard file location and environment
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Load configuration from an explicit file and the environment
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or the result is invalid
    pub fn load_from(path: &Path) -> Result<Self> {
        let fc = file::read_config_file(path)?;
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if an environment value doesn't parse or validation fails
    pub fn from_sources<F>(fc: BridgeConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let c = defaults.concurrency;
        let r = defaults.recovery;
        let b = defaults.breaker;
        let p = defaults.poller;

        let concurrency = ConcurrencyConfig {
            enabled: env_parse(&env, "SPEAKER_BRIDGE_CONCURRENT")?
                .or(fc.concurrency.enabled)
                .unwrap_or(c.enabled),
            worker_count: env_parse(&env, "SPEAKER_BRIDGE_WORKERS")?
                .or(fc.concurrency.worker_count)
                .unwrap_or(c.worker_count),
            queue_size: env_parse(&env, "SPEAKER_BRIDGE_QUEUE_SIZE")?
                .or(fc.concurrency.queue_size)
                .unwrap_or(c.queue_size),
            message_buffer_size: env_parse(&env, "SPEAKER_BRIDGE_BUFFER_SIZE")?
                .or(fc.concurrency.message_buffer_size)
                .unwrap_or(c.message_buffer_size),
            rate_limit: env_parse(&env, "SPEAKER_BRIDGE_RATE_LIMIT")?
                .or(fc.concurrency.rate_limit)
                .unwrap_or(c.rate_limit),
            batch_size: env_parse(&env, "SPEAKER_BRIDGE_BATCH_SIZE")?
                .or(fc.concurrency.batch_size)
                .unwrap_or(c.batch_size),
            batch_timeout: env_parse(&env, "SPEAKER_BRIDGE_BATCH_TIMEOUT_SECONDS")?
                .or(fc.concurrency.batch_timeout_seconds)
                .map_or(c.batch_timeout, Duration::from_secs),
            enable_metrics: env_parse(&env, "SPEAKER_BRIDGE_METRICS")?
                .or(fc.concurrency.enable_metrics)
                .unwrap_or(c.enable_metrics),
        };

        let recovery = RecoveryConfig {
            max_retries: fc.recovery.max_retries.unwrap_or(r.max_retries),
            initial_delay: fc
                .recovery
                .initial_delay_ms
                .map_or(r.initial_delay, Duration::from_millis),
            max_delay: fc
                .recovery
                .max_delay_ms
                .map_or(r.max_delay, Duration::from_millis),
            backoff_factor: fc.recovery.backoff_factor.unwrap_or(r.backoff_factor),
            enable_panic_recovery: fc
                .recovery
                .enable_panic_recovery
                .unwrap_or(r.enable_panic_recovery),
        };

        let breaker = BreakerConfig {
            max_failures: fc.breaker.max_failures.unwrap_or(b.max_failures),
            reset_time: fc
                .breaker
                .reset_time_ms
                .map_or(b.reset_time, Duration::from_millis),
        };

        let poller = PollerConfig {
            interval: env_parse(&env, "SPEAKER_BRIDGE_POLL_INTERVAL_MS")?
                .or(fc.poller.interval_ms)
                .map_or(p.interval, Duration::from_millis),
            fetch_limit: fc.poller.fetch_limit.unwrap_or(p.fetch_limit),
        };

        let config = Self {
            concurrency,
            recovery,
            breaker,
            poller,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        let c = &self.concurrency;
        if c.worker_count == 0 {
            return Err(Error::Config("worker_count must be at least 1".to_string()));
        }
        if c.queue_size == 0 {
            return Err(Error::Config("queue_size must be at least 1".to_string()));
        }
        if c.message_buffer_size == 0 {
            return Err(Error::Config(
                "message_buffer_size must be at least 1".to_string(),
            ));
        }
        if c.rate_limit == 0 {
            return Err(Error::Config("rate_limit must be at least 1".to_string()));
        }
        if c.batch_timeout.is_zero() {
            return Err(Error::Config("batch_timeout must be positive".to_string()));
        }

        let r = &self.recovery;
        if !r.backoff_factor.is_finite() || r.backoff_factor < 1.0 {
            return Err(Error::Config(format!(
                "backoff_factor must be >= 1.0, got {}",
                r.backoff_factor
            )));
        }
        if r.initial_delay > r.max_delay {
            return Err(Error::Config(
                "initial_delay must not exceed max_delay".to_string(),
            ));
        }

        if self.breaker.max_failures == 0 {
            return Err(Error::Config("max_failures must be at least 1".to_string()));
        }

        if self.poller.interval.is_zero() {
            return Err(Error::Config("poll interval must be positive".to_string()));
        }
        if self.poller.fetch_limit == 0 {
            return Err(Error::Config("fetch_limit must be at least 1".to_string()));
        }

        Ok(())
    }
}

/// Parse an optional environment value, rejecting malformed input
fn env_parse<F, T>(env: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid value for {key}: {raw:?}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use file::ConcurrencyFileConfig;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::from_sources(BridgeConfigFile::default(), no_env).unwrap();

        assert_eq!(config.concurrency.worker_count, 4);
        assert_eq!(config.concurrency.queue_size, 100);
        assert_eq!(config.concurrency.message_buffer_size, 50);
        assert_eq!(config.concurrency.rate_limit, 10);
        assert_eq!(config.concurrency.batch_size, 5);
        assert_eq!(config.concurrency.batch_timeout, Duration::from_secs(5));
        assert!(config.concurrency.enable_metrics);
        assert_eq!(config.recovery.max_retries, 3);
        assert_eq!(config.poller.interval, Duration::from_secs(1));
        assert_eq!(config.poller.fetch_limit, 10);
    }

    #[test]
    fn poll_interval_from_env() {
        let config = Config::from_sources(BridgeConfigFile::default(), |k| {
            (k == "SPEAKER_BRIDGE_POLL_INTERVAL_MS").then(|| "250".to_string())
        })
        .unwrap();

        assert_eq!(config.poller.interval, Duration::from_millis(250));
    }

    #[test]
    fn env_overrides_file() {
        let fc = BridgeConfigFile {
            concurrency: ConcurrencyFileConfig {
                worker_count: Some(2),
                rate_limit: Some(7),
                ..ConcurrencyFileConfig::default()
            },
            ..BridgeConfigFile::default()
        };
        let env: HashMap<&str, &str> = HashMap::from([("SPEAKER_BRIDGE_WORKERS", "6")]);

        let config =
            Config::from_sources(fc, |k| env.get(k).map(ToString::to_string)).unwrap();

        assert_eq!(config.concurrency.worker_count, 6);
        assert_eq!(config.concurrency.rate_limit, 7);
    }

    #[test]
    fn malformed_env_is_rejected() {
        let result = Config::from_sources(BridgeConfigFile::default(), |k| {
            (k == "SPEAKER_BRIDGE_QUEUE_SIZE").then(|| "lots".to_string())
        });

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = Config::default();
        config.concurrency.worker_count = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn shrinking_backoff_is_rejected() {
        let mut config = Config::default();
        config.recovery.backoff_factor = 0.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
