//! TOML configuration file loading
//!
//! Supports `~/.config/omni/speaker-bridge/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct BridgeConfigFile {
    /// Job engine configuration
    #[serde(default)]
    pub concurrency: ConcurrencyFileConfig,

    /// Retry/backoff configuration
    #[serde(default)]
    pub recovery: RecoveryFileConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub breaker: BreakerFileConfig,

    /// Device query polling
    #[serde(default)]
    pub poller: PollerFileConfig,
}

/// Job engine configuration
#[derive(Debug, Default, Deserialize)]
pub struct ConcurrencyFileConfig {
    /// Route queries through the worker pool instead of handling them inline
    pub enabled: Option<bool>,

    /// Number of worker tasks
    pub worker_count: Option<usize>,

    /// Job queue capacity
    pub queue_size: Option<usize>,

    /// Inbound message buffer capacity
    pub message_buffer_size: Option<usize>,

    /// Admissions per second
    pub rate_limit: Option<u32>,

    /// Jobs per batch flush
    pub batch_size: Option<usize>,

    /// Batch timeout in seconds
    pub batch_timeout_seconds: Option<u64>,

    /// Collect and expose job metrics
    pub enable_metrics: Option<bool>,
}

/// Retry/backoff configuration
#[derive(Debug, Default, Deserialize)]
pub struct RecoveryFileConfig {
    pub max_retries: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub enable_panic_recovery: Option<bool>,
}

/// Circuit breaker configuration
#[derive(Debug, Default, Deserialize)]
pub struct BreakerFileConfig {
    pub max_failures: Option<u32>,
    pub reset_time_ms: Option<u64>,
}

/// Device query polling
#[derive(Debug, Default, Deserialize)]
pub struct PollerFileConfig {
    pub interval_ms: Option<u64>,
    pub fetch_limit: Option<usize>,
}

/// Load the TOML config file from the standard path
///
/// Returns `BridgeConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> BridgeConfigFile {
    let Some(path) = config_file_path() else {
        return BridgeConfigFile::default();
    };

    if !path.exists() {
        return BridgeConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            BridgeConfigFile::default()
        }
    }
}

/// Read and parse a config file at an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<BridgeConfigFile> {
    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/omni/speaker-bridge/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("speaker-bridge")
            .join("config.toml")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let content = r"
            [concurrency]
            worker_count = 8
            batch_timeout_seconds = 2

            [breaker]
            max_failures = 5
        ";
        let file: BridgeConfigFile = toml::from_str(content).unwrap();

        assert_eq!(file.concurrency.worker_count, Some(8));
        assert_eq!(file.concurrency.batch_timeout_seconds, Some(2));
        assert_eq!(file.concurrency.queue_size, None);
        assert_eq!(file.breaker.max_failures, Some(5));
        assert!(file.recovery.max_retries.is_none());
    }

    #[test]
    fn parses_poller_section() {
        let file: BridgeConfigFile = toml::from_str("[poller]\ninterval_ms = 500\n").unwrap();
        assert_eq!(file.poller.interval_ms, Some(500));
        assert!(file.poller.fetch_limit.is_none());
    }

    #[test]
    fn empty_file_is_default() {
        let file: BridgeConfigFile = toml::from_str("").unwrap();
        assert!(file.concurrency.enabled.is_none());
    }

    #[test]
    fn rejects_wrong_types() {
        let result: std::result::Result<BridgeConfigFile, _> =
            toml::from_str("[concurrency]\nworker_count = \"many\"");
        assert!(result.is_err());
    }

    #[test]
    fn reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[concurrency]\nrate_limit = 3\n").unwrap();

        let file = read_config_file(&path).unwrap();
        assert_eq!(file.concurrency.rate_limit, Some(3));
    }
}
