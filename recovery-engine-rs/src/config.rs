//! # Handler Configuration
//!
//! Process-wide settings for the error handler, fixed at startup. Values are
//! read with the `config` crate from an optional file and from
//! `RECOVERY_ENGINE__*` environment variables (a `.env` file is honoured).

use std::path::Path;
use std::time::Duration;

use config::{ConfigError, Environment, File};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::strategy::{duration_ms, RecoveryStrategy};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "RECOVERY_ENGINE";

/// Settings owned by the [`ErrorHandler`](crate::handler::ErrorHandler)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Whether handled errors are appended to the log at all
    pub enable_statistics: bool,
    /// Log capacity before FIFO eviction
    pub max_log_entries: usize,
    /// Errors admitted per rolling minute; 0 silences everything
    pub rate_limit_per_minute: usize,
    /// Whether results carry a (sanitized) technical message
    pub show_technical_details: bool,
    /// Whether the executor runs at all
    pub enable_auto_recovery: bool,
    /// Upper bound for a single retry attempt
    #[serde(with = "duration_ms", rename = "network_timeout_ms")]
    pub network_timeout: Duration,
    /// Storage usage that triggers a quota warning
    pub storage_quota_warning_percent: f64,
    /// Length of the most-frequent ranking in snapshots
    pub top_errors_limit: usize,
    /// Strategies to register; the built-in set is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategies: Option<Vec<RecoveryStrategy>>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            enable_statistics: true,
            max_log_entries: 100,
            rate_limit_per_minute: 10,
            show_technical_details: false,
            enable_auto_recovery: true,
            network_timeout: Duration::from_secs(10),
            storage_quota_warning_percent: 80.0,
            top_errors_limit: 5,
            strategies: None,
        }
    }
}

impl HandlerConfig {
    /// Settings used when configuration is missing or unreadable: no
    /// automatic recovery, a small log, generic messages only.
    pub fn conservative() -> Self {
        Self {
            enable_statistics: true,
            max_log_entries: 25,
            rate_limit_per_minute: 10,
            show_technical_details: false,
            enable_auto_recovery: false,
            network_timeout: Duration::from_secs(10),
            storage_quota_warning_percent: 80.0,
            top_errors_limit: 5,
            strategies: None,
        }
    }

    /// Loads configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let cfg = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let config = HandlerConfig::try_from(cfg)?;
        info!(
            max_log_entries = config.max_log_entries,
            rate_limit_per_minute = config.rate_limit_per_minute,
            auto_recovery = config.enable_auto_recovery,
            "Error handler configuration loaded"
        );
        Ok(config)
    }

    /// Like [`load`](Self::load) with a required file, but never fails:
    /// a missing or malformed file yields [`conservative`](Self::conservative)
    pub fn load_or_conservative(path: &Path) -> Self {
        match Self::load(Some(path)) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Falling back to conservative error handler configuration"
                );
                Self::conservative()
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.storage_quota_warning_percent) {
            return Err(ConfigError::Message(format!(
                "storage_quota_warning_percent must be within 0..=100, got {}",
                self.storage_quota_warning_percent
            )));
        }
        if self.network_timeout.is_zero() {
            return Err(ConfigError::Message(
                "network_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reads `key`, treating a missing key as `None` and anything else as an error
fn optional<T: DeserializeOwned>(
    cfg: &config::Config,
    key: &str,
) -> std::result::Result<Option<T>, ConfigError> {
    match cfg.get::<T>(key) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

impl TryFrom<config::Config> for HandlerConfig {
    type Error = ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        // Start from defaults and override whatever the source provides
        let mut base = HandlerConfig::default();

        if let Some(enable_statistics) = optional(&cfg, "error_handler.enable_statistics")? {
            base.enable_statistics = enable_statistics;
        }
        if let Some(max_log_entries) = optional(&cfg, "error_handler.max_log_entries")? {
            base.max_log_entries = max_log_entries;
        }
        if let Some(rate_limit) = optional(&cfg, "error_handler.rate_limit_per_minute")? {
            base.rate_limit_per_minute = rate_limit;
        }
        if let Some(show) = optional(&cfg, "error_handler.show_technical_details")? {
            base.show_technical_details = show;
        }
        if let Some(auto) = optional(&cfg, "error_handler.enable_auto_recovery")? {
            base.enable_auto_recovery = auto;
        }
        if let Some(timeout_ms) = optional::<u64>(&cfg, "error_handler.network_timeout_ms")? {
            base.network_timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(percent) = optional(&cfg, "error_handler.storage_quota_warning_percent")? {
            base.storage_quota_warning_percent = percent;
        }
        if let Some(top) = optional(&cfg, "error_handler.top_errors_limit")? {
            base.top_errors_limit = top;
        }
        if let Some(strategies) = optional(&cfg, "error_handler.strategies")? {
            base.strategies = Some(strategies);
        }

        base.validate()?;
        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use std::io::Write;

    use crate::types::{ErrorCategory, RecoveryAction};

    fn from_toml(toml: &str) -> std::result::Result<HandlerConfig, ConfigError> {
        let cfg = config::Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        HandlerConfig::try_from(cfg)
    }

    #[test]
    fn test_defaults_when_section_missing() {
        let config = from_toml("").unwrap();
        assert_eq!(config, HandlerConfig::default());
    }

    #[test]
    fn test_overrides_and_strategies() {
        let config = from_toml(
            r#"
            [error_handler]
            max_log_entries = 2
            rate_limit_per_minute = 0
            show_technical_details = true
            network_timeout_ms = 2500

            [[error_handler.strategies]]
            name = "network"
            categories = ["network"]
            automatic_actions = ["retry"]
            max_retries = 2
            retry_delay_ms = 100
            use_exponential_backoff = true
            suggested_user_actions = ["retry"]
            "#,
        )
        .unwrap();

        assert_eq!(config.max_log_entries, 2);
        assert_eq!(config.rate_limit_per_minute, 0);
        assert!(config.show_technical_details);
        assert_eq!(config.network_timeout, Duration::from_millis(2500));
        assert!(config.enable_auto_recovery);

        let strategies = config.strategies.unwrap();
        assert_eq!(strategies.len(), 1);
        assert_eq!(strategies[0].categories, vec![ErrorCategory::Network]);
        assert_eq!(strategies[0].automatic_actions, vec![RecoveryAction::Retry]);
        assert_eq!(strategies[0].retry_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_malformed_values_are_errors() {
        assert!(from_toml("[error_handler]\nmax_log_entries = \"lots\"").is_err());
        assert!(from_toml("[error_handler]\nstorage_quota_warning_percent = 140.0").is_err());
        assert!(from_toml("[error_handler]\nnetwork_timeout_ms = 0").is_err());
    }

    #[test]
    fn test_load_or_conservative_falls_back() {
        let missing = Path::new("/nonexistent/recovery-engine.toml");
        assert_eq!(HandlerConfig::load_or_conservative(missing), HandlerConfig::conservative());

        let dir = std::env::temp_dir().join(format!("recovery-engine-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[error_handler]\nrate_limit_per_minute = -3").unwrap();

        let config = HandlerConfig::load_or_conservative(&path);
        assert!(!config.enable_auto_recovery);
        assert_eq!(config.max_log_entries, 25);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
