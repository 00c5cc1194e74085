//! # Structured Logging
//!
//! Installs the `tracing` subscriber for the engine and logs error records at
//! a level derived from their severity.

use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::error::{EngineError, Result};
use crate::sanitization::{sanitize_context, sanitize_message};
use crate::types::{ErrorRecord, Severity};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Keeps the non-blocking file writer flushing for the lifetime of the process
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// Name used for the log file
    pub service_name: String,
    /// Whether to also write logs to a daily rolling file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
    /// Whether to use JSON formatting
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "recovery-engine".to_string(),
            file_output: false,
            log_dir: None,
            json_format: false,
        }
    }
}

/// Initializes the structured logging system. Calling it again is a no-op.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", config.level)));

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
    });
    let text_layer = (!config.json_format).then(|| fmt::layer().with_target(true));

    let file_layer = match (config.file_output, config.log_dir.as_deref()) {
        (true, Some(log_dir)) => {
            let appender =
                tracing_appender::rolling::daily(log_dir, format!("{}.log", config.service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false))
        }
        _ => None,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| EngineError::Logging(format!("failed to set global subscriber: {}", e)))?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Logs a record at the level matching its severity, with sanitized text
pub fn log_record(record: &ErrorRecord) {
    use tracing::{error, info, warn};

    let message = sanitize_message(record.message());
    let context = sanitize_context(record.context());

    match record.severity() {
        Severity::Critical => {
            error!(
                error_id = %record.id(),
                category = %record.category(),
                code = ?record.code(),
                severity = %record.severity(),
                recoverable = record.recoverable(),
                timestamp = %record.timestamp(),
                context = ?context,
                message = %message,
                "Critical error reported"
            );
        }
        Severity::Error => {
            error!(
                error_id = %record.id(),
                category = %record.category(),
                code = ?record.code(),
                severity = %record.severity(),
                message = %message,
                "Error reported"
            );
        }
        Severity::Warning => {
            warn!(
                error_id = %record.id(),
                category = %record.category(),
                code = ?record.code(),
                message = %message,
                "Warning reported"
            );
        }
        Severity::Info => {
            info!(
                error_id = %record.id(),
                category = %record.category(),
                message = %message,
                "Info reported"
            );
        }
    }
}

impl TryFrom<config::Config> for LoggingConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        // Start from defaults and selectively override from the provided config.
        let mut base = LoggingConfig::default();

        if let Ok(level) = cfg.get::<String>("logging.level") {
            base.level = level;
        }
        if let Ok(service_name) = cfg.get::<String>("logging.service_name") {
            base.service_name = service_name;
        }
        if let Ok(file_output) = cfg.get::<bool>("logging.file_output") {
            base.file_output = file_output;
        }
        if let Ok(log_dir) = cfg.get::<String>("logging.log_dir") {
            base.log_dir = Some(log_dir);
        }
        if let Ok(json_format) = cfg.get::<bool>("logging.json_format") {
            base.json_format = json_format;
        }

        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    use crate::types::ErrorInfo;

    #[test]
    fn test_logging_config_from_config() {
        let cfg = config::Config::builder()
            .add_source(File::from_str(
                "[logging]\nlevel = \"debug\"\njson_format = true",
                FileFormat::Toml,
            ))
            .build()
            .unwrap();

        let config = LoggingConfig::try_from(cfg).unwrap();
        assert_eq!(config.level, "debug");
        assert!(config.json_format);
        assert_eq!(config.service_name, "recovery-engine");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_logging(None).unwrap();
        init_logging(None).unwrap();

        let record = ErrorInfo::runtime("password=hunter2 leaked")
            .context("token", "abc")
            .into_record();
        log_record(&record);
    }
}
