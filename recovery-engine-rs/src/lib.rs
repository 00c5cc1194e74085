//! # Recovery Engine
//!
//! Error classification and recovery for the practice exam application.
//! Failures raised anywhere in the app are reported to a single
//! [`ErrorHandler`], which rate-limits them, picks a recovery strategy by
//! category, runs automatic recovery, and keeps a bounded log for
//! statistics and user feedback.
//!
//! ## Features
//!
//! - Closed error taxonomy with category-specific payloads
//! - Strategy table resolved per category, with a default fallback
//! - Retries with exponential backoff, jitter and per-attempt timeouts
//! - Sliding-window rate limiting of reports
//! - Bounded error log with windowed statistics and feedback
//! - Structured logging and sanitization of technical details
//!
//! ```no_run
//! use recovery_engine_rs::{ErrorHandler, ErrorInfo, HandlerConfig};
//!
//! # async fn run() -> recovery_engine_rs::Result<()> {
//! let handler = ErrorHandler::new(HandlerConfig::default())?;
//! let result = handler
//!     .report(ErrorInfo::network("Could not load question", Some(503)))
//!     .await?;
//! println!("{}", result.user_message);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod error_log;
pub mod executor;
pub mod handler;
pub mod logging;
pub mod monitoring;
pub mod rate_limiter;
pub mod sanitization;
pub mod strategy;
pub mod types;

// Re-export commonly used types
pub use config::HandlerConfig;
pub use error::{EngineError, Result};
pub use error_log::{ErrorLog, LogEntry, Statistics, TopError, UserFeedback};
pub use executor::{ActionSink, RecoveryStatus, RetryOperation};
pub use handler::{ErrorHandler, ErrorHandlerResult};
pub use logging::{init_logging, LoggingConfig};
pub use rate_limiter::RateLimiter;
pub use sanitization::sanitize_message;
pub use strategy::{RecoveryStrategy, StrategyResolver};
pub use types::{
    CategoryDetails, ErrorCategory, ErrorInfo, ErrorRecord, NetworkQuality, RecoveryAction,
    Severity, StorageKind,
};

/// Initializes logging with default settings
pub fn init() -> Result<()> {
    init_logging(None)
}

/// Initializes logging from `config` and returns the handler settings it holds
pub fn init_with_config(config: ::config::Config) -> Result<HandlerConfig> {
    let log_config = LoggingConfig::try_from(config.clone()).ok();
    init_logging(log_config)?;

    Ok(HandlerConfig::try_from(config)?)
}
