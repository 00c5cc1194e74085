//! # Error Handler
//!
//! The single entry point collaborators report failures to. Each report goes
//! through rate limiting, strategy resolution, recovery and logging, and
//! comes back as an [`ErrorHandlerResult`] for the UI to render.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HandlerConfig;
use crate::error::{EngineError, Result};
use crate::error_log::{ErrorLog, LogEntry, Statistics};
use crate::executor::{
    ActionSink, Cancellation, ExecutionOutcome, NoopActionSink, RecoveryExecutor, RecoveryStatus,
};
use crate::logging::log_record;
use crate::monitoring;
use crate::rate_limiter::RateLimiter;
use crate::sanitization::sanitize_message;
use crate::strategy::{RecoveryStrategy, StrategyResolver};
use crate::types::{ErrorInfo, ErrorRecord, RecoveryAction, Severity};

/// Verdict returned for every report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorHandlerResult {
    /// Id of the record; also the log entry id for feedback
    pub error_id: Uuid,
    /// Recovered automatically or handed to the collaborator
    pub handled: bool,
    pub actions_taken: Vec<RecoveryAction>,
    /// The user has to pick one of `suggested_user_actions`
    pub requires_user_action: bool,
    pub suggested_user_actions: Vec<RecoveryAction>,
    pub user_message: String,
    /// Only present when technical details are enabled
    pub technical_message: Option<String>,
    /// False only on the fatal path
    pub should_continue: bool,
    /// The report was dropped by the rate limiter
    pub rate_limited: bool,
}

/// Process-wide error classification and recovery facade
pub struct ErrorHandler {
    config: HandlerConfig,
    limiter: RateLimiter,
    resolver: StrategyResolver,
    executor: RecoveryExecutor,
    log: ErrorLog,
    sink: Arc<dyn ActionSink>,
    shutdown: watch::Sender<bool>,
}

impl ErrorHandler {
    /// Creates a handler, validating the configured strategies
    pub fn new(config: HandlerConfig) -> Result<Self> {
        let resolver = match &config.strategies {
            Some(strategies) => StrategyResolver::new(strategies.clone())?,
            None => StrategyResolver::with_defaults(),
        };
        Ok(Self::with_resolver(config, resolver))
    }

    /// Like [`new`](Self::new) but never refuses to operate: an invalid
    /// configuration is replaced by [`HandlerConfig::conservative`]
    pub fn new_or_conservative(config: HandlerConfig) -> Self {
        match Self::new(config) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(
                    error = %e,
                    "Invalid error handler configuration, using conservative defaults"
                );
                Self::with_resolver(
                    HandlerConfig::conservative(),
                    StrategyResolver::with_defaults(),
                )
            }
        }
    }

    /// Creates a handler with an explicit resolver; `config.strategies` is ignored
    pub fn with_resolver(config: HandlerConfig, resolver: StrategyResolver) -> Self {
        let (shutdown, _) = watch::channel(false);

        debug!(
            max_log_entries = config.max_log_entries,
            rate_limit_per_minute = config.rate_limit_per_minute,
            uncovered = ?resolver.uncovered(),
            "Error handler created"
        );

        Self {
            limiter: RateLimiter::new(config.rate_limit_per_minute),
            executor: RecoveryExecutor::new(config.network_timeout),
            log: ErrorLog::new(config.max_log_entries, config.top_errors_limit),
            resolver,
            config,
            sink: Arc::new(NoopActionSink),
            shutdown,
        }
    }

    /// Registers the collaborator that performs requested actions
    pub fn with_action_sink(mut self, sink: Arc<dyn ActionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn resolver(&self) -> &StrategyResolver {
        &self.resolver
    }

    /// Runs one report through the pipeline.
    ///
    /// Waiting between retries happens inside the returned future, so other
    /// reports are never blocked by it. Fails with [`EngineError::ShutDown`]
    /// after [`shutdown`](Self::shutdown) and with [`EngineError::Cancelled`]
    /// when shutdown interrupts recovery; no log entry is written then.
    pub async fn report(&self, info: ErrorInfo) -> Result<ErrorHandlerResult> {
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }

        let (record, operation) = info.into_parts();

        if !self.limiter.admit() {
            warn!(
                error_id = %record.id(),
                category = %record.category(),
                limit = self.limiter.limit(),
                "Error dropped due to rate limiting"
            );
            monitoring::record_dropped(&record);
            if self.config.enable_statistics {
                self.log.record_dropped(&record);
            }
            return Ok(Self::dropped_result(&record));
        }

        monitoring::record_reported(&record);
        log_record(&record);
        self.check_storage_quota(&record);

        let strategy = self.resolver.resolve(record.category());
        debug!(
            error_id = %record.id(),
            category = %record.category(),
            strategy = %strategy.name,
            "Recovery strategy resolved"
        );

        let start = Instant::now();
        let outcome = if self.config.enable_auto_recovery {
            let executed = self
                .executor
                .execute(
                    &record,
                    strategy,
                    operation.as_ref(),
                    self.sink.as_ref(),
                    &self.cancellation(),
                )
                .await;
            match executed {
                Ok(outcome) => outcome,
                Err(e) => {
                    monitoring::record_cancelled();
                    return Err(e);
                }
            }
        } else {
            ExecutionOutcome::skipped()
        };

        // The session may have ended while the last action was running
        if self.is_shut_down() {
            monitoring::record_cancelled();
            return Err(EngineError::Cancelled(record.id()));
        }

        monitoring::record_recovery(outcome.status, start.elapsed());
        let result = self.build_result(&record, strategy, &outcome);

        if !result.should_continue {
            warn!(
                error_id = %record.id(),
                category = %record.category(),
                "Unrecoverable critical error, application should not continue"
            );
        }

        if self.config.enable_statistics {
            self.log.append(LogEntry::new(record, &outcome));
            monitoring::record_log_size(self.log.len());
        }

        Ok(result)
    }

    /// Spawns the pipeline for `info` as its own task and returns the channel
    /// the result arrives on
    pub fn submit(
        self: &Arc<Self>,
        info: ErrorInfo,
    ) -> oneshot::Receiver<Result<ErrorHandlerResult>> {
        let (sender, receiver) = oneshot::channel();
        let handler = Arc::clone(self);

        tokio::spawn(async move {
            let result = handler.report(info).await;
            // The reporter may have stopped listening
            let _ = sender.send(result);
        });

        receiver
    }

    /// Statistics over the last `window` (everything if `None`)
    pub fn snapshot(&self, window: Option<Duration>) -> Statistics {
        if !self.config.enable_statistics {
            return Statistics::default();
        }
        self.log.snapshot(window)
    }

    /// Attaches user feedback to the log entry of a handled error
    pub fn record_feedback(
        &self,
        entry_id: Uuid,
        helpful: bool,
        comment: Option<String>,
    ) -> Result<()> {
        self.log.record_feedback(entry_id, helpful, comment)?;
        debug!(error_id = %entry_id, helpful, "User feedback recorded");
        Ok(())
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.log.entries()
    }

    /// JSON dump of the log for an `export` performed by the UI
    pub fn export_log(&self) -> Result<String> {
        self.log.export_json()
    }

    /// Ends the session: pending retries are cancelled and nothing further
    /// is logged
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!(entries = self.log.len(), "Error handler shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn cancellation(&self) -> Cancellation {
        Cancellation::new(self.shutdown.subscribe())
    }

    fn check_storage_quota(&self, record: &ErrorRecord) {
        if let Some(usage) = record.payload().storage_usage_percent() {
            if usage >= self.config.storage_quota_warning_percent {
                warn!(
                    error_id = %record.id(),
                    usage_percent = usage,
                    threshold = self.config.storage_quota_warning_percent,
                    "Storage quota warning threshold reached"
                );
                monitoring::record_quota_warning(usage);
            }
        }
    }

    fn build_result(
        &self,
        record: &ErrorRecord,
        strategy: &RecoveryStrategy,
        outcome: &ExecutionOutcome,
    ) -> ErrorHandlerResult {
        let handled = outcome.success();

        let suggested_user_actions = if handled {
            Vec::new()
        } else {
            // The raiser's suggestions come first, then the strategy's
            let mut actions: Vec<RecoveryAction> = Vec::new();
            for action in record
                .suggested_actions()
                .iter()
                .chain(strategy.suggested_user_actions.iter())
            {
                if !actions.contains(action) {
                    actions.push(*action);
                }
            }
            actions
        };

        let requires_user_action = suggested_user_actions
            .iter()
            .any(|action| *action != RecoveryAction::Ignore);

        let should_continue = !(record.severity() == Severity::Critical
            && outcome.status == RecoveryStatus::Failed
            && strategy.fallback.is_none());

        let technical_message = self
            .config
            .show_technical_details
            .then(|| Self::technical_message(record, outcome));

        ErrorHandlerResult {
            error_id: record.id(),
            handled,
            actions_taken: outcome.actions_taken.clone(),
            requires_user_action,
            suggested_user_actions,
            user_message: record.user_message().to_string(),
            technical_message,
            should_continue,
            rate_limited: false,
        }
    }

    fn technical_message(record: &ErrorRecord, outcome: &ExecutionOutcome) -> String {
        let mut message = format!(
            "[{}/{}] {}",
            record.category(),
            record.class(),
            record.message()
        );

        if let Some(details) = record.details() {
            message.push_str(": ");
            message.push_str(details);
        }

        message.push_str(&format!(" (recovery {}", outcome.status));
        if let Some(error) = &outcome.final_error {
            message.push_str(&format!(", last error: {}", error));
        }
        message.push(')');

        sanitize_message(&message)
    }

    fn dropped_result(record: &ErrorRecord) -> ErrorHandlerResult {
        ErrorHandlerResult {
            error_id: record.id(),
            handled: false,
            actions_taken: Vec::new(),
            requires_user_action: false,
            suggested_user_actions: Vec::new(),
            user_message: record.user_message().to_string(),
            technical_message: None,
            should_continue: true,
            rate_limited: true,
        }
    }
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("config", &self.config)
            .field("log_entries", &self.log.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Drop for ErrorHandler {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
