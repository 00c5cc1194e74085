//! # Recovery Execution
//!
//! Runs a strategy's automatic actions for one error record. `Retry` re-runs
//! the operation the collaborator attached to the report, with fixed or
//! exponential backoff between attempts. Every other action is *requested*
//! from the collaborator through an [`ActionSink`]; the engine never performs
//! a refresh, restart or export itself.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::error::{EngineError, Result};
use crate::monitoring;
use crate::strategy::RecoveryStrategy;
use crate::types::{ErrorRecord, RecoveryAction};

/// Future returned by a [`RetryOperation`]
pub type RetryFuture = BoxFuture<'static, anyhow::Result<()>>;

/// The failed operation a collaborator hands over so `Retry` can re-run it
#[derive(Clone)]
pub struct RetryOperation(Arc<dyn Fn() -> RetryFuture + Send + Sync>);

impl RetryOperation {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Arc::new(move || f().boxed()))
    }

    fn call(&self) -> RetryFuture {
        (self.0)()
    }
}

impl fmt::Debug for RetryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryOperation")
    }
}

/// Receives the actions whose side effects live in the UI layer.
///
/// `request` returns true when the collaborator accepted the action and will
/// carry it out.
pub trait ActionSink: Send + Sync {
    fn request(&self, action: RecoveryAction, record: &ErrorRecord) -> bool;
}

/// Sink that declines every request
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopActionSink;

impl ActionSink for NoopActionSink {
    fn request(&self, action: RecoveryAction, record: &ErrorRecord) -> bool {
        trace!(action = %action, error_id = %record.id(), "No action sink registered, declining");
        false
    }
}

impl<F> ActionSink for F
where
    F: Fn(RecoveryAction, &ErrorRecord) -> bool + Send + Sync,
{
    fn request(&self, action: RecoveryAction, record: &ErrorRecord) -> bool {
        self(action, record)
    }
}

/// Outcome of recovery as stored on a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStatus {
    /// An automatic retry succeeded
    Succeeded,
    /// Nothing resolved the error
    Failed,
    /// The collaborator accepted a requested action; the result is not known yet
    Pending,
}

impl fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryStatus::Succeeded => write!(f, "succeeded"),
            RecoveryStatus::Failed => write!(f, "failed"),
            RecoveryStatus::Pending => write!(f, "pending"),
        }
    }
}

/// What the executor did for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Every attempted or requested action, in order
    pub actions_taken: Vec<RecoveryAction>,
    pub status: RecoveryStatus,
    /// Description of the last failure, if recovery did not succeed
    pub final_error: Option<String>,
}

impl ExecutionOutcome {
    /// Outcome when automatic recovery is not attempted at all
    pub fn skipped() -> Self {
        Self {
            actions_taken: Vec::new(),
            status: RecoveryStatus::Failed,
            final_error: None,
        }
    }

    /// True when the error was recovered or handed to the collaborator
    pub fn success(&self) -> bool {
        matches!(self.status, RecoveryStatus::Succeeded | RecoveryStatus::Pending)
    }
}

/// Session-end signal observed by pending recoveries
#[derive(Debug, Clone)]
pub struct Cancellation {
    receiver: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn new(receiver: watch::Receiver<bool>) -> Self {
        Self { receiver }
    }

    /// A signal that never fires
    pub fn never() -> Self {
        let (_sender, receiver) = watch::channel(false);
        Self { receiver }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation is signalled
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                // Sender gone without signalling: nothing can cancel us anymore
                futures::future::pending::<()>().await;
            }
        }
    }
}

enum RetryRun {
    Recovered,
    Exhausted(Option<String>),
}

/// Executes recovery strategies
#[derive(Debug, Clone)]
pub struct RecoveryExecutor {
    /// Upper bound for a single retry attempt
    attempt_timeout: Duration,
}

impl RecoveryExecutor {
    pub fn new(attempt_timeout: Duration) -> Self {
        Self { attempt_timeout }
    }

    /// Runs `strategy` for `record`.
    ///
    /// Returns [`EngineError::Cancelled`] if `cancel` fires before the
    /// sequence finishes; nothing further is attempted in that case.
    pub async fn execute(
        &self,
        record: &ErrorRecord,
        strategy: &RecoveryStrategy,
        operation: Option<&RetryOperation>,
        sink: &dyn ActionSink,
        cancel: &Cancellation,
    ) -> Result<ExecutionOutcome> {
        let start = Instant::now();
        let mut actions_taken = Vec::new();
        let mut last_error: Option<String> = None;

        if strategy.allows_automation() {
            for action in &strategy.automatic_actions {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled(record.id()));
                }

                match action {
                    RecoveryAction::Retry => {
                        let operation = match operation {
                            Some(operation) => operation,
                            None => {
                                debug!(
                                    error_id = %record.id(),
                                    strategy = %strategy.name,
                                    "No retry operation attached, skipping retry"
                                );
                                continue;
                            }
                        };

                        match self
                            .retry(record, strategy, operation, &mut actions_taken, cancel)
                            .await?
                        {
                            RetryRun::Recovered => {
                                info!(
                                    error_id = %record.id(),
                                    attempts = actions_taken.len(),
                                    duration_ms = %start.elapsed().as_millis(),
                                    "Error recovered by retry"
                                );
                                return Ok(ExecutionOutcome {
                                    actions_taken,
                                    status: RecoveryStatus::Succeeded,
                                    final_error: None,
                                });
                            }
                            RetryRun::Exhausted(error) => {
                                if error.is_some() {
                                    last_error = error;
                                }
                            }
                        }
                    }
                    RecoveryAction::Contact | RecoveryAction::Ignore => {
                        trace!(action = %action, "Suggestion-only action skipped");
                    }
                    RecoveryAction::Refresh
                    | RecoveryAction::Restart
                    | RecoveryAction::Fallback
                    | RecoveryAction::Export => {
                        actions_taken.push(*action);
                        if request_action(sink, *action, record) {
                            debug!(
                                error_id = %record.id(),
                                action = %action,
                                "Recovery action accepted by collaborator"
                            );
                            return Ok(ExecutionOutcome {
                                actions_taken,
                                status: RecoveryStatus::Pending,
                                final_error: None,
                            });
                        }
                        last_error = Some(format!("{} request was declined", action));
                    }
                }
            }
        }

        if let Some(fallback) = strategy.fallback {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled(record.id()));
            }
            actions_taken.push(fallback);
            let accepted = request_action(sink, fallback, record);
            debug!(
                error_id = %record.id(),
                action = %fallback,
                accepted,
                "Fallback requested"
            );
        }

        if !actions_taken.is_empty() {
            warn!(
                error_id = %record.id(),
                strategy = %strategy.name,
                actions = ?actions_taken,
                error = ?last_error,
                "Automatic recovery failed"
            );
        }

        Ok(ExecutionOutcome {
            actions_taken,
            status: RecoveryStatus::Failed,
            final_error: last_error,
        })
    }

    async fn retry(
        &self,
        record: &ErrorRecord,
        strategy: &RecoveryStrategy,
        operation: &RetryOperation,
        actions_taken: &mut Vec<RecoveryAction>,
        cancel: &Cancellation,
    ) -> Result<RetryRun> {
        let mut last_error = None;

        for attempt in 0..strategy.max_retries {
            let delay = self.backoff(strategy, attempt);

            debug!(
                error_id = %record.id(),
                attempt = attempt + 1,
                max_retries = strategy.max_retries,
                backoff_ms = %delay.as_millis(),
                "Scheduling retry"
            );

            if !delay.is_zero() {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        debug!(error_id = %record.id(), "Retry cancelled while waiting");
                        return Err(EngineError::Cancelled(record.id()));
                    }
                }
            }
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled(record.id()));
            }

            actions_taken.push(RecoveryAction::Retry);

            match self.attempt(operation).await {
                Ok(()) => {
                    monitoring::record_attempt(record.category(), true);
                    return Ok(RetryRun::Recovered);
                }
                Err(error) => {
                    monitoring::record_attempt(record.category(), false);
                    debug!(
                        error_id = %record.id(),
                        attempt = attempt + 1,
                        error = %error,
                        "Retry attempt failed"
                    );
                    last_error = Some(error);
                }
            }
        }

        Ok(RetryRun::Exhausted(last_error))
    }

    /// Runs one attempt; errors, panics and timeouts all count as failure
    async fn attempt(&self, operation: &RetryOperation) -> std::result::Result<(), String> {
        // The closure itself may panic before handing back a future
        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| operation.call())) {
            Ok(future) => future,
            Err(_panic) => return Err("retry operation panicked".to_string()),
        };
        let run = AssertUnwindSafe(future).catch_unwind();

        match timeout(self.attempt_timeout, run).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(error))) => Err(format!("{:#}", error)),
            Ok(Err(_panic)) => Err("retry operation panicked".to_string()),
            Err(_) => Err(format!(
                "retry operation timed out after {}ms",
                self.attempt_timeout.as_millis()
            )),
        }
    }

    /// Backoff for `attempt` with the strategy's jitter applied
    fn backoff(&self, strategy: &RecoveryStrategy, attempt: u32) -> Duration {
        let delay = strategy.delay_for_attempt(attempt);
        if strategy.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let delay_ms = delay.as_millis() as f64;
        let jitter_range = delay_ms * strategy.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);

        let jittered = Duration::from_millis((delay_ms + jitter).max(0.0) as u64);
        jittered.min(strategy.max_delay)
    }
}

impl Default for RecoveryExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// Asks the collaborator for `action`; a panicking sink counts as a decline
fn request_action(sink: &dyn ActionSink, action: RecoveryAction, record: &ErrorRecord) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| sink.request(action, record))) {
        Ok(accepted) => accepted,
        Err(_panic) => {
            warn!(
                error_id = %record.id(),
                action = %action,
                "Action sink panicked, treating the request as declined"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use crate::types::{ErrorCategory, ErrorInfo, Severity};

    struct RecordingSink {
        accept: bool,
        requested: Mutex<Vec<RecoveryAction>>,
    }

    impl RecordingSink {
        fn new(accept: bool) -> Self {
            Self {
                accept,
                requested: Mutex::new(Vec::new()),
            }
        }

        fn requested(&self) -> Vec<RecoveryAction> {
            self.requested.lock().unwrap().clone()
        }
    }

    impl ActionSink for RecordingSink {
        fn request(&self, action: RecoveryAction, _record: &ErrorRecord) -> bool {
            self.requested.lock().unwrap().push(action);
            self.accept
        }
    }

    fn network_strategy(max_retries: u32) -> RecoveryStrategy {
        RecoveryStrategy::new("network", [ErrorCategory::Network])
            .automatic([RecoveryAction::Retry])
            .retries(max_retries, Duration::from_millis(1))
            .exponential(Duration::from_millis(10))
    }

    fn failing_until(success_on: u32, counter: Arc<AtomicU32>) -> RetryOperation {
        RetryOperation::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < success_on {
                    anyhow::bail!("attempt {} failed", attempt)
                }
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_retry_success_after_failure() {
        let executor = RecoveryExecutor::default();
        let record = ErrorInfo::network("Request failed", Some(503)).into_record();
        let counter = Arc::new(AtomicU32::new(0));
        let operation = failing_until(2, Arc::clone(&counter));

        let outcome = executor
            .execute(
                &record,
                &network_strategy(2),
                Some(&operation),
                &NoopActionSink,
                &Cancellation::never(),
            )
            .await
            .unwrap();

        assert!(outcome.success());
        assert_eq!(outcome.status, RecoveryStatus::Succeeded);
        assert_eq!(outcome.actions_taken, vec![RecoveryAction::Retry, RecoveryAction::Retry]);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_request_fallback() {
        let executor = RecoveryExecutor::default();
        let record = ErrorInfo::network("Request failed", None).into_record();
        let counter = Arc::new(AtomicU32::new(0));
        let operation = failing_until(u32::MAX, Arc::clone(&counter));
        let sink = RecordingSink::new(true);
        let strategy = network_strategy(3).fallback(RecoveryAction::Refresh);

        let outcome = executor
            .execute(&record, &strategy, Some(&operation), &sink, &Cancellation::never())
            .await
            .unwrap();

        assert!(!outcome.success());
        assert_eq!(
            outcome.actions_taken,
            vec![
                RecoveryAction::Retry,
                RecoveryAction::Retry,
                RecoveryAction::Retry,
                RecoveryAction::Refresh,
            ]
        );
        assert_eq!(sink.requested(), vec![RecoveryAction::Refresh]);
        assert_eq!(outcome.final_error.as_deref(), Some("attempt 3 failed"));
    }

    #[tokio::test]
    async fn test_zero_retries_attempts_nothing() {
        let executor = RecoveryExecutor::default();
        let record = ErrorInfo::runtime("Crash").severity(Severity::Critical).into_record();
        let counter = Arc::new(AtomicU32::new(0));
        let operation = failing_until(1, Arc::clone(&counter));
        let sink = RecordingSink::new(true);
        let strategy = RecoveryStrategy::new("runtime", [ErrorCategory::Runtime])
            .automatic([RecoveryAction::Retry, RecoveryAction::Refresh]);

        let outcome = executor
            .execute(&record, &strategy, Some(&operation), &sink, &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(outcome.status, RecoveryStatus::Failed);
        assert!(outcome.actions_taken.is_empty());
        assert!(sink.requested().is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_requested_action_accepted_is_pending() {
        let executor = RecoveryExecutor::default();
        let record = ErrorInfo::for_category(ErrorCategory::Ui, "Widget crashed").into_record();
        let sink = RecordingSink::new(true);
        let strategy = RecoveryStrategy::new("ui", [ErrorCategory::Ui])
            .automatic([RecoveryAction::Ignore, RecoveryAction::Refresh, RecoveryAction::Restart])
            .retries(1, Duration::ZERO);

        let outcome = executor
            .execute(&record, &strategy, None, &sink, &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(outcome.status, RecoveryStatus::Pending);
        assert!(outcome.success());
        assert_eq!(outcome.actions_taken, vec![RecoveryAction::Refresh]);
        assert_eq!(sink.requested(), vec![RecoveryAction::Refresh]);
    }

    #[tokio::test]
    async fn test_declined_request_moves_to_next_action() {
        let executor = RecoveryExecutor::default();
        let record = ErrorInfo::for_category(ErrorCategory::Ui, "Widget crashed").into_record();
        let sink = RecordingSink::new(false);
        let strategy = RecoveryStrategy::new("ui", [ErrorCategory::Ui])
            .automatic([RecoveryAction::Refresh, RecoveryAction::Restart])
            .retries(1, Duration::ZERO);

        let outcome = executor
            .execute(&record, &strategy, None, &sink, &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(outcome.status, RecoveryStatus::Failed);
        assert_eq!(
            outcome.actions_taken,
            vec![RecoveryAction::Refresh, RecoveryAction::Restart]
        );
        assert_eq!(outcome.final_error.as_deref(), Some("restart request was declined"));
    }

    #[tokio::test]
    async fn test_panicking_operation_counts_as_failure() {
        let executor = RecoveryExecutor::default();
        let record = ErrorInfo::network("Request failed", None).into_record();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        let operation = RetryOperation::new(move || {
            let counter = Arc::clone(&counter_clone);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("boom");
                }
                Ok(())
            }
        });

        let outcome = executor
            .execute(
                &record,
                &network_strategy(2),
                Some(&operation),
                &NoopActionSink,
                &Cancellation::never(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, RecoveryStatus::Succeeded);
        assert_eq!(outcome.actions_taken.len(), 2);
    }

    #[tokio::test]
    async fn test_operation_panicking_before_its_future_counts_as_failure() {
        let executor = RecoveryExecutor::default();
        let record = ErrorInfo::network("Request failed", None).into_record();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        let operation = RetryOperation::new(move || {
            if counter_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("could not build request");
            }
            async { Ok::<(), anyhow::Error>(()) }
        });

        let outcome = executor
            .execute(
                &record,
                &network_strategy(2),
                Some(&operation),
                &NoopActionSink,
                &Cancellation::never(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, RecoveryStatus::Succeeded);
        assert_eq!(outcome.actions_taken.len(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_sink_declines() {
        let executor = RecoveryExecutor::default();
        let record =
            ErrorInfo::for_category(ErrorCategory::Ui, "Timer widget crashed").into_record();
        let strategy = RecoveryStrategy::new("ui", [ErrorCategory::Ui])
            .automatic([RecoveryAction::Retry, RecoveryAction::Refresh])
            .retries(2, Duration::from_millis(1))
            .fallback(RecoveryAction::Export);
        let sink = |_action: RecoveryAction, _record: &ErrorRecord| -> bool {
            panic!("sink failed");
        };

        let outcome = executor
            .execute(&record, &strategy, None, &sink, &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(outcome.status, RecoveryStatus::Failed);
        assert_eq!(
            outcome.actions_taken,
            vec![RecoveryAction::Refresh, RecoveryAction::Export]
        );
        assert_eq!(outcome.final_error.as_deref(), Some("refresh request was declined"));
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let executor = RecoveryExecutor::new(Duration::from_millis(20));
        let record = ErrorInfo::network("Request failed", None).into_record();
        let operation = RetryOperation::new(|| async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        });

        let outcome = executor
            .execute(
                &record,
                &network_strategy(1),
                Some(&operation),
                &NoopActionSink,
                &Cancellation::never(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, RecoveryStatus::Failed);
        assert!(outcome.final_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_operation_skips_retry() {
        let executor = RecoveryExecutor::default();
        let record = ErrorInfo::network("Request failed", None).into_record();

        let outcome = executor
            .execute(
                &record,
                &network_strategy(3),
                None,
                &NoopActionSink,
                &Cancellation::never(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, ExecutionOutcome::skipped());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let executor = RecoveryExecutor::default();
        let record = ErrorInfo::network("Request failed", None).into_record();
        let counter = Arc::new(AtomicU32::new(0));
        let operation = failing_until(1, Arc::clone(&counter));
        let strategy = RecoveryStrategy::new("slow", [ErrorCategory::Network])
            .automatic([RecoveryAction::Retry])
            .retries(3, Duration::from_secs(30));

        let (sender, receiver) = watch::channel(false);
        let cancel = Cancellation::new(receiver);

        let task = {
            let record = record.clone();
            tokio::spawn(async move {
                executor
                    .execute(&record, &strategy, Some(&operation), &NoopActionSink, &cancel)
                    .await
            })
        };

        sleep(Duration::from_millis(20)).await;
        sender.send_replace(true);

        let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled(id)) if id == record.id()));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let executor = RecoveryExecutor::default();
        let strategy = RecoveryStrategy::new("net", [ErrorCategory::Network])
            .retries(3, Duration::from_millis(100))
            .jitter(0.2);

        for _ in 0..100 {
            let delay = executor.backoff(&strategy, 0);
            assert!(delay >= Duration::from_millis(80));
            assert!(delay <= Duration::from_millis(120));
        }
    }
}
