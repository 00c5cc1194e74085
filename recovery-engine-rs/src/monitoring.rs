//! Metrics emitted by the engine.
//!
//! Only the `metrics` facade is used here; installing an exporter is left to
//! the embedding application.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::executor::RecoveryStatus;
use crate::types::{ErrorCategory, ErrorRecord};

/// Counts an error that passed the rate limiter
pub fn record_reported(record: &ErrorRecord) {
    counter!(
        "recovery_engine.errors.reported",
        1,
        "category" => record.category().as_str(),
        "severity" => record.severity().as_str()
    );
}

/// Counts an error dropped by the rate limiter
pub fn record_dropped(record: &ErrorRecord) {
    counter!(
        "recovery_engine.errors.dropped",
        1,
        "category" => record.category().as_str()
    );
}

/// Counts a single retry attempt
pub fn record_attempt(category: ErrorCategory, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!(
        "recovery_engine.retry.attempts",
        1,
        "category" => category.as_str(),
        "outcome" => outcome
    );
}

/// Records how a recovery ended and how long it took
pub fn record_recovery(status: RecoveryStatus, duration: Duration) {
    match status {
        RecoveryStatus::Succeeded => counter!("recovery_engine.recovery.succeeded", 1),
        RecoveryStatus::Failed => counter!("recovery_engine.recovery.failed", 1),
        RecoveryStatus::Pending => counter!("recovery_engine.recovery.pending", 1),
    }
    histogram!("recovery_engine.recovery.duration_ms", duration.as_millis() as f64);
}

pub fn record_cancelled() {
    counter!("recovery_engine.recovery.cancelled", 1);
}

pub fn record_quota_warning(usage_percent: f64) {
    counter!("recovery_engine.storage.quota_warning", 1);
    gauge!("recovery_engine.storage.usage_percent", usage_percent);
}

pub fn record_log_size(entries: usize) {
    gauge!("recovery_engine.log.entries", entries as f64);
}
