//! # Error Log & Statistics
//!
//! Bounded, append-only record of handled errors for the lifetime of the
//! session. Statistics are recomputed from the entries on every snapshot so
//! counts can never drift from what the log actually holds.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::executor::{ExecutionOutcome, RecoveryStatus};
use crate::types::{ErrorCategory, ErrorRecord, RecoveryAction, Severity};

/// Feedback an end user gave about how an error was handled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFeedback {
    pub helpful: bool,
    pub comment: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// A handled error together with what was done about it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    record: ErrorRecord,
    handled: bool,
    actions_taken: Vec<RecoveryAction>,
    recovery: RecoveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    feedback: Option<UserFeedback>,
}

impl LogEntry {
    pub fn new(record: ErrorRecord, outcome: &ExecutionOutcome) -> Self {
        Self {
            record,
            handled: outcome.success(),
            actions_taken: outcome.actions_taken.clone(),
            recovery: outcome.status,
            feedback: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.record.id()
    }

    pub fn record(&self) -> &ErrorRecord {
        &self.record
    }

    pub fn handled(&self) -> bool {
        self.handled
    }

    pub fn actions_taken(&self) -> &[RecoveryAction] {
        &self.actions_taken
    }

    pub fn recovery(&self) -> RecoveryStatus {
        self.recovery
    }

    pub fn feedback(&self) -> Option<&UserFeedback> {
        self.feedback.as_ref()
    }
}

/// Minimal trace of an error the rate limiter rejected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroppedRecord {
    pub id: Uuid,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl From<&ErrorRecord> for DroppedRecord {
    fn from(record: &ErrorRecord) -> Self {
        Self {
            id: record.id(),
            category: record.category(),
            severity: record.severity(),
            timestamp: record.timestamp(),
        }
    }
}

/// One row of the most-frequent ranking
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopError {
    pub code: String,
    pub message: String,
    pub count: usize,
    pub last_seen: DateTime<Utc>,
}

/// Aggregated view over the log
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Statistics {
    pub total_errors: usize,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub top_errors: Vec<TopError>,
    /// Succeeded / (succeeded + failed); `None` when nothing was resolved
    pub recovery_success_ratio: Option<f64>,
    pub pending_recoveries: usize,
    /// Drops in the window; only the most recent `capacity` drops are kept
    pub dropped_total: usize,
    pub dropped_by_category: BTreeMap<ErrorCategory, usize>,
    /// Every drop since the log was created, ignoring window and capacity
    pub dropped_lifetime: u64,
}

#[derive(Debug, Default)]
struct LogState {
    entries: VecDeque<LogEntry>,
    dropped: VecDeque<DroppedRecord>,
    dropped_lifetime: u64,
}

/// In-memory error log with FIFO eviction
#[derive(Debug)]
pub struct ErrorLog {
    capacity: usize,
    top_n: usize,
    state: RwLock<LogState>,
}

impl ErrorLog {
    /// Creates a log keeping at most `capacity` entries, ranking `top_n` errors
    pub fn new(capacity: usize, top_n: usize) -> Self {
        Self {
            capacity,
            top_n,
            state: RwLock::new(LogState {
                entries: VecDeque::with_capacity(capacity.min(4096)),
                dropped: VecDeque::new(),
                dropped_lifetime: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends an entry, evicting the oldest ones beyond capacity
    pub fn append(&self, entry: LogEntry) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.entries.push_back(entry);

        while state.entries.len() > self.capacity {
            if let Some(evicted) = state.entries.pop_front() {
                debug!(error_id = %evicted.id(), "Evicted oldest log entry");
            }
        }
    }

    /// Counts an error in the rate-limited bucket
    pub fn record_dropped(&self, record: &ErrorRecord) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.dropped.push_back(DroppedRecord::from(record));
        state.dropped_lifetime += 1;

        while state.dropped.len() > self.capacity.max(1) {
            state.dropped.pop_front();
        }
    }

    /// Attaches end-user feedback to an entry. An entry accepts feedback once.
    pub fn record_feedback(
        &self,
        id: Uuid,
        helpful: bool,
        comment: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let entry = state
            .entries
            .iter_mut()
            .rev()
            .find(|entry| entry.id() == id)
            .ok_or(EngineError::EntryNotFound(id))?;

        if entry.feedback.is_some() {
            return Err(EngineError::FeedbackAlreadyRecorded(id));
        }

        entry.feedback = Some(UserFeedback {
            helpful,
            comment,
            submitted_at: Utc::now(),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: Uuid) -> Option<LogEntry> {
        self.read().entries.iter().find(|entry| entry.id() == id).cloned()
    }

    /// Current entries, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.read().entries.iter().cloned().collect()
    }

    /// Total drops since the log was created, including ones no longer retained
    pub fn dropped_lifetime(&self) -> u64 {
        self.read().dropped_lifetime
    }

    /// Serializes the retained entries for an `export` performed by the UI
    pub fn export_json(&self) -> Result<String> {
        let state = self.read();
        let entries: Vec<&LogEntry> = state.entries.iter().collect();
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    /// Statistics over errors no older than `window` (all errors if `None`)
    pub fn snapshot(&self, window: Option<Duration>) -> Statistics {
        self.snapshot_at(Utc::now(), window)
    }

    /// Statistics as of `now`; a pure read of the log
    pub fn snapshot_at(&self, now: DateTime<Utc>, window: Option<Duration>) -> Statistics {
        let cutoff = window
            .and_then(|window| chrono::Duration::from_std(window).ok())
            .and_then(|window| now.checked_sub_signed(window));
        let in_window =
            |timestamp: DateTime<Utc>| cutoff.map_or(true, |cutoff| timestamp >= cutoff);

        let state = self.read();
        let mut stats = Statistics {
            dropped_lifetime: state.dropped_lifetime,
            ..Statistics::default()
        };
        let mut frequency: HashMap<(&str, &str), (usize, DateTime<Utc>)> = HashMap::new();
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        for entry in state.entries.iter().filter(|e| in_window(e.record.timestamp())) {
            let record = &entry.record;
            stats.total_errors += 1;
            *stats.by_category.entry(record.category()).or_insert(0) += 1;
            *stats.by_severity.entry(record.severity()).or_insert(0) += 1;

            let slot = frequency
                .entry((record.class(), record.message()))
                .or_insert((0, record.timestamp()));
            slot.0 += 1;
            slot.1 = slot.1.max(record.timestamp());

            match entry.recovery {
                RecoveryStatus::Succeeded => succeeded += 1,
                RecoveryStatus::Failed => failed += 1,
                RecoveryStatus::Pending => stats.pending_recoveries += 1,
            }
        }

        for dropped in state.dropped.iter().filter(|d| in_window(d.timestamp)) {
            stats.dropped_total += 1;
            *stats.dropped_by_category.entry(dropped.category).or_insert(0) += 1;
        }

        if succeeded + failed > 0 {
            stats.recovery_success_ratio = Some(succeeded as f64 / (succeeded + failed) as f64);
        }

        let mut ranking: Vec<TopError> = frequency
            .into_iter()
            .map(|((code, message), (count, last_seen))| TopError {
                code: code.to_string(),
                message: message.to_string(),
                count,
                last_seen,
            })
            .collect();
        ranking.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
                .then_with(|| a.code.cmp(&b.code))
                .then_with(|| a.message.cmp(&b.message))
        });
        ranking.truncate(self.top_n);
        stats.top_errors = ranking;

        stats
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LogState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}
