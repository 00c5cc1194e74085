//! # Error Taxonomy
//!
//! The closed sets the engine classifies failures into (severity, category,
//! recovery action) and the immutable [`ErrorRecord`] built from the
//! [`ErrorInfo`] that collaborators submit.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::EngineError;
use crate::executor::RetryOperation;

/// The severity level of an error, ordered so that `Critical` is highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, nothing is broken
    Info,
    /// Degraded but working
    Warning,
    /// A feature failed
    Error,
    /// The application may not be able to continue
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Critical,
        Severity::Error,
        Severity::Warning,
        Severity::Info,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Error
    }
}

impl FromStr for Severity {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::ALL
            .into_iter()
            .find(|severity| severity.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EngineError::invalid_taxonomy("severity", s))
    }
}

/// The area of the application an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Unexpected exception in application code
    Runtime,
    /// Request failures, timeouts, offline
    Network,
    /// Rejected user input
    Validation,
    /// Browser storage failures and quota problems
    Storage,
    /// Slow renders, long tasks, memory pressure
    Performance,
    /// Missing browser features
    Compatibility,
    /// Blocked or suspicious operations
    Security,
    /// Accessibility violations detected at runtime
    Accessibility,
    /// Component rendering or interaction failures
    Ui,
    /// Exam rules and session logic
    Business,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 10] = [
        ErrorCategory::Runtime,
        ErrorCategory::Network,
        ErrorCategory::Validation,
        ErrorCategory::Storage,
        ErrorCategory::Performance,
        ErrorCategory::Compatibility,
        ErrorCategory::Security,
        ErrorCategory::Accessibility,
        ErrorCategory::Ui,
        ErrorCategory::Business,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::Network => "network",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Performance => "performance",
            ErrorCategory::Compatibility => "compatibility",
            ErrorCategory::Security => "security",
            ErrorCategory::Accessibility => "accessibility",
            ErrorCategory::Ui => "ui",
            ErrorCategory::Business => "business",
        }
    }

    /// Generic user-facing text for records that arrive without a message
    pub fn default_user_message(&self) -> &'static str {
        match self {
            ErrorCategory::Runtime => "Something went wrong. Please try again.",
            ErrorCategory::Network => {
                "We couldn't reach the server. Please check your connection and try again."
            }
            ErrorCategory::Validation => "Some of the information entered is not valid.",
            ErrorCategory::Storage => {
                "Your progress could not be saved. Consider exporting your answers."
            }
            ErrorCategory::Performance => "The application is running slowly.",
            ErrorCategory::Compatibility => "Your browser does not support a required feature.",
            ErrorCategory::Security => "The operation was blocked for security reasons.",
            ErrorCategory::Accessibility => "Part of this page may not be fully accessible.",
            ErrorCategory::Ui => "Part of the page failed to display correctly.",
            ErrorCategory::Business => "The exam could not complete that action.",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCategory::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EngineError::invalid_taxonomy("category", s))
    }
}

/// A remediation verb. Order in a list is a priority hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    Retry,
    Refresh,
    Restart,
    Fallback,
    Contact,
    Ignore,
    Export,
}

impl RecoveryAction {
    pub const ALL: [RecoveryAction; 7] = [
        RecoveryAction::Retry,
        RecoveryAction::Refresh,
        RecoveryAction::Restart,
        RecoveryAction::Fallback,
        RecoveryAction::Contact,
        RecoveryAction::Ignore,
        RecoveryAction::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::Refresh => "refresh",
            RecoveryAction::Restart => "restart",
            RecoveryAction::Fallback => "fallback",
            RecoveryAction::Contact => "contact",
            RecoveryAction::Ignore => "ignore",
            RecoveryAction::Export => "export",
        }
    }

    /// Only `Retry` is carried out by the engine itself
    pub fn is_automatic(&self) -> bool {
        matches!(self, RecoveryAction::Retry)
    }

    /// Actions whose side effect belongs to the collaborator
    pub fn is_requested(&self) -> bool {
        matches!(
            self,
            RecoveryAction::Refresh
                | RecoveryAction::Restart
                | RecoveryAction::Fallback
                | RecoveryAction::Export
        )
    }

    /// `Contact` and `Ignore` are only ever surfaced to the user
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecoveryAction::Contact | RecoveryAction::Ignore)
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryAction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecoveryAction::ALL
            .into_iter()
            .find(|action| action.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EngineError::invalid_taxonomy("recovery action", s))
    }
}

/// Observed connection quality attached to network errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Offline,
    Slow,
    Good,
    #[default]
    Unknown,
}

/// Browser storage area involved in a storage error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Local,
    Session,
    IndexedDb,
    Memory,
}

/// Category-specific payload. The tag is the record's category, so a record
/// always carries exactly one payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "lowercase")]
pub enum CategoryDetails {
    Runtime {
        component: Option<String>,
        stack: Option<String>,
    },
    Network {
        status_code: Option<u16>,
        retry_count: u32,
        network_quality: NetworkQuality,
        url: Option<String>,
    },
    Validation {
        field: Option<String>,
        rule: Option<String>,
    },
    Storage {
        storage_kind: StorageKind,
        quota_exceeded: bool,
        usage_percent: Option<f64>,
    },
    Performance {
        metric: String,
        value: f64,
        threshold: f64,
    },
    Compatibility {
        feature: String,
        user_agent: Option<String>,
    },
    Security {
        violation: String,
    },
    Accessibility {
        criterion: Option<String>,
        element: Option<String>,
    },
    Ui {
        component: Option<String>,
        interaction: Option<String>,
    },
    Business {
        operation: Option<String>,
    },
}

impl CategoryDetails {
    /// An empty payload for the given category
    pub fn empty(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::Runtime => CategoryDetails::Runtime {
                component: None,
                stack: None,
            },
            ErrorCategory::Network => CategoryDetails::Network {
                status_code: None,
                retry_count: 0,
                network_quality: NetworkQuality::Unknown,
                url: None,
            },
            ErrorCategory::Validation => CategoryDetails::Validation {
                field: None,
                rule: None,
            },
            ErrorCategory::Storage => CategoryDetails::Storage {
                storage_kind: StorageKind::Local,
                quota_exceeded: false,
                usage_percent: None,
            },
            ErrorCategory::Performance => CategoryDetails::Performance {
                metric: String::new(),
                value: 0.0,
                threshold: 0.0,
            },
            ErrorCategory::Compatibility => CategoryDetails::Compatibility {
                feature: String::new(),
                user_agent: None,
            },
            ErrorCategory::Security => CategoryDetails::Security {
                violation: String::new(),
            },
            ErrorCategory::Accessibility => CategoryDetails::Accessibility {
                criterion: None,
                element: None,
            },
            ErrorCategory::Ui => CategoryDetails::Ui {
                component: None,
                interaction: None,
            },
            ErrorCategory::Business => CategoryDetails::Business { operation: None },
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CategoryDetails::Runtime { .. } => ErrorCategory::Runtime,
            CategoryDetails::Network { .. } => ErrorCategory::Network,
            CategoryDetails::Validation { .. } => ErrorCategory::Validation,
            CategoryDetails::Storage { .. } => ErrorCategory::Storage,
            CategoryDetails::Performance { .. } => ErrorCategory::Performance,
            CategoryDetails::Compatibility { .. } => ErrorCategory::Compatibility,
            CategoryDetails::Security { .. } => ErrorCategory::Security,
            CategoryDetails::Accessibility { .. } => ErrorCategory::Accessibility,
            CategoryDetails::Ui { .. } => ErrorCategory::Ui,
            CategoryDetails::Business { .. } => ErrorCategory::Business,
        }
    }

    /// Storage usage in percent, if this is a storage payload that reports it
    pub fn storage_usage_percent(&self) -> Option<f64> {
        match self {
            CategoryDetails::Storage {
                usage_percent,
                quota_exceeded,
                ..
            } => usage_percent.or(if *quota_exceeded { Some(100.0) } else { None }),
            _ => None,
        }
    }
}

/// Immutable description of one observed failure.
///
/// Records are only created from an [`ErrorInfo`]; the fields have no
/// setters, so a record cannot change after the handler receives it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    id: Uuid,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    severity: Severity,
    timestamp: DateTime<Utc>,
    recoverable: bool,
    suggested_actions: Vec<RecoveryAction>,
    #[serde(default)]
    context: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    payload: CategoryDetails,
}

impl ErrorRecord {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn category(&self) -> ErrorCategory {
        self.payload.category()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn suggested_actions(&self) -> &[RecoveryAction] {
        &self.suggested_actions
    }

    pub fn context(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.context
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// The error class used for frequency ranking: the code when present,
    /// otherwise the category name
    pub fn class(&self) -> &str {
        self.code.as_deref().unwrap_or_else(|| self.category().as_str())
    }

    pub fn payload(&self) -> &CategoryDetails {
        &self.payload
    }

    /// The message to show the user, falling back to generic category text
    pub fn user_message(&self) -> &str {
        if self.message.trim().is_empty() {
            self.category().default_user_message()
        } else {
            &self.message
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.category(), self.message)?;

        if let Some(code) = &self.code {
            write!(f, " (Code: {})", code)?;
        }

        Ok(())
    }
}

/// The partial error description a collaborator submits to the handler.
///
/// Everything except the category payload and message has a default; the
/// handler fills in the id and timestamp when the record is built.
pub struct ErrorInfo {
    message: String,
    details: Option<String>,
    severity: Severity,
    recoverable: bool,
    suggested_actions: Vec<RecoveryAction>,
    context: serde_json::Map<String, serde_json::Value>,
    code: Option<String>,
    payload: CategoryDetails,
    retry: Option<RetryOperation>,
}

impl ErrorInfo {
    /// Creates error info with the given payload and user-facing message
    pub fn new<S: Into<String>>(payload: CategoryDetails, message: S) -> Self {
        Self {
            message: message.into(),
            details: None,
            severity: Severity::default(),
            recoverable: true,
            suggested_actions: Vec::new(),
            context: serde_json::Map::new(),
            code: None,
            payload,
            retry: None,
        }
    }

    /// Creates error info with an empty payload for `category`
    pub fn for_category<S: Into<String>>(category: ErrorCategory, message: S) -> Self {
        Self::new(CategoryDetails::empty(category), message)
    }

    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::for_category(ErrorCategory::Runtime, message)
    }

    pub fn network<S: Into<String>>(message: S, status_code: Option<u16>) -> Self {
        Self::new(
            CategoryDetails::Network {
                status_code,
                retry_count: 0,
                network_quality: NetworkQuality::Unknown,
                url: None,
            },
            message,
        )
    }

    pub fn storage<S: Into<String>>(
        message: S,
        storage_kind: StorageKind,
        usage_percent: Option<f64>,
    ) -> Self {
        let quota_exceeded = usage_percent.map_or(false, |usage| usage >= 100.0);
        Self::new(
            CategoryDetails::Storage {
                storage_kind,
                quota_exceeded,
                usage_percent,
            },
            message,
        )
    }

    pub fn validation<S: Into<String>>(message: S, field: Option<String>) -> Self {
        Self::new(CategoryDetails::Validation { field, rule: None }, message)
    }

    /// Sets the error severity
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the technical details
    pub fn details<S: Into<String>>(mut self, details: S) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Sets the error code used for ranking
    pub fn code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Marks the error as not recoverable
    pub fn unrecoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }

    /// Appends a suggested action
    pub fn suggest(mut self, action: RecoveryAction) -> Self {
        if !self.suggested_actions.contains(&action) {
            self.suggested_actions.push(action);
        }
        self
    }

    /// Adds context information to the error
    pub fn context<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                self.context.insert(key, value);
            }
            Err(e) => debug!(key = %key, error = %e, "Context value is not serializable, skipped"),
        }
        self
    }

    /// Attaches the operation that `Retry` re-runs
    pub fn retry_with(mut self, operation: RetryOperation) -> Self {
        self.retry = Some(operation);
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.payload.category()
    }

    /// Builds the immutable record, handing back the retry operation
    pub fn into_parts(self) -> (ErrorRecord, Option<RetryOperation>) {
        let record = ErrorRecord {
            id: Uuid::new_v4(),
            message: self.message,
            details: self.details,
            severity: self.severity,
            timestamp: Utc::now(),
            recoverable: self.recoverable,
            suggested_actions: self.suggested_actions,
            context: self.context,
            code: self.code,
            payload: self.payload,
        };
        (record, self.retry)
    }

    pub fn into_record(self) -> ErrorRecord {
        self.into_parts().0
    }
}

impl fmt::Debug for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorInfo")
            .field("message", &self.message)
            .field("severity", &self.severity)
            .field("category", &self.category())
            .field("code", &self.code)
            .field("has_retry", &self.retry.is_some())
            .finish()
    }
}
