//! # Engine Errors
//!
//! Failure modes of the engine itself. These are kept narrow: the engine
//! exists to handle the application's errors, so it reports its own problems
//! as values and never panics the caller.

use thiserror::Error;
use uuid::Uuid;

use crate::types::ErrorCategory;

/// A type alias for Result with the error type defaulting to [`EngineError`]
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors produced by the recovery engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// A value outside one of the closed taxonomy sets
    #[error("invalid {kind}: '{value}'")]
    InvalidTaxonomy {
        /// Which set the value was checked against
        kind: &'static str,
        /// The rejected value
        value: String,
    },

    /// Two strategies claim the same category
    #[error("category {category} is claimed by both '{first}' and '{second}'")]
    AmbiguousStrategy {
        category: ErrorCategory,
        first: String,
        second: String,
    },

    /// A strategy with out-of-range settings
    #[error("invalid strategy '{name}': {reason}")]
    InvalidStrategy { name: String, reason: String },

    /// Configuration could not be read or holds invalid values
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// No log entry exists with the given id
    #[error("no log entry with id {0}")]
    EntryNotFound(Uuid),

    /// Feedback may only be attached to an entry once
    #[error("feedback already recorded for entry {0}")]
    FeedbackAlreadyRecorded(Uuid),

    /// The handler was shut down and accepts no further reports
    #[error("error handler has been shut down")]
    ShutDown,

    /// The session ended while recovery was still in progress
    #[error("recovery cancelled for error {0}")]
    Cancelled(Uuid),

    /// JSON encoding failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Logging subsystem could not be installed
    #[error("logging initialization failed: {0}")]
    Logging(String),
}

impl EngineError {
    pub(crate) fn invalid_taxonomy(kind: &'static str, value: impl Into<String>) -> Self {
        EngineError::InvalidTaxonomy {
            kind,
            value: value.into(),
        }
    }

    /// Returns true if the error comes from configuration or strategy setup
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            EngineError::Config(_)
                | EngineError::AmbiguousStrategy { .. }
                | EngineError::InvalidStrategy { .. }
        )
    }
}
