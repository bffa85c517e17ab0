use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::storage::store::StoreError;

/// Task-level failures. Anything that reaches the executor as one of these
/// flips the task to `failed`; per-page and per-record problems never do.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown platform, unknown task type, missing input. Raised before any
    /// browser resource is touched.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Driver launch failure or a browsing context that could not be created
    #[error("browser resource error: {0}")]
    Resource(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("task expired at {0}")]
    Expired(DateTime<Utc>),

    /// The job ran past the worker's time limit
    #[error("job exceeded its time limit of {}s", .0.as_secs())]
    Timeout(Duration),
}

impl EngineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Resource(_) => "resource",
            Self::Persistence(_) => "persistence",
            Self::Expired(_) => "expired",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// Maximum length of a task's stored error message
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Human-readable summary of an error, cut to `MAX_ERROR_MESSAGE_LEN` chars
pub fn summarize_error(error: &EngineError) -> String {
    let message = error.to_string();
    if message.chars().count() <= MAX_ERROR_MESSAGE_LEN {
        return message;
    }

    let mut truncated: String = message.chars().take(MAX_ERROR_MESSAGE_LEN - 3).collect();
    truncated.push_str("...");
    truncated
}
