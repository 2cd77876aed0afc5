//! Outcome model: what a handler reports and what the dispatcher decides.
//!
//! Two layers on purpose:
//! - [`HandlerOutcome`] is the handler's own verdict on one attempt.
//! - [`DispatchOutcome`] is the dispatcher's decision after applying the
//!   retry budget. Only this one reaches the worker loop.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerOutcome {
    Success,
    /// Transient failure, worth another attempt.
    RetryableError(String),
    /// Retrying cannot help.
    PermanentError(String),
}

impl HandlerOutcome {
    pub fn success() -> Self {
        Self::Success
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Self::RetryableError(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentError(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl<E: fmt::Display> From<Result<(), E>> for HandlerOutcome {
    /// `Err` maps to a retryable error.
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => Self::RetryableError(e.to_string()),
        }
    }
}

/// The next action for a dispatched task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Done; remove the task.
    Ack,

    /// Put the task back after `delay`.
    RetryWithBackoff { delay: Duration, reason: String },

    /// Give up; archive the task.
    PermanentFail { reason: String },
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::RetryWithBackoff { .. } => "retry",
            Self::PermanentFail { .. } => "permanent_fail",
        }
    }
}
