//! Stage failures: errors raised by processing collaborators.
//!
//! A `StageFailure` never propagates as a process-level error. The pipeline
//! turns it into data (`PipelineResult::error` / `stage_errors`) before it can
//! escape the worker loop.

use serde::{Deserialize, Serialize};

/// Operational classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network hiccup, rate limit, 5xx. Worth an operator reset later.
    Transient,

    /// Bad input, 4xx, unparsable document. Resetting will not help.
    Permanent,

    /// The stage did not finish within its time budget.
    Timeout,

    /// The stage panicked; captured at the worker loop boundary.
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Panicked, message)
    }
}
