//! Error types for semcron.

use serde::{Deserialize, Serialize};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Collection service error: {0}")]
    Collection(#[from] CollectionError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

/// Task registry and dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task not found: {id}")]
    NotFound { id: String },

    #[error("Max concurrent tasks ({max}) reached. Cancel or wait for existing tasks.")]
    MaxConcurrent { max: usize },

    #[error("Unknown task type: \"{kind}\". Available: {available}")]
    UnknownKind { kind: String, available: String },
}

/// Remote collection service errors.
#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("Request failed: {reason}")]
    Request { reason: String },

    #[error("Collection service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response from collection service: {0}")]
    InvalidResponse(String),

    #[error("Research job {id} did not finish within {timeout_secs}s")]
    ResearchTimeout { id: String, timeout_secs: u64 },
}

/// The canonical workflow failure shape, recorded on the task record so a
/// caller polling task status can tell a step-local, retryable issue from an
/// unrecoverable one.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("[{step}] {message}")]
pub struct WorkflowError {
    /// The workflow step at which the failure occurred.
    pub step: String,
    pub message: String,
    /// Whether retrying the run could plausibly succeed.
    pub recoverable: bool,
}

impl WorkflowError {
    /// A deterministic input validation failure, raised before any remote call.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            step: "validate".to_string(),
            message: message.into(),
            recoverable: false,
        }
    }

    /// A non-recoverable failure at a named step.
    pub fn at_step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
            recoverable: false,
        }
    }

    /// A remote-call failure at a named step; retryable by definition.
    pub fn remote(step: impl Into<String>, err: CollectionError) -> Self {
        Self {
            step: step.into(),
            message: err.to_string(),
            recoverable: true,
        }
    }
}

/// Result type alias for semcron.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_error_display_includes_step() {
        let err = WorkflowError::at_step("polling", "collection vanished");
        assert_eq!(err.to_string(), "[polling] collection vanished");
    }

    #[test]
    fn validation_errors_are_not_recoverable() {
        let err = WorkflowError::validation("Maximum 10 lenses allowed");
        assert_eq!(err.step, "validate");
        assert!(!err.recoverable);
    }

    #[test]
    fn remote_errors_are_recoverable() {
        let err = WorkflowError::remote(
            "creating lens",
            CollectionError::Api {
                status: 503,
                message: "overloaded".into(),
            },
        );
        assert!(err.recoverable);
        assert!(err.message.contains("503"));
    }

    #[test]
    fn workflow_error_serde_roundtrip() {
        let err = WorkflowError::validation("bad input");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["step"], "validate");
        assert_eq!(json["recoverable"], false);
        let parsed: WorkflowError = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.message, "bad input");
    }
}
