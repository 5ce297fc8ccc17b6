//! Unified error types for agentflow

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all agentflow operations
#[derive(Error, Debug)]
pub enum FlowError {
    // Submission errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Stage errors
    #[error("Stage '{stage}' failed: {message}")]
    StageFailure { stage: String, message: String },

    #[error("Stage '{stage}' timed out after {timeout_ms}ms")]
    StageTimeout { stage: String, timeout_ms: u64 },

    #[error("Stage function reported: {0}")]
    Stage(String),

    #[error("Run cancelled: {0}")]
    Cancelled(String),

    // Workflow errors
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("No stage function registered for '{0}'")]
    MissingStage(String),

    // Model API errors
    #[error("API error: {0}")]
    Api(String),

    #[error("API limit: {0}")]
    ApiLimit(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Coarse error classification exposed on a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Empty or malformed query, rejected before a run exists
    InvalidInput,
    /// A stage reported an error or timed out
    StageFailure,
    /// The refinement loop hit its bound (informational, never fatal)
    LoopBoundExceeded,
    /// The run was cancelled between stages
    Cancelled,
    /// Anything outside a run's control flow (config, I/O, definitions)
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput => write!(f, "invalid_input"),
            Self::StageFailure => write!(f, "stage_failure"),
            Self::LoopBoundExceeded => write!(f, "loop_bound_exceeded"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

impl FlowError {
    /// Wrap a stage function error with the name of the stage that produced it
    pub fn stage_failure(stage: impl Into<String>, source: FlowError) -> Self {
        match source {
            already @ (FlowError::StageFailure { .. } | FlowError::StageTimeout { .. }) => already,
            other => FlowError::StageFailure {
                stage: stage.into(),
                message: other.to_string(),
            },
        }
    }

    /// Classify this error for run reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::StageFailure { .. }
            | Self::StageTimeout { .. }
            | Self::Stage(_)
            | Self::Api(_)
            | Self::ApiLimit(_)
            | Self::Auth(_) => ErrorKind::StageFailure,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::InvalidDefinition(_)
            | Self::MissingStage(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Other(_) => ErrorKind::Internal,
        }
    }
}

/// Result type alias using FlowError
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failure_wraps_message() {
        let err = FlowError::stage_failure("retrieve", FlowError::Stage("index offline".into()));
        assert_eq!(err.kind(), ErrorKind::StageFailure);
        assert_eq!(err.to_string(), "Stage 'retrieve' failed: Stage function reported: index offline");
    }

    #[test]
    fn test_stage_failure_keeps_timeouts() {
        let timeout = FlowError::StageTimeout {
            stage: "generate".into(),
            timeout_ms: 50,
        };
        let err = FlowError::stage_failure("other", timeout);
        assert!(matches!(err, FlowError::StageTimeout { ref stage, .. } if stage == "generate"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(FlowError::InvalidInput("".into()).kind(), ErrorKind::InvalidInput);
        assert_eq!(FlowError::Cancelled("user".into()).kind(), ErrorKind::Cancelled);
        assert_eq!(FlowError::Api("500".into()).kind(), ErrorKind::StageFailure);
        assert_eq!(FlowError::MissingStage("router".into()).kind(), ErrorKind::Internal);
    }
}
