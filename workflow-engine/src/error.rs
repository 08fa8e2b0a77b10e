// ABOUTME: Error types for the execution context and the external engine API
// ABOUTME: EngineError carries the {code, message, location} external error envelope

use thiserror::Error;

/// Errors raised by [`crate::context::ExecutionContext`] frame/loop bookkeeping.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("maximum execution frame depth ({0}) exceeded")]
    FrameDepthExceeded(usize),

    #[error("no active loop to signal")]
    NoActiveLoop,

    #[error("execution context '{0}' not found")]
    NotFound(String),
}

/// Error code exposed across the external interface (§6), stable across
/// whatever internal error produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    InvalidInput,
    PermissionDenied,
    VersionConflict,
    OperationFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::VersionConflict => "VERSION_CONFLICT",
            ErrorCode::OperationFailed => "OPERATION_FAILED",
        }
    }
}

/// The engine's single error type, convertible into the external response
/// envelope `{error: {code, message, location?}}`.
#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
    pub location: Option<String>,
}

impl EngineError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            location: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn version_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::VersionConflict, message)
    }

    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::OperationFailed, message)
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl From<workflow_state::StateError> for EngineError {
    fn from(err: workflow_state::StateError) -> Self {
        use workflow_state::StateError as S;
        match &err {
            S::WorkflowNotFound(_) | S::CheckpointMissing(_) => EngineError::not_found(err.to_string()),
            S::PermissionDenied(_) => EngineError::permission_denied(err.to_string()),
            S::VersionConflict { .. } | S::ConflictRejected(_) => {
                EngineError::version_conflict(err.to_string())
            }
            S::InvalidPath(_) | S::NotAnObject(_) | S::InvalidOperation { .. } => {
                EngineError::invalid_input(err.to_string())
            }
            S::CircularDependency(_) | S::ComputedFieldError(_, _) => {
                EngineError::operation_failed(err.to_string())
            }
        }
    }
}

impl From<ContextError> for EngineError {
    fn from(err: ContextError) -> Self {
        match &err {
            ContextError::NotFound(_) => EngineError::not_found(err.to_string()),
            ContextError::FrameDepthExceeded(_) | ContextError::NoActiveLoop => {
                EngineError::operation_failed(err.to_string())
            }
        }
    }
}

impl From<workflow_expr::ExprError> for EngineError {
    fn from(err: workflow_expr::ExprError) -> Self {
        EngineError::operation_failed(err.to_string())
    }
}

impl From<workflow_model::ModelError> for EngineError {
    fn from(err: workflow_model::ModelError) -> Self {
        EngineError::invalid_input(err.to_string())
    }
}
