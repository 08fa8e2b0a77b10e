// ABOUTME: Error types for state reads, updates, and dependency resolution
// ABOUTME: StateError is returned by both StateManager and ConcurrentStateManager

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("invalid update path: '{0}'")]
    InvalidPath(String),

    #[error("cannot write to read-only scope in path '{0}'")]
    PermissionDenied(String),

    #[error("circular dependency detected: {0}")]
    CircularDependency(String),

    #[error("computation failed for computed field '{0}': {1}")]
    ComputedFieldError(String, #[source] workflow_expr::TransformError),

    #[error("cannot set nested property on non-object at '{0}'")]
    NotAnObject(String),

    #[error("cannot apply operation '{operation}' to field '{field}': {reason}")]
    InvalidOperation {
        field: String,
        operation: String,
        reason: String,
    },

    #[error("expected version {expected}, current version is {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("update conflicts on paths: {0:?}")]
    ConflictRejected(Vec<String>),

    #[error("checkpoint not found for workflow '{0}'")]
    CheckpointMissing(String),
}
