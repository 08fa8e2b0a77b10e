// ABOUTME: Error types shared by the workflow data model
// ABOUTME: Covers step field validation and computed-field schema validation
//! Error types shared by the workflow data model.

use thiserror::Error;

/// Errors raised while building or validating a [`crate::WorkflowDefinition`].
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("workflow '{name}' has no steps")]
    EmptySteps { name: String },

    #[error("step '{step_id}' is missing required field '{field}' for step type '{step_type}'")]
    MissingField {
        step_id: String,
        step_type: String,
        field: String,
    },

    #[error("step '{step_id}' has unknown field '{field}' for step type '{step_type}'")]
    UnknownField {
        step_id: String,
        step_type: String,
        field: String,
    },

    #[error("unknown step type '{step_type}' for step '{step_id}'")]
    UnknownStepType { step_id: String, step_type: String },

    #[error("computed field definition for '{field}' is invalid: {reason}")]
    InvalidComputedField { field: String, reason: String },
}
