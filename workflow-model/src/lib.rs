// ABOUTME: Data model crate for the workflow execution engine
// ABOUTME: Defines workflow/step/instance/schema types with no execution logic
//! Data model for the workflow execution engine: workflow definitions, steps,
//! running instances, and the per-tier state schema they declare.
//!
//! This crate has no execution logic — it is the shape the rest of the
//! engine (`workflow-state`, `workflow-expr`, `workflow-engine`) operates on.

pub mod definition;
pub mod error;
pub mod instance;
pub mod schema;
pub mod step;

pub use definition::{SubAgentTask, WorkflowDefinition};
pub use error::ModelError;
pub use instance::{StepExecution, StepStatus, WorkflowInstance, WorkflowStatus};
pub use schema::{ComputedFieldDefinition, InputDefinition, OnError, StateSchema};
pub use step::{ExecutionContextHint, WorkflowStep};
