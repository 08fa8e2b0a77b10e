// ABOUTME: Three-tier reactive state manager and concurrent state coordination
// ABOUTME: for the workflow execution engine

pub mod concurrent;
pub mod deps;
pub mod error;
pub mod manager;
pub mod update;

pub use concurrent::{
    BatchUpdate, Checkpoint, ConcurrencyStats, ConcurrentStateManager, ConflictResolution,
    ConflictStrategy, MergePolicy, StateVersion, UpdateResult,
};
pub use deps::{DependencyIndex, ResolvedField};
pub use error::StateError;
pub use manager::{StateManager, WorkflowState};
pub use update::{StateUpdate, UpdateOperation};
