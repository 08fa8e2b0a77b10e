// ABOUTME: Step registry, execution context, queue executor, and sub-agent coordinator
// ABOUTME: for the workflow execution engine

pub mod api;
pub mod context;
pub mod error;
pub mod executor;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod subagent;

pub use api::{McpToolRegistry, MetricsSink, PromptTemplateSource, SchemaValidator, WorkflowEngineApi, WorkflowLoader};
pub use context::{ExecutionContext, ExecutionContextManager, FrameType, StackFrame, MAX_FRAME_DEPTH};
pub use error::{ContextError, EngineError, ErrorCode};
pub use executor::{NextStepBatch, QueueExecutor};
pub use processor::{ProcessedStep, ShellCommandSpec, ShellOutcome, StepProcessor};
pub use queue::{ClientQueueEntry, LoopContext, LoopKind, WorkflowQueue};
pub use registry::{Execution, Queuing, StepConfig, StepType};
pub use subagent::{SubAgentManager, SubAgentTaskDescriptor};
