// ABOUTME: Compile-time step type registry: execution/queuing class and field contract per step type
// ABOUTME: A match-based table instead of a runtime HashMap, so adding a step type is a compile error

//! Step type registry.
//!
//! `original_source/.../workflow/step_registry.py` keeps `STEP_TYPES` as a
//! runtime `dict[str, StepConfig]`. Here the same table is a `match` over a
//! closed [`StepType`] enum: every call site that dispatches on step type is
//! forced by the compiler to handle every variant, so a new step type can't
//! silently fall through an `if`/`elif` chain the way the Python registry
//! would let it.

use crate::error::EngineError;
use workflow_model::WorkflowStep;

/// Whether a step is resolved by the server or handed to the client (the
/// external agent) for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    Server,
    Client,
}

/// How a step participates in queue draining.
///
/// - `Batch` — client step that can be queued alongside others before
///   yielding control back to the caller.
/// - `Blocking` — client step that stops the batch; the caller must resolve
///   it via `step_complete` before more steps are drained.
/// - `Immediate` — server step resolved synchronously in place.
/// - `Expand` — server step that replaces itself with other steps
///   (conditional/loop) rather than producing a result of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queuing {
    Batch,
    Blocking,
    Immediate,
    Expand,
}

/// The fifteen step types a workflow can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepType {
    UserMessage,
    McpCall,
    UserInput,
    ParallelForeach,
    AgentShellCommand,
    InternalMcpCall,
    ConditionalMessage,
    ShellCommand,
    StateUpdate,
    BatchStateUpdate,
    Conditional,
    WhileLoop,
    Foreach,
    Break,
    Continue,
}

#[derive(Debug, Clone, Copy)]
pub struct StepConfig {
    pub execution: Execution,
    pub queuing: Queuing,
    pub description: &'static str,
    pub supports_state_update: bool,
    pub required_fields: &'static [&'static str],
    pub optional_fields: &'static [&'static str],
}

impl StepType {
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "user_message" => StepType::UserMessage,
            "mcp_call" => StepType::McpCall,
            "user_input" => StepType::UserInput,
            "parallel_foreach" => StepType::ParallelForeach,
            "agent_shell_command" => StepType::AgentShellCommand,
            "internal_mcp_call" => StepType::InternalMcpCall,
            "conditional_message" => StepType::ConditionalMessage,
            "shell_command" => StepType::ShellCommand,
            "state_update" => StepType::StateUpdate,
            "batch_state_update" => StepType::BatchStateUpdate,
            "conditional" => StepType::Conditional,
            "while_loop" => StepType::WhileLoop,
            "foreach" => StepType::Foreach,
            "break" => StepType::Break,
            "continue" => StepType::Continue,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::UserMessage => "user_message",
            StepType::McpCall => "mcp_call",
            StepType::UserInput => "user_input",
            StepType::ParallelForeach => "parallel_foreach",
            StepType::AgentShellCommand => "agent_shell_command",
            StepType::InternalMcpCall => "internal_mcp_call",
            StepType::ConditionalMessage => "conditional_message",
            StepType::ShellCommand => "shell_command",
            StepType::StateUpdate => "state_update",
            StepType::BatchStateUpdate => "batch_state_update",
            StepType::Conditional => "conditional",
            StepType::WhileLoop => "while_loop",
            StepType::Foreach => "foreach",
            StepType::Break => "break",
            StepType::Continue => "continue",
        }
    }

    pub fn config(&self) -> StepConfig {
        use Execution::*;
        use Queuing::*;
        match self {
            StepType::UserMessage => StepConfig {
                execution: Client,
                queuing: Batch,
                description: "Display a message to the agent",
                supports_state_update: false,
                required_fields: &["message"],
                optional_fields: &[],
            },
            StepType::McpCall => StepConfig {
                execution: Client,
                queuing: Blocking,
                description: "Invoke an MCP tool and wait for the result",
                supports_state_update: true,
                required_fields: &["tool"],
                optional_fields: &["parameters", "state_update"],
            },
            StepType::UserInput => StepConfig {
                execution: Client,
                queuing: Blocking,
                description: "Prompt the agent for input and wait for it",
                supports_state_update: true,
                required_fields: &["prompt"],
                optional_fields: &["state_update", "validation"],
            },
            StepType::ParallelForeach => StepConfig {
                execution: Client,
                queuing: Blocking,
                description: "Fan an item list out to sub-agent tasks",
                supports_state_update: false,
                required_fields: &["items", "sub_agent_task"],
                optional_fields: &["max_parallel", "wait_for_all"],
            },
            StepType::AgentShellCommand => StepConfig {
                execution: Client,
                queuing: Blocking,
                description: "Ask the agent to run a shell command itself",
                supports_state_update: true,
                required_fields: &["command"],
                optional_fields: &["state_update", "working_directory"],
            },
            StepType::InternalMcpCall => StepConfig {
                execution: Client,
                queuing: Blocking,
                description: "Invoke an internal MCP tool and wait for the result",
                supports_state_update: true,
                required_fields: &["tool"],
                optional_fields: &["parameters", "state_update"],
            },
            StepType::ConditionalMessage => StepConfig {
                execution: Client,
                queuing: Batch,
                description: "Display a message chosen by a condition",
                supports_state_update: false,
                required_fields: &["condition", "if_true", "if_false"],
                optional_fields: &[],
            },
            StepType::ShellCommand => StepConfig {
                execution: Server,
                queuing: Immediate,
                description: "Run a shell command on the server",
                supports_state_update: true,
                required_fields: &["command"],
                optional_fields: &["state_update", "working_directory", "timeout"],
            },
            StepType::StateUpdate => StepConfig {
                execution: Server,
                queuing: Immediate,
                description: "Apply a single state update",
                supports_state_update: true,
                required_fields: &["path", "value"],
                optional_fields: &["operation"],
            },
            StepType::BatchStateUpdate => StepConfig {
                execution: Server,
                queuing: Immediate,
                description: "Apply a batch of state updates atomically",
                supports_state_update: true,
                required_fields: &["updates"],
                optional_fields: &[],
            },
            StepType::Conditional => StepConfig {
                execution: Server,
                queuing: Expand,
                description: "Branch into then/else steps based on a condition",
                supports_state_update: false,
                required_fields: &["condition"],
                optional_fields: &["then_steps", "else_steps"],
            },
            StepType::WhileLoop => StepConfig {
                execution: Server,
                queuing: Expand,
                description: "Repeat a body of steps while a condition holds",
                supports_state_update: false,
                required_fields: &["condition"],
                optional_fields: &["body", "max_iterations"],
            },
            StepType::Foreach => StepConfig {
                execution: Server,
                queuing: Expand,
                description: "Repeat a body of steps once per item",
                supports_state_update: false,
                required_fields: &["items"],
                optional_fields: &["body"],
            },
            StepType::Break => StepConfig {
                execution: Server,
                queuing: Expand,
                description: "Exit the enclosing loop",
                supports_state_update: false,
                required_fields: &[],
                optional_fields: &[],
            },
            StepType::Continue => StepConfig {
                execution: Server,
                queuing: Expand,
                description: "Skip to the next iteration of the enclosing loop",
                supports_state_update: false,
                required_fields: &[],
                optional_fields: &[],
            },
        }
    }

    pub fn is_client_step(&self) -> bool {
        self.config().execution == Execution::Client
    }

    pub fn is_server_step(&self) -> bool {
        self.config().execution == Execution::Server
    }

    pub fn is_batchable(&self) -> bool {
        self.config().queuing == Queuing::Batch
    }

    pub fn is_control_flow(&self) -> bool {
        self.config().queuing == Queuing::Expand
    }
}

/// Parse a step's type tag and look up its config in one call.
pub fn lookup(step_type: &str) -> Option<(StepType, StepConfig)> {
    StepType::parse(step_type).map(|t| (t, t.config()))
}

/// Validate a step's definition against its type's field contract: every
/// required field present, no fields outside `{id, type} | required | optional`.
pub fn validate_step(step: &WorkflowStep) -> Result<(), EngineError> {
    let Some((step_type, config)) = lookup(&step.step_type) else {
        return Err(EngineError::invalid_input(format!(
            "step '{}' has unknown type '{}'",
            step.id, step.step_type
        )));
    };

    for field in config.required_fields {
        if !step.definition.contains_key(*field) {
            return Err(EngineError::invalid_input(format!(
                "step '{}' is missing required field '{}' for step type '{}'",
                step.id,
                field,
                step_type.as_str()
            )));
        }
    }

    for field in step.definition.keys() {
        let known = config.required_fields.contains(&field.as_str())
            || config.optional_fields.contains(&field.as_str());
        if !known {
            return Err(EngineError::invalid_input(format!(
                "step '{}' has unknown field '{}' for step type '{}'",
                step.id,
                field,
                step_type.as_str()
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_flow_steps_are_expand_queued() {
        for t in [StepType::Conditional, StepType::WhileLoop, StepType::Foreach, StepType::Break, StepType::Continue] {
            assert!(t.is_control_flow());
            assert!(t.is_server_step());
        }
    }

    #[test]
    fn client_batchable_vs_blocking() {
        assert!(StepType::UserMessage.is_batchable());
        assert!(!StepType::McpCall.is_batchable());
        assert!(StepType::McpCall.is_client_step());
    }

    #[test]
    fn validate_step_rejects_missing_required_field() {
        let step = WorkflowStep::new("s1", "state_update");
        let err = validate_step(&step).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidInput);
    }

    #[test]
    fn validate_step_rejects_unknown_field() {
        let step = WorkflowStep::new("s1", "user_message")
            .with_field("message", "hi")
            .with_field("bogus", "nope");
        assert!(validate_step(&step).is_err());
    }

    #[test]
    fn validate_step_accepts_well_formed_step() {
        let step = WorkflowStep::new("s1", "user_message").with_field("message", "hi");
        assert!(validate_step(&step).is_ok());
    }

    #[test]
    fn unknown_step_type_is_rejected() {
        let step = WorkflowStep::new("s1", "not_a_real_type");
        assert!(validate_step(&step).is_err());
    }
}
