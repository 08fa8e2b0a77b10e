// ABOUTME: WorkflowEngineApi: the external request/response surface (§6)
// ABOUTME: One state manager + queue executor per distinct workflow definition, shared by its running instances

//! External interface surface.
//!
//! One [`QueueExecutor`] (and the [`ConcurrentStateManager`] it owns) is
//! built per distinct [`WorkflowDefinition`] the first time it's started,
//! since a definition's `state_schema` — and therefore its computed-field
//! dependency graph — is fixed for the lifetime of the state manager that
//! serves it. Every running instance of that definition shares the executor;
//! what's per-instance is only the `workflow_id` key into it plus the
//! [`WorkflowInstance`] bookkeeping record.
//!
//! The YAML loader, schema validator, metrics sink, prompt template source,
//! and MCP tool registry are external collaborators this crate only declares
//! the shape of — callers supply their own implementation.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tracing::{debug, warn};
use workflow_model::{WorkflowDefinition, WorkflowInstance, WorkflowStatus};
use workflow_state::{BatchUpdate, ConcurrentStateManager, StateManager, StateUpdate};

use crate::error::EngineError;
use crate::executor::QueueExecutor;
use crate::registry;
use crate::subagent::SubAgentManager;

/// Resolves a workflow name to its loaded, schema-validated definition.
/// `<project>/.aromcp/workflows/<name>.yaml` then `~/.aromcp/workflows/<name>.yaml`
/// per the file-resolution rule; this crate only declares the interface.
pub trait WorkflowLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<WorkflowDefinition, EngineError>;
}

/// Validates a loaded definition against the workflow file's JSON schema,
/// beyond the structural checks `serde` already performs on deserialization.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, definition: &WorkflowDefinition) -> Result<(), EngineError>;
}

/// Out-of-scope observability sink (counters/timers per workflow/step).
pub trait MetricsSink: Send + Sync {
    fn record_step(&self, workflow_id: &str, step_type: &str, duration_ms: u64);
}

/// Supplies the standard prompt bodies used when a sub-agent task has no
/// `prompt_template` of its own.
pub trait PromptTemplateSource: Send + Sync {
    fn render(&self, name: &str, context: &Value) -> String;
}

/// Dispatches an `mcp_call`/`internal_mcp_call` client step's tool
/// invocation. The engine never calls this directly — client steps are
/// handed to the external agent, which is the one that talks to MCP tools.
pub trait McpToolRegistry: Send + Sync {
    fn invoke(&self, tool: &str, parameters: &Value) -> Result<Value, EngineError>;
}

struct RunningWorkflow {
    instance: WorkflowInstance,
    executor: Arc<QueueExecutor>,
    global_vars: Map<String, Value>,
}

pub struct WorkflowEngineApi {
    definitions: SyncMutex<HashMap<String, Arc<WorkflowDefinition>>>,
    executors: SyncMutex<HashMap<String, Arc<QueueExecutor>>>,
    workflows: SyncMutex<HashMap<String, RunningWorkflow>>,
    subagents: SubAgentManager,
}

impl Default for WorkflowEngineApi {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowEngineApi {
    pub fn new() -> Self {
        Self {
            definitions: SyncMutex::new(HashMap::new()),
            executors: SyncMutex::new(HashMap::new()),
            workflows: SyncMutex::new(HashMap::new()),
            subagents: SubAgentManager::new(),
        }
    }

    fn executor_for(&self, definition: &WorkflowDefinition) -> Result<Arc<QueueExecutor>, EngineError> {
        if let Some(existing) = self.executors.lock().get(&definition.name) {
            return Ok(existing.clone());
        }
        let manager = StateManager::new(definition.state_schema.clone())?;
        let concurrent = Arc::new(ConcurrentStateManager::new(Arc::new(manager)));
        let executor = Arc::new(QueueExecutor::new(concurrent));
        self.executors.lock().insert(definition.name.clone(), executor.clone());
        Ok(executor)
    }

    fn resolved_inputs(
        definition: &WorkflowDefinition,
        mut provided: Map<String, Value>,
    ) -> Result<Map<String, Value>, EngineError> {
        for (name, input_def) in &definition.inputs {
            if !provided.contains_key(name) {
                if !input_def.default.is_null() {
                    provided.insert(name.clone(), input_def.default.clone());
                } else if input_def.required {
                    return Err(EngineError::invalid_input(format!("missing required input '{name}'")));
                }
            }
        }
        Ok(provided)
    }

    /// `workflow_start`: validate every step's type contract, seed inputs and
    /// default state, register the queue, and return the instance summary.
    pub fn workflow_start(
        &self,
        definition: Arc<WorkflowDefinition>,
        inputs: Map<String, Value>,
    ) -> Result<Value, EngineError> {
        for step in &definition.steps {
            registry::validate_step(step)?;
        }

        let resolved_inputs = Self::resolved_inputs(&definition, inputs)?;
        let executor = self.executor_for(&definition)?;
        let workflow_id = WorkflowInstance::fresh_id();

        let seed_updates: Vec<StateUpdate> = resolved_inputs
            .iter()
            .map(|(k, v)| StateUpdate::set(format!("inputs.{k}"), v.clone()))
            .chain(definition.default_state.iter().map(|(k, v)| StateUpdate::set(format!("state.{k}"), v.clone())))
            .collect();
        if !seed_updates.is_empty() {
            executor.state_manager().update(&workflow_id, BatchUpdate::new(seed_updates), None)?;
        }

        executor.register_workflow(workflow_id.clone(), definition.steps.clone());
        self.definitions.lock().insert(definition.name.clone(), definition.clone());

        let instance = WorkflowInstance::new(workflow_id.clone(), definition.name.clone());
        let state = executor.state_manager().read(&workflow_id, true)?;
        let total_steps = definition.steps.len();

        self.workflows.lock().insert(
            workflow_id.clone(),
            RunningWorkflow { instance: instance.clone(), executor, global_vars: Map::new() },
        );
        debug!("started workflow {workflow_id} ({}) with {total_steps} steps", definition.name);

        Ok(serde_json::json!({
            "workflow_id": workflow_id,
            "status": instance.status,
            "state": state,
            "total_steps": total_steps,
            "execution_context": {"frame_depth": 0},
        }))
    }

    fn running(&self, workflow_id: &str) -> Result<(), EngineError> {
        if self.workflows.lock().contains_key(workflow_id) {
            Ok(())
        } else {
            Err(EngineError::not_found(format!("workflow '{workflow_id}' not found")))
        }
    }

    /// `workflow_get_next_step`. With `task_id` set, drives that sub-agent's
    /// queue instead of the parent's.
    pub async fn workflow_get_next_step(
        &self,
        workflow_id: &str,
        task_id: Option<&str>,
    ) -> Result<Option<Value>, EngineError> {
        if let Some(task_id) = task_id {
            return self.subagents.get_next_sub_agent_step(task_id).await;
        }

        self.running(workflow_id)?;
        let (executor, workflow_name) = {
            let workflows = self.workflows.lock();
            let entry = workflows.get(workflow_id).expect("checked above");
            (entry.executor.clone(), entry.instance.workflow_name.clone())
        };

        let mut global_vars = {
            let workflows = self.workflows.lock();
            workflows.get(workflow_id).expect("checked above").global_vars.clone()
        };

        let mut batch = executor.get_next_step(workflow_id, &mut global_vars).await?;

        if let Some(idx) = batch
            .steps
            .iter()
            .position(|s| s.step_type == "parallel_foreach" && s.error.is_none())
        {
            self.expand_parallel_foreach(workflow_id, &workflow_name, &mut batch.steps[idx])?;
        }

        {
            let mut workflows = self.workflows.lock();
            if let Some(entry) = workflows.get_mut(workflow_id) {
                entry.global_vars = global_vars;
                if batch.workflow_complete && entry.instance.status != WorkflowStatus::Failed {
                    entry.instance.mark_completed();
                }
            }
        }

        if batch.steps.is_empty() && batch.workflow_complete {
            return Ok(None);
        }

        let mut response = serde_json::json!({
            "steps": batch.steps,
            "server_completed_steps": batch.server_completed,
            "workflow_id": workflow_id,
        });
        if batch.steps.len() == 1 {
            response["step"] = serde_json::to_value(&batch.steps[0]).unwrap_or(Value::Null);
        }
        Ok(Some(response))
    }

    /// Fans a `parallel_foreach` step at the head of the client batch out into
    /// one isolated sub-agent task per item, attaching the resulting task ids
    /// to the step definition the client receives so it can drive each one
    /// through `workflow_get_next_step(workflow_id, Some(task_id))`.
    fn expand_parallel_foreach(
        &self,
        workflow_id: &str,
        workflow_name: &str,
        entry: &mut crate::queue::ClientQueueEntry,
    ) -> Result<(), EngineError> {
        let definition = entry.definition.as_object().cloned().unwrap_or_default();

        let sub_agent_task_name = definition
            .get("sub_agent_task")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::invalid_input("parallel_foreach step missing 'sub_agent_task'"))?
            .to_string();

        let sub_agent_task = {
            let definitions = self.definitions.lock();
            let workflow_def = definitions
                .get(workflow_name)
                .ok_or_else(|| EngineError::not_found(format!("workflow definition '{workflow_name}' not found")))?;
            workflow_def
                .sub_agent_task(&sub_agent_task_name)
                .ok_or_else(|| {
                    EngineError::invalid_input(format!("unknown sub_agent_task '{sub_agent_task_name}'"))
                })?
                .clone()
        };

        let executor = {
            let workflows = self.workflows.lock();
            workflows.get(workflow_id).expect("checked by caller").executor.clone()
        };
        let parent_state = executor.state_manager().read(workflow_id, false)?;

        let descriptors = self.subagents.prepare_parallel_foreach(
            workflow_id,
            &entry.id,
            &definition,
            &parent_state,
            &sub_agent_task_name,
            &sub_agent_task,
        )?;

        let tasks: Vec<Value> = descriptors
            .iter()
            .map(|d| serde_json::json!({"task_id": d.task_id, "inputs": d.inputs}))
            .collect();

        if let Value::Object(map) = &mut entry.definition {
            map.insert("sub_agent_tasks".to_string(), Value::Array(tasks));
        }

        Ok(())
    }

    /// `workflow_step_complete`: on `failed`, marks the instance failed; a
    /// `result.state_updates` list (if present) is applied to the workflow's
    /// state.
    pub fn workflow_step_complete(
        &self,
        workflow_id: &str,
        step_id: &str,
        status: &str,
        result: Option<Value>,
    ) -> Result<Value, EngineError> {
        let executor = {
            let workflows = self.workflows.lock();
            workflows
                .get(workflow_id)
                .map(|w| w.executor.clone())
                .ok_or_else(|| EngineError::not_found(format!("workflow '{workflow_id}' not found")))?
        };

        if let Some(updates) = result.as_ref().and_then(|r| r.get("state_updates")).and_then(Value::as_array) {
            let parsed: Result<Vec<StateUpdate>, _> = updates
                .iter()
                .map(|u| serde_json::from_value::<StateUpdate>(u.clone()))
                .collect();
            let parsed = parsed.map_err(|e| EngineError::invalid_input(e.to_string()))?;
            if !parsed.is_empty() {
                executor.state_manager().update(workflow_id, BatchUpdate::new(parsed), None)?;
            }
        }

        let mut workflows = self.workflows.lock();
        let entry = workflows.get_mut(workflow_id).expect("checked above");
        if status == "failed" {
            warn!("step {step_id} failed on workflow {workflow_id}");
            entry.instance.mark_failed(
                result
                    .as_ref()
                    .and_then(|r| r.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or("step failed")
                    .to_string(),
            );
        }

        Ok(serde_json::json!({
            "status": status,
            "current_step_index": 0,
            "total_steps": 0,
            "completed_at": entry.instance.completed_at,
        }))
    }

    pub fn workflow_get_status(&self, workflow_id: &str) -> Result<Value, EngineError> {
        let workflows = self.workflows.lock();
        let entry = workflows
            .get(workflow_id)
            .ok_or_else(|| EngineError::not_found(format!("workflow '{workflow_id}' not found")))?;
        let state = entry.executor.state_manager().read(workflow_id, true)?;
        Ok(serde_json::json!({
            "workflow_id": entry.instance.id,
            "workflow_name": entry.instance.workflow_name,
            "status": entry.instance.status,
            "created_at": entry.instance.created_at,
            "completed_at": entry.instance.completed_at,
            "error_message": entry.instance.error_message,
            "state": state,
        }))
    }

    pub fn workflow_update_state(&self, workflow_id: &str, updates: Vec<StateUpdate>) -> Result<Value, EngineError> {
        let executor = {
            let workflows = self.workflows.lock();
            workflows
                .get(workflow_id)
                .map(|w| w.executor.clone())
                .ok_or_else(|| EngineError::not_found(format!("workflow '{workflow_id}' not found")))?
        };
        Ok(executor.state_manager().update(workflow_id, BatchUpdate::new(updates), None)?.state)
    }

    pub fn workflow_list_active(&self) -> Vec<Value> {
        self.workflows
            .lock()
            .values()
            .filter(|w| w.instance.status == WorkflowStatus::Running)
            .map(|w| {
                serde_json::json!({
                    "workflow_id": w.instance.id,
                    "workflow_name": w.instance.workflow_name,
                    "created_at": w.instance.created_at,
                })
            })
            .collect()
    }

    pub fn workflow_checkpoint(&self, workflow_id: &str, _step_id: &str, _reason: &str) -> Result<Value, EngineError> {
        let executor = {
            let workflows = self.workflows.lock();
            workflows
                .get(workflow_id)
                .map(|w| w.executor.clone())
                .ok_or_else(|| EngineError::not_found(format!("workflow '{workflow_id}' not found")))?
        };
        let checkpoint = executor.state_manager().create_checkpoint(workflow_id)?;
        Ok(serde_json::json!({
            "checkpoint_id": format!("{}-{}", workflow_id, checkpoint.version),
            "version": checkpoint.version,
            "created_at": checkpoint.created_at,
        }))
    }

    pub fn workflow_resume(&self, workflow_id: &str) -> Result<Value, EngineError> {
        self.running(workflow_id)?;
        Ok(serde_json::json!({"status": "running", "current_step_index": 0}))
    }

    pub fn workflow_state_read(&self, workflow_id: &str) -> Result<Value, EngineError> {
        let workflows = self.workflows.lock();
        let entry = workflows
            .get(workflow_id)
            .ok_or_else(|| EngineError::not_found(format!("workflow '{workflow_id}' not found")))?;
        Ok(entry.executor.state_manager().read(workflow_id, true)?)
    }

    pub fn workflow_validate_path(&self, path: &str) -> Result<(), EngineError> {
        if path.is_empty() || !path.contains('.') {
            return Err(EngineError::invalid_input(format!("invalid state path '{path}'")));
        }
        let scope = path.split('.').next().unwrap_or("");
        if scope == "loop" {
            return Err(EngineError::permission_denied(format!("cannot write to '{path}'")));
        }
        if !matches!(scope, "this" | "global" | "inputs" | "raw" | "state") {
            return Err(EngineError::invalid_input(format!("invalid state path '{path}'")));
        }
        Ok(())
    }

    pub fn subagents(&self) -> &SubAgentManager {
        &self.subagents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_model::{InputDefinition, StateSchema, WorkflowStep};
    use std::collections::HashMap as StdHashMap;

    fn simple_definition() -> Arc<WorkflowDefinition> {
        Arc::new(WorkflowDefinition {
            name: "demo:increment".into(),
            description: String::new(),
            version: "1.0".into(),
            default_state: Map::new(),
            state_schema: StateSchema::default(),
            inputs: {
                let mut m = StdHashMap::new();
                m.insert(
                    "counter".to_string(),
                    InputDefinition { input_type: "number".into(), description: String::new(), required: true, default: Value::Null },
                );
                m
            },
            steps: vec![WorkflowStep::new("s1", "state_update").with_field("path", "state.x").with_field("value", 1)],
            sub_agent_tasks: StdHashMap::new(),
        })
    }

    #[test]
    fn workflow_start_seeds_inputs_and_registers_queue() {
        let api = WorkflowEngineApi::new();
        let mut inputs = Map::new();
        inputs.insert("counter".to_string(), Value::from(5));
        let started = api.workflow_start(simple_definition(), inputs).unwrap();
        assert_eq!(started["state"]["inputs"]["counter"], Value::from(5));
        assert_eq!(started["total_steps"], Value::from(1));
    }

    #[test]
    fn workflow_start_rejects_missing_required_input() {
        let api = WorkflowEngineApi::new();
        let err = api.workflow_start(simple_definition(), Map::new()).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn full_run_increments_version_and_completes() {
        let api = WorkflowEngineApi::new();
        let mut inputs = Map::new();
        inputs.insert("counter".to_string(), Value::from(1));
        let started = api.workflow_start(simple_definition(), inputs).unwrap();
        let workflow_id = started["workflow_id"].as_str().unwrap().to_string();

        let batch = api.workflow_get_next_step(&workflow_id, None).await.unwrap();
        assert!(batch.is_none());

        let state = api.workflow_state_read(&workflow_id).unwrap();
        assert_eq!(state["state"]["x"], Value::from(1));
        // one version bump for the input-seeding update, one for the state_update step
        assert_eq!(state["__version__"]["version"], Value::from(3));
    }
}
