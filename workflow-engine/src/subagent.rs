// ABOUTME: Sub-agent coordinator: isolated per-task state and queues behind parallel_foreach
// ABOUTME: Grounded on original_source/.../workflow/subagent_manager.py

//! Fans a `parallel_foreach` client step's item list out into independent
//! sub-agent tasks, each with its own isolated state and step queue.
//!
//! Each task gets its own [`ConcurrentStateManager`] (built from the
//! sub-agent task's own `state_schema`, so its computed fields and
//! dependency graph are independent of both its siblings and the parent
//! workflow) and its own [`WorkflowQueue`]. Control-flow steps inside a
//! sub-agent's body are expanded against that queue with the same
//! [`crate::queue::LoopContext`] machinery the main queue executor uses —
//! the original kept a second, simpler loop-stack representation for this
//! path (writing `raw.loop_item`/`raw.loop_index` instead of the main
//! executor's `state.loop_item`/`state.loop_index`); this port uses one
//! consolidated representation for both, writing `state.loop_item` /
//! `state.loop_index` in both places (see `DESIGN.md`).

use parking_lot::Mutex as SyncMutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use workflow_model::definition::SubAgentTask;
use workflow_state::{ConcurrentStateManager, StateManager};

use crate::error::EngineError;
use crate::processor::StepProcessor;
use crate::queue::WorkflowQueue;
use crate::registry::{self, Execution, Queuing};

const DEFAULT_MAX_PARALLEL: u64 = 10;

fn is_debug_serial() -> bool {
    std::env::var("AROAGENT_WORKFLOW_DEBUG")
        .map(|v| v.eq_ignore_ascii_case("serial"))
        .unwrap_or(false)
}

struct SubAgentEntry {
    queue: WorkflowQueue,
    processor: StepProcessor,
    state_manager: Arc<ConcurrentStateManager>,
    task_context: Value,
    completed: bool,
}

/// One fanned-out task: the id the client will address, and the inputs it
/// was seeded with — what `prepare_parallel_foreach` hands back per item.
#[derive(Debug, Clone)]
pub struct SubAgentTaskDescriptor {
    pub task_id: String,
    pub context: Value,
    pub inputs: Map<String, Value>,
}

pub struct SubAgentManager {
    entries: SyncMutex<HashMap<String, Arc<SyncMutex<SubAgentEntry>>>>,
}

impl Default for SubAgentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubAgentManager {
    pub fn new() -> Self {
        Self { entries: SyncMutex::new(HashMap::new()) }
    }

    /// Evaluate `items`, create one isolated sub-agent context per item (up
    /// to `max_parallel` unless debug-serial is on, in which case every item
    /// is prepared), and return the descriptors the caller serializes into
    /// the `parallel_foreach` client step's enhanced definition.
    pub fn prepare_parallel_foreach(
        &self,
        workflow_id: &str,
        parent_step_id: &str,
        def: &Map<String, Value>,
        parent_state_view: &Value,
        sub_agent_task_name: &str,
        sub_agent_task: &SubAgentTask,
    ) -> Result<Vec<SubAgentTaskDescriptor>, EngineError> {
        let items_raw = def
            .get("items")
            .ok_or_else(|| EngineError::invalid_input("missing 'items' in parallel_foreach step"))?;
        let items = match items_raw {
            Value::Array(items) => items.clone(),
            Value::String(s) => {
                let expr = crate::processor::strip_template_braces(s);
                let ast = workflow_expr::parse(&expr)?;
                let ctx = workflow_expr::ScopedContext::new()
                    .with_global(parent_state_view.clone())
                    .with_inputs(parent_state_view.get("inputs").cloned().unwrap_or(Value::Null));
                match workflow_expr::evaluate(&ast, &ctx)? {
                    Value::Array(items) => items,
                    _ => return Err(EngineError::invalid_input("parallel_foreach items must resolve to a list")),
                }
            }
            _ => return Err(EngineError::invalid_input("parallel_foreach items must be a string expression or list")),
        };

        let max_parallel = def.get("max_parallel").and_then(Value::as_u64).unwrap_or(DEFAULT_MAX_PARALLEL) as usize;
        let debug_serial = is_debug_serial();
        let items_to_process: &[Value] = if debug_serial { &items } else { &items[..items.len().min(max_parallel)] };

        let mut descriptors = Vec::with_capacity(items_to_process.len());
        for (i, item) in items_to_process.iter().enumerate() {
            let task_id = format!("{sub_agent_task_name}.item{i}");
            let task_context = serde_json::json!({
                "item": item,
                "index": i,
                "total": items.len(),
                "task_id": task_id,
                "parent_step_id": parent_step_id,
                "workflow_id": workflow_id,
            });

            let mut inputs = Map::new();
            for input_name in sub_agent_task.inputs.keys() {
                if input_name == "file_path" {
                    inputs.insert(input_name.clone(), item.clone());
                } else if let Some(v) = task_context.get(input_name.as_str()) {
                    inputs.insert(input_name.clone(), v.clone());
                } else if let Some(def) = sub_agent_task.inputs.get(input_name) {
                    if !def.default.is_null() {
                        inputs.insert(input_name.clone(), def.default.clone());
                    }
                }
            }

            let manager = StateManager::new(sub_agent_task.state_schema.clone())?;
            manager.seed(&task_id, inputs.clone(), sub_agent_task.default_state.clone());
            let concurrent = Arc::new(ConcurrentStateManager::new(Arc::new(manager)));

            let entry = SubAgentEntry {
                queue: WorkflowQueue::new(task_id.clone(), sub_agent_task.steps.clone()),
                processor: StepProcessor::new(concurrent.clone()),
                state_manager: concurrent,
                task_context: task_context.clone(),
                completed: false,
            };
            self.entries.lock().insert(task_id.clone(), Arc::new(SyncMutex::new(entry)));

            descriptors.push(SubAgentTaskDescriptor { task_id, context: task_context, inputs });
        }

        Ok(descriptors)
    }

    fn entry(&self, task_id: &str) -> Result<Arc<SyncMutex<SubAgentEntry>>, EngineError> {
        self.entries
            .lock()
            .get(task_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("sub-agent task '{task_id}' not found")))
    }

    /// Drive `task_id`'s queue the same way the main queue executor drives a
    /// workflow's, except server-side effects apply only to this task's
    /// isolated state. Returns `None` once the queue is empty.
    pub async fn get_next_sub_agent_step(&self, task_id: &str) -> Result<Option<Value>, EngineError> {
        let entry = self.entry(task_id)?;

        loop {
            enum Step {
                Client(Value),
                Done,
                RunShell {
                    step: workflow_model::WorkflowStep,
                    def: Map<String, Value>,
                    spec: crate::processor::ShellCommandSpec,
                },
            }

            let decision = {
                let mut guard = entry.lock();
                if !guard.queue.has_steps() {
                    guard.completed = true;
                    Step::Done
                } else {
                    let step = guard.queue.peek_next().cloned().expect("has_steps checked");
                    let Some((_, config)) = registry::lookup(&step.step_type) else {
                        guard.queue.pop_next();
                        let def = Value::Object(step.definition.clone());
                        Step::Client(serde_json::json!({
                            "step": {"id": format!("{task_id}.{}", step.id), "type": step.step_type, "definition": def},
                            "task_id": task_id,
                            "error": format!("Unknown step type: {}", step.step_type),
                        }))
                    } else if config.execution == Execution::Server {
                        if config.queuing == Queuing::Expand {
                            guard.queue.pop_next();
                            let SubAgentEntry { queue, processor, .. } = &mut *guard;
                            processor.process_immediate(task_id, &step, queue, None)?;
                            continue;
                        } else if step.step_type == "shell_command" {
                            let def = guard.processor.interpolate_step_definition(task_id, &step, &guard.queue)?;
                            let spec = StepProcessor::prepare_shell_command(&def)?;
                            guard.queue.pop_next();
                            Step::RunShell { step, def, spec }
                        } else {
                            guard.queue.pop_next();
                            let SubAgentEntry { queue, processor, .. } = &mut *guard;
                            processor.process_immediate(task_id, &step, queue, None)?;
                            continue;
                        }
                    } else {
                        guard.queue.pop_next();
                        let def = guard.processor.interpolate_step_definition(task_id, &step, &guard.queue)?;
                        Step::Client(serde_json::json!({
                            "step": {"id": format!("{task_id}.{}", step.id), "type": step.step_type, "definition": Value::Object(def)},
                            "task_id": task_id,
                        }))
                    }
                }
            };

            match decision {
                Step::Done => return Ok(None),
                Step::Client(v) => return Ok(Some(v)),
                Step::RunShell { step, def, spec } => {
                    let outcome = StepProcessor::run_shell_command(&spec).await;
                    let mut guard = entry.lock();
                    let processed = guard.processor.finish_shell_command(task_id, &step, &def, &spec, outcome, None)?;
                    let _ = processed;
                    continue;
                }
            }
        }
    }

    /// Compatibility no-op: the step index already advances as
    /// `get_next_sub_agent_step` pops from the queue, so there's nothing
    /// left to apply here beyond acknowledging the call.
    pub fn execute_sub_agent_step(&self, workflow_id: &str, task_id: &str) -> Value {
        serde_json::json!({"status": "success", "workflow_id": workflow_id, "task_id": task_id})
    }

    pub fn task_state(&self, task_id: &str) -> Result<Value, EngineError> {
        let entry = self.entry(task_id)?;
        let guard = entry.lock();
        Ok(guard.state_manager.read(task_id, false)?)
    }

    pub fn is_completed(&self, task_id: &str) -> Result<bool, EngineError> {
        let entry = self.entry(task_id)?;
        Ok(entry.lock().completed)
    }

    pub fn remove_task(&self, task_id: &str) {
        self.entries.lock().remove(task_id);
    }

    /// `true` once every active task has either completed or is absent —
    /// the parent's resumption condition for a `parallel_foreach` in normal
    /// (non-debug-serial) mode.
    pub fn all_completed(&self, task_ids: &[String]) -> bool {
        task_ids.iter().all(|id| self.is_completed(id).unwrap_or(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_model::InputDefinition;
    use workflow_model::WorkflowStep;

    fn task(inputs: &[&str]) -> SubAgentTask {
        SubAgentTask {
            name: "fix".into(),
            description: String::new(),
            inputs: inputs
                .iter()
                .map(|n| {
                    (
                        n.to_string(),
                        InputDefinition {
                            input_type: "string".into(),
                            description: String::new(),
                            required: true,
                            default: Value::Null,
                        },
                    )
                })
                .collect(),
            steps: vec![WorkflowStep::new("s1", "user_message").with_field("message", "{{ inputs.file_path }}")],
            prompt_template: String::new(),
            default_state: Map::new(),
            state_schema: Default::default(),
        }
    }

    #[test]
    fn fans_out_one_task_per_item_with_isolated_inputs() {
        let manager = SubAgentManager::new();
        let sub_task = task(&["file_path"]);
        let parent_view = serde_json::json!({"inputs": {}, "state": {}, "computed": {}, "raw": {}});
        let def = serde_json::json!({"items": ["a.ts", "b.ts"], "sub_agent_task": "fix"})
            .as_object()
            .cloned()
            .unwrap();

        let descriptors = manager
            .prepare_parallel_foreach("wf1", "p1", &def, &parent_view, "fix", &sub_task)
            .unwrap();

        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].task_id, "fix.item0");
        assert_eq!(descriptors[1].task_id, "fix.item1");
        assert_eq!(descriptors[0].inputs.get("file_path"), Some(&Value::String("a.ts".into())));
        assert_eq!(descriptors[1].inputs.get("file_path"), Some(&Value::String("b.ts".into())));

        let state_a = manager.task_state("fix.item0").unwrap();
        let state_b = manager.task_state("fix.item1").unwrap();
        assert_eq!(state_a["inputs"]["file_path"], Value::String("a.ts".into()));
        assert_eq!(state_b["inputs"]["file_path"], Value::String("b.ts".into()));
    }

    #[tokio::test]
    async fn drives_sub_agent_queue_to_completion() {
        let manager = SubAgentManager::new();
        let sub_task = task(&["file_path"]);
        let parent_view = serde_json::json!({"inputs": {}, "state": {}, "computed": {}, "raw": {}});
        let def = serde_json::json!({"items": ["a.ts"], "sub_agent_task": "fix"}).as_object().cloned().unwrap();
        let descriptors = manager.prepare_parallel_foreach("wf1", "p1", &def, &parent_view, "fix", &sub_task).unwrap();
        let task_id = &descriptors[0].task_id;

        let step = manager.get_next_sub_agent_step(task_id).await.unwrap();
        assert!(step.is_some());
        let done = manager.get_next_sub_agent_step(task_id).await.unwrap();
        assert!(done.is_none());
        assert!(manager.is_completed(task_id).unwrap());
    }
}
