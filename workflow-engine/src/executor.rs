// ABOUTME: QueueExecutor: drains a workflow's queue, batching client steps and running server steps
// ABOUTME: Grounded on original_source/.../workflow/workflow_executor.py's get_next_step loop

//! Draining a workflow's queue into a response batch.
//!
//! A per-workflow [`parking_lot::Mutex`] guards the queue and execution
//! context; it is never reentrant and, crucially, is never held across an
//! `.await`. `shell_command` is the only step type that awaits (running a
//! subprocess), so its handling is split into three phases: lock, prepare
//! the spec synchronously, unlock; run the command with no lock held;
//! relock, apply the result, unlock. Every other step type executes
//! entirely inside one short synchronous critical section.
//!
//! The registry mirrors `workflow_executor.py::get_next_step`: an unknown
//! step type doesn't abort the workflow, it's surfaced as an error entry
//! in the client batch so the caller sees it without the server crashing.

use parking_lot::Mutex as SyncMutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use workflow_model::WorkflowStep;
use workflow_state::ConcurrentStateManager;

use crate::context::{ExecutionContext, ExecutionContextManager};
use crate::error::EngineError;
use crate::processor::StepProcessor;
use crate::queue::{ClientQueueEntry, WorkflowQueue};
use crate::registry::{self, Execution, Queuing, StepType};

struct WorkflowEntry {
    queue: WorkflowQueue,
}

/// Owns every active workflow's queue behind its own lock, plus the shared
/// [`ExecutionContextManager`] and [`StepProcessor`] used while draining it.
pub struct QueueExecutor {
    entries: SyncMutex<HashMap<String, Arc<SyncMutex<WorkflowEntry>>>>,
    contexts: SyncMutex<ExecutionContextManager>,
    processor: StepProcessor,
    state_manager: Arc<ConcurrentStateManager>,
}

/// What `get_next_step` hands back to the caller: a batch of client-facing
/// steps (possibly empty if the workflow finished or is waiting on one
/// blocking step) plus the server steps that resolved along the way.
#[derive(Debug, Clone, Default)]
pub struct NextStepBatch {
    pub steps: Vec<ClientQueueEntry>,
    pub server_completed: Vec<Value>,
    pub workflow_complete: bool,
}

impl QueueExecutor {
    pub fn new(state_manager: Arc<ConcurrentStateManager>) -> Self {
        Self {
            entries: SyncMutex::new(HashMap::new()),
            contexts: SyncMutex::new(ExecutionContextManager::new()),
            processor: StepProcessor::new(state_manager.clone()),
            state_manager,
        }
    }

    pub fn register_workflow(&self, workflow_id: impl Into<String>, steps: Vec<WorkflowStep>) {
        let workflow_id = workflow_id.into();
        let queue = WorkflowQueue::new(workflow_id.clone(), steps);
        self.entries
            .lock()
            .insert(workflow_id.clone(), Arc::new(SyncMutex::new(WorkflowEntry { queue })));
        self.contexts.lock().create_context(workflow_id);
    }

    pub fn remove_workflow(&self, workflow_id: &str) {
        self.entries.lock().remove(workflow_id);
        self.contexts.lock().remove_context(workflow_id);
    }

    fn entry(&self, workflow_id: &str) -> Result<Arc<SyncMutex<WorkflowEntry>>, EngineError> {
        self.entries
            .lock()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("workflow '{workflow_id}' not registered")))
    }

    /// Drain steps until a blocking client step is reached, the queue runs
    /// dry, or `global_vars` has no `global.*` writes pending (global writes
    /// always go through the caller-supplied map since they live outside the
    /// state manager's tiers).
    pub async fn get_next_step(
        &self,
        workflow_id: &str,
        global_vars: &mut Map<String, Value>,
    ) -> Result<NextStepBatch, EngineError> {
        let entry = self.entry(workflow_id)?;

        loop {
            let decision = {
                let mut guard = entry.lock();
                guard.queue.clear_client_queues();
                self.drain_until_blocking_or_async(workflow_id, &mut guard.queue, &mut *global_vars)?
            };

            match decision {
                Drain::Done(batch) => return Ok(batch),
                Drain::RunShellCommand { step, def, spec } => {
                    let outcome = StepProcessor::run_shell_command(&spec).await;
                    let mut guard = entry.lock();
                    let processed = self.processor.finish_shell_command(
                        workflow_id,
                        &step,
                        &def,
                        &spec,
                        outcome,
                        Some(&mut *global_vars),
                    )?;
                    guard.queue.server_completed.push(processed.to_json());
                }
            }
        }
    }

    /// Synchronous drain loop: pops steps off the front of the queue,
    /// dispatching server steps immediately and batching client steps until
    /// a blocking one is hit. Returns early with a `RunShellCommand` request
    /// when a `shell_command` step is reached, since that's the one step
    /// type this function cannot finish without awaiting.
    fn drain_until_blocking_or_async(
        &self,
        workflow_id: &str,
        queue: &mut WorkflowQueue,
        global_vars: &mut Map<String, Value>,
    ) -> Result<Drain, EngineError> {
        loop {
            let Some(step) = queue.peek_next().cloned() else {
                return Ok(Drain::Done(NextStepBatch {
                    steps: std::mem::take(&mut queue.client_queue),
                    server_completed: std::mem::take(&mut queue.server_completed),
                    workflow_complete: true,
                }));
            };

            let Some((step_type, config)) = registry::lookup(&step.step_type) else {
                warn!("unknown step type '{}' in workflow {workflow_id}", step.step_type);
                queue.pop_next();
                queue.client_queue.push(ClientQueueEntry {
                    id: step.id.clone(),
                    step_type: step.step_type.clone(),
                    definition: Value::Object(step.definition.clone()),
                    error: Some(format!("unknown step type '{}'", step.step_type)),
                });
                continue;
            };

            if config.execution == Execution::Client {
                let def = self
                    .processor
                    .interpolate_step_definition(workflow_id, &step, queue)?;
                queue.pop_next();
                queue.client_queue.push(ClientQueueEntry {
                    id: step.id.clone(),
                    step_type: step.step_type.clone(),
                    definition: Value::Object(def),
                    error: None,
                });
                if config.queuing == Queuing::Blocking {
                    return Ok(Drain::Done(NextStepBatch {
                        steps: std::mem::take(&mut queue.client_queue),
                        server_completed: std::mem::take(&mut queue.server_completed),
                        workflow_complete: false,
                    }));
                }
                continue;
            }

            if step_type == StepType::ShellCommand {
                let def = self
                    .processor
                    .interpolate_step_definition(workflow_id, &step, queue)?;
                let spec = StepProcessor::prepare_shell_command(&def)?;
                queue.pop_next();
                return Ok(Drain::RunShellCommand { step, def, spec });
            }

            queue.pop_next();
            let processed = match self.processor.process_immediate(workflow_id, &step, queue, Some(&mut *global_vars)) {
                Ok(p) => p,
                Err(e) => {
                    queue.client_queue.push(ClientQueueEntry {
                        id: step.id.clone(),
                        step_type: step.step_type.clone(),
                        definition: Value::Object(step.definition.clone()),
                        error: Some(e.message.clone()),
                    });
                    continue;
                }
            };
            if processed.executed {
                queue.server_completed.push(processed.to_json());
            }
        }
    }

    pub fn has_pending_steps(&self, workflow_id: &str) -> Result<bool, EngineError> {
        let entry = self.entry(workflow_id)?;
        Ok(entry.lock().queue.has_steps())
    }

    pub fn with_context<R>(
        &self,
        workflow_id: &str,
        f: impl FnOnce(&mut ExecutionContext) -> R,
    ) -> Option<R> {
        self.contexts.lock().get_context_mut(workflow_id).map(f)
    }

    pub fn state_manager(&self) -> &Arc<ConcurrentStateManager> {
        &self.state_manager
    }
}

enum Drain {
    Done(NextStepBatch),
    RunShellCommand {
        step: WorkflowStep,
        def: Map<String, Value>,
        spec: crate::processor::ShellCommandSpec,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_model::StateSchema;

    fn executor() -> QueueExecutor {
        let manager = workflow_state::StateManager::new(StateSchema::default()).unwrap();
        let concurrent = Arc::new(ConcurrentStateManager::new(Arc::new(manager)));
        QueueExecutor::new(concurrent)
    }

    #[tokio::test]
    async fn drains_batchable_client_steps_together() {
        let exec = executor();
        exec.register_workflow(
            "wf1",
            vec![
                WorkflowStep::new("s1", "user_message").with_field("message", "hi"),
                WorkflowStep::new("s2", "user_message").with_field("message", "there"),
            ],
        );
        let mut globals = Map::new();
        let batch = exec.get_next_step("wf1", &mut globals).await.unwrap();
        assert_eq!(batch.steps.len(), 2);
        assert!(!batch.workflow_complete);
    }

    #[tokio::test]
    async fn blocking_client_step_stops_the_batch() {
        let exec = executor();
        exec.register_workflow(
            "wf1",
            vec![
                WorkflowStep::new("s1", "user_message").with_field("message", "hi"),
                WorkflowStep::new("s2", "user_input").with_field("prompt", "name?"),
                WorkflowStep::new("s3", "user_message").with_field("message", "after"),
            ],
        );
        let mut globals = Map::new();
        let batch = exec.get_next_step("wf1", &mut globals).await.unwrap();
        assert_eq!(batch.steps.len(), 2);
        assert_eq!(batch.steps[1].id, "s2");
    }

    #[tokio::test]
    async fn unknown_step_type_surfaces_as_client_error() {
        let exec = executor();
        exec.register_workflow("wf1", vec![WorkflowStep::new("s1", "not_a_type")]);
        let mut globals = Map::new();
        let batch = exec.get_next_step("wf1", &mut globals).await.unwrap();
        assert_eq!(batch.steps.len(), 1);
        assert!(batch.steps[0].error.is_some());
    }

    #[test]
    fn unregistered_workflow_is_not_found() {
        let exec = executor();
        assert!(exec.has_pending_steps("missing").is_err());
    }
}
