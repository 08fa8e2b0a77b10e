// ABOUTME: Server step handlers: state updates, shell commands, and control-flow expansion
// ABOUTME: Grounded on original_source/.../workflow/{step_processors,steps/shell_command}.py

//! Executes the server-side step types and performs `{{expr}}` template
//! interpolation of a client step's definition before it's queued.
//!
//! Shell command execution is split into a synchronous `prepare` step, an
//! `async` `run` step with no locks held, and a synchronous `finish` step
//! that applies the result — see `crate::executor` for why: the per-workflow
//! lock is a non-reentrant `parking_lot::Mutex`, and it must not be held
//! across the `.await` that actually runs the subprocess.

use serde_json::{Map, Value};
use std::process::Stdio;
use std::time::Duration;
use tracing::warn;
use workflow_model::WorkflowStep;
use workflow_state::{ConcurrentStateManager, StateUpdate, UpdateOperation};

use crate::error::EngineError;
use crate::queue::WorkflowQueue;

const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 30;

/// Outcome of handling one server step.
#[derive(Debug, Clone)]
pub struct ProcessedStep {
    pub executed: bool,
    pub id: Option<String>,
    pub step_type: Option<String>,
    pub definition: Option<Value>,
    pub result: Value,
}

impl ProcessedStep {
    fn executed(id: impl Into<String>, step_type: &str, definition: Value, result: Value) -> Self {
        Self {
            executed: true,
            id: Some(id.into()),
            step_type: Some(step_type.to_string()),
            definition: Some(definition),
            result,
        }
    }

    fn not_executed(result: Value) -> Self {
        Self {
            executed: false,
            id: None,
            step_type: None,
            definition: None,
            result,
        }
    }

    /// `{"executed": ..., "id": ..., "type": ..., "definition": ..., "result": ...}`,
    /// matching the shape `step_processors.py`'s handlers return.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "executed": self.executed,
            "id": self.id,
            "type": self.step_type,
            "definition": self.definition,
            "result": self.result,
        })
    }
}

/// A parsed, ready-to-spawn shell command. Building this is synchronous and
/// lock-free; running it is the only part of step processing that awaits.
#[derive(Debug, Clone)]
pub struct ShellCommandSpec {
    pub command: String,
    pub working_directory: Option<String>,
    pub timeout_secs: u64,
    pub state_update: Option<(String, String)>, // (path, value_source)
}

#[derive(Debug, Clone)]
pub enum ShellOutcome {
    Completed { stdout: String, stderr: String, returncode: i32 },
    TimedOut,
    Failed(String),
}

pub struct StepProcessor {
    state_manager: std::sync::Arc<ConcurrentStateManager>,
}

impl StepProcessor {
    pub fn new(state_manager: std::sync::Arc<ConcurrentStateManager>) -> Self {
        Self { state_manager }
    }

    fn read_view(&self, workflow_id: &str) -> Result<Value, EngineError> {
        Ok(self.state_manager.read(workflow_id, false)?)
    }

    fn apply(
        &self,
        workflow_id: &str,
        updates: Vec<StateUpdate>,
        global_vars: Option<&mut Map<String, Value>>,
    ) -> Result<Value, EngineError> {
        let batch = workflow_state::BatchUpdate::new(updates);
        Ok(self.state_manager.update(workflow_id, batch, global_vars)?.state)
    }

    /// Dispatch every server step type except `shell_command`, which the
    /// executor drives separately through [`Self::prepare_shell_command`] /
    /// [`Self::run_shell_command`] / [`Self::finish_shell_command`].
    pub fn process_immediate(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        queue: &mut WorkflowQueue,
        global_vars: Option<&mut Map<String, Value>>,
    ) -> Result<ProcessedStep, EngineError> {
        let def = self.interpolate_step_definition(workflow_id, step, queue)?;
        match step.step_type.as_str() {
            "state_update" => self.process_state_update(workflow_id, step, &def, global_vars),
            "batch_state_update" => self.process_batch_state_update(workflow_id, step, &def, global_vars),
            "conditional" => self.process_conditional(workflow_id, step, &def, queue),
            "while_loop" => self.process_while_loop(workflow_id, step, &def, queue),
            "foreach" => self.process_foreach(workflow_id, step, &def, queue, global_vars),
            "break" => self.process_break(queue),
            "continue" => self.process_continue(queue),
            other => Err(EngineError::operation_failed(format!(
                "unsupported server step type: {other}"
            ))),
        }
    }

    /// Template-interpolate a step's definition against current state. Used
    /// both for server steps before dispatch and for client steps right
    /// before they're queued.
    pub fn interpolate_step_definition(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        queue: &WorkflowQueue,
    ) -> Result<Map<String, Value>, EngineError> {
        let current_state = self.read_view(workflow_id)?;
        let loop_vars = Value::Object(queue.current_loop().map(|c| c.bindings()).unwrap_or_default());
        let preserve_conditions = step.step_type == "conditional";
        let preserve_templates = matches!(step.step_type.as_str(), "foreach" | "parallel_foreach" | "while_loop");
        let definition = Value::Object(step.definition.clone());
        let processed = replace_variables(&definition, &current_state, &loop_vars, preserve_conditions, preserve_templates);
        Ok(processed.as_object().cloned().unwrap_or_default())
    }

    fn process_state_update(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        def: &Map<String, Value>,
        global_vars: Option<&mut Map<String, Value>>,
    ) -> Result<ProcessedStep, EngineError> {
        let path = def
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::invalid_input("missing 'path' in state_update step"))?;
        let value = def.get("value").cloned().unwrap_or(Value::Null);
        let operation = parse_operation(def.get("operation").and_then(Value::as_str));
        self.apply(
            workflow_id,
            vec![StateUpdate { path: path.to_string(), value, operation }],
            global_vars,
        )?;
        Ok(ProcessedStep::executed(
            step.id.clone(),
            "state_update",
            Value::Object(def.clone()),
            serde_json::json!({"status": "success", "updates_applied": 1}),
        ))
    }

    fn process_batch_state_update(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        def: &Map<String, Value>,
        global_vars: Option<&mut Map<String, Value>>,
    ) -> Result<ProcessedStep, EngineError> {
        let raw_updates = def
            .get("updates")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::invalid_input("missing 'updates' in batch_state_update step"))?;
        let mut updates = Vec::with_capacity(raw_updates.len());
        for entry in raw_updates {
            let path = entry
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::invalid_input("batch_state_update entry missing 'path'"))?;
            let value = entry.get("value").cloned().unwrap_or(Value::Null);
            let operation = parse_operation(entry.get("operation").and_then(Value::as_str));
            updates.push(StateUpdate { path: path.to_string(), value, operation });
        }
        let applied = updates.len();
        self.apply(workflow_id, updates, global_vars)?;
        Ok(ProcessedStep::executed(
            step.id.clone(),
            "batch_state_update",
            Value::Object(def.clone()),
            serde_json::json!({"status": "success", "updates_applied": applied}),
        ))
    }

    fn process_conditional(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        def: &Map<String, Value>,
        queue: &mut WorkflowQueue,
    ) -> Result<ProcessedStep, EngineError> {
        let condition_raw = def
            .get("condition")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::invalid_input("missing 'condition' in conditional step"))?;
        let condition = strip_template_braces(condition_raw);
        let eval_state = self.read_view(workflow_id)?;
        let loop_vars = Value::Object(queue.current_loop().map(|c| c.bindings()).unwrap_or_default());
        let result = eval_expr(&condition, &eval_state, &loop_vars)
            .map_err(|e| EngineError::operation_failed(format!("error evaluating condition '{condition}': {e}")))?;
        let condition_result = workflow_expr::truthy(&result);

        let branch_key = if condition_result { "then_steps" } else { "else_steps" };
        let branch_steps = def.get(branch_key).and_then(Value::as_array).cloned().unwrap_or_default();

        if !branch_steps.is_empty() {
            let children: Vec<WorkflowStep> = branch_steps
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let id = if condition_result { step.then_child_id(i) } else { step.else_child_id(i) };
                    workflow_model::step::step_from_value(id, v)
                })
                .collect();
            queue.prepend_steps(children);
        }

        Ok(ProcessedStep::not_executed(serde_json::json!({
            "condition_result": condition_result,
            "steps_added": branch_steps.len(),
        })))
    }

    fn process_while_loop(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        def: &Map<String, Value>,
        queue: &mut WorkflowQueue,
    ) -> Result<ProcessedStep, EngineError> {
        let condition_raw = def
            .get("condition")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::invalid_input("missing 'condition' in while_loop step"))?;
        let body = def.get("body").and_then(Value::as_array).cloned().unwrap_or_default();
        let max_iterations = def.get("max_iterations").and_then(Value::as_u64).unwrap_or(100) as u32;

        if queue.find_loop_mut(&step.id).is_none() {
            queue.push_loop_context(crate::queue::LoopContext::while_loop(step.id.clone(), max_iterations));
        }

        let iteration = queue.find_loop_mut(&step.id).expect("just inserted").iteration;
        if iteration >= max_iterations {
            queue.pop_loop_context();
            return Ok(ProcessedStep::not_executed(serde_json::json!({"reason": "max iterations reached"})));
        }

        let condition = strip_template_braces(condition_raw);
        let eval_state = self.read_view(workflow_id)?;
        let loop_vars = Value::Object(queue.find_loop_mut(&step.id).expect("just inserted").bindings());

        let condition_result = match eval_expr(&condition, &eval_state, &loop_vars) {
            Ok(v) => workflow_expr::truthy(&v),
            Err(e) => {
                queue.pop_loop_context();
                return Err(EngineError::operation_failed(format!(
                    "error evaluating while condition '{condition}': {e}"
                )));
            }
        };

        if condition_result && !body.is_empty() {
            let mut children: Vec<WorkflowStep> = body
                .iter()
                .enumerate()
                .map(|(i, v)| workflow_model::step::step_from_value(step.body_child_id(i), v))
                .collect();
            children.push(step.clone());
            queue.prepend_steps(children);
            let loop_ctx = queue.find_loop_mut(&step.id).expect("pushed above");
            loop_ctx.iteration += 1;
            Ok(ProcessedStep::not_executed(serde_json::json!({"iteration": loop_ctx.iteration})))
        } else {
            queue.pop_loop_context();
            Ok(ProcessedStep::not_executed(serde_json::json!({"reason": "condition false"})))
        }
    }

    fn process_foreach(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        def: &Map<String, Value>,
        queue: &mut WorkflowQueue,
        mut global_vars: Option<&mut Map<String, Value>>,
    ) -> Result<ProcessedStep, EngineError> {
        let items_raw = def
            .get("items")
            .ok_or_else(|| EngineError::invalid_input("missing 'items' in foreach step"))?
            .clone();
        let body = def.get("body").and_then(Value::as_array).cloned().unwrap_or_default();

        if queue.find_loop_mut(&step.id).is_none() {
            let items = match &items_raw {
                Value::Array(items) => items.clone(),
                Value::String(s) => {
                    let expr = strip_template_braces(s);
                    let eval_state = self.read_view(workflow_id)?;
                    let value = eval_expr(&expr, &eval_state, &Value::Null)
                        .map_err(|e| EngineError::operation_failed(format!("error evaluating foreach items '{expr}': {e}")))?;
                    match value {
                        Value::Array(items) => items,
                        _ => return Err(EngineError::invalid_input("foreach items must resolve to a list")),
                    }
                }
                _ => return Err(EngineError::invalid_input("foreach items must be a string expression or list")),
            };
            queue.push_loop_context(crate::queue::LoopContext::foreach(step.id.clone(), items));
        }

        let loop_ctx = queue.find_loop_mut(&step.id).expect("just inserted");
        let items = loop_ctx.items.clone().unwrap_or_default();
        let index = loop_ctx.index;

        if index < items.len() {
            let item = items[index].clone();
            self.apply(
                workflow_id,
                vec![
                    StateUpdate::set("state.loop_item", item),
                    StateUpdate::set("state.loop_index", Value::from(index as u64)),
                ],
                global_vars.as_deref_mut(),
            )?;

            let mut children: Vec<WorkflowStep> = body
                .iter()
                .enumerate()
                .map(|(i, v)| workflow_model::step::step_from_value(step.body_child_id(i), v))
                .collect();
            children.push(step.clone());
            queue.prepend_steps(children);
            queue.find_loop_mut(&step.id).expect("pushed above").index += 1;

            Ok(ProcessedStep::not_executed(serde_json::json!({"index": index})))
        } else {
            queue.pop_loop_context();
            self.apply(
                workflow_id,
                vec![
                    StateUpdate::set("state.loop_item", Value::Null),
                    StateUpdate::set("state.loop_index", Value::Null),
                ],
                global_vars,
            )?;
            Ok(ProcessedStep::not_executed(serde_json::json!({"reason": "all items processed"})))
        }
    }

    fn process_break(&self, queue: &mut WorkflowQueue) -> Result<ProcessedStep, EngineError> {
        let Some(current) = queue.current_loop() else {
            return Err(EngineError::invalid_input("break used outside of loop"));
        };
        let loop_id = current.loop_id.clone();
        let mut steps_removed = 0u32;
        while let Some(step) = queue.main_queue.front() {
            let is_loop_step = step.id == loop_id;
            queue.pop_next();
            steps_removed += 1;
            if is_loop_step {
                break;
            }
        }
        queue.pop_loop_context();
        Ok(ProcessedStep::not_executed(serde_json::json!({"steps_removed": steps_removed})))
    }

    fn process_continue(&self, queue: &mut WorkflowQueue) -> Result<ProcessedStep, EngineError> {
        let Some(current) = queue.current_loop() else {
            return Err(EngineError::invalid_input("continue used outside of loop"));
        };
        let loop_id = current.loop_id.clone();
        let mut steps_removed = 0u32;
        while let Some(step) = queue.main_queue.front() {
            if step.id == loop_id {
                break;
            }
            queue.pop_next();
            steps_removed += 1;
        }
        Ok(ProcessedStep::not_executed(serde_json::json!({"steps_removed": steps_removed})))
    }

    pub fn prepare_shell_command(def: &Map<String, Value>) -> Result<ShellCommandSpec, EngineError> {
        let command = def
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::invalid_input("missing 'command' in shell_command step"))?
            .to_string();
        let working_directory = def.get("working_directory").and_then(Value::as_str).map(str::to_string);
        let timeout_secs = def.get("timeout").and_then(Value::as_u64).unwrap_or(DEFAULT_SHELL_TIMEOUT_SECS);
        let state_update = def.get("state_update").and_then(Value::as_object).and_then(|su| {
            let path = su.get("path")?.as_str()?.to_string();
            let value_source = su.get("value").and_then(Value::as_str).unwrap_or("stdout").to_string();
            Some((path, value_source))
        });
        Ok(ShellCommandSpec { command, working_directory, timeout_secs, state_update })
    }

    /// Spawn and await the command with no lock held. Never returns `Err` —
    /// failures and timeouts are represented as [`ShellOutcome`] variants so
    /// the workflow can always finish the step with a structured result.
    pub async fn run_shell_command(spec: &ShellCommandSpec) -> ShellOutcome {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&spec.command);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }

        match tokio::time::timeout(Duration::from_secs(spec.timeout_secs), cmd.output()).await {
            Ok(Ok(output)) => ShellOutcome::Completed {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                returncode: output.status.code().unwrap_or(-1),
            },
            Ok(Err(e)) => ShellOutcome::Failed(format!("command execution failed: {e}")),
            Err(_) => ShellOutcome::TimedOut,
        }
    }

    /// Apply the command's result: write any requested `state_update`, then
    /// build the step's `ProcessedStep`.
    pub fn finish_shell_command(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        def: &Map<String, Value>,
        spec: &ShellCommandSpec,
        outcome: ShellOutcome,
        global_vars: Option<&mut Map<String, Value>>,
    ) -> Result<ProcessedStep, EngineError> {
        let (output_json, result) = match outcome {
            ShellOutcome::TimedOut => {
                warn!("shell command timed out after {}s: {}", spec.timeout_secs, spec.command);
                return Ok(ProcessedStep::executed(
                    step.id.clone(),
                    "shell_command",
                    Value::Object(def.clone()),
                    serde_json::json!({
                        "status": "failed",
                        "error": format!("command timed out after {} seconds: {}", spec.timeout_secs, spec.command),
                        "timed_out": true,
                    }),
                ));
            }
            ShellOutcome::Failed(message) => {
                warn!("shell command failed: {message}");
                return Ok(ProcessedStep::executed(
                    step.id.clone(),
                    "shell_command",
                    Value::Object(def.clone()),
                    serde_json::json!({"status": "failed", "error": message}),
                ));
            }
            ShellOutcome::Completed { stdout, stderr, returncode } => {
                let output = serde_json::json!({
                    "stdout": stdout,
                    "stderr": stderr,
                    "returncode": returncode,
                    "command": spec.command,
                });
                (output, serde_json::json!({"status": "success", "output": output, "execution_type": "internal"}))
            }
        };

        if let Some((path, value_source)) = &spec.state_update {
            let value = match value_source.as_str() {
                "stdout" => Value::String(output_json["stdout"].as_str().unwrap_or("").trim().to_string()),
                "stderr" => Value::String(output_json["stderr"].as_str().unwrap_or("").trim().to_string()),
                "returncode" => output_json["returncode"].clone(),
                "full_output" => output_json.clone(),
                literal => Value::String(literal.to_string()),
            };
            self.apply(workflow_id, vec![StateUpdate::set(path.clone(), value)], global_vars)?;
        }

        Ok(ProcessedStep::executed(step.id.clone(), "shell_command", Value::Object(def.clone()), result))
    }
}

fn parse_operation(raw: Option<&str>) -> UpdateOperation {
    match raw {
        Some("append") => UpdateOperation::Append,
        Some("increment") => UpdateOperation::Increment,
        Some("merge") => UpdateOperation::Merge,
        _ => UpdateOperation::Set,
    }
}

/// Strip a condition/items expression of a single surrounding `{{ }}`, as
/// `step_processors.py` does before handing it to the evaluator.
pub fn strip_template_braces(raw: &str) -> String {
    let trimmed = raw.trim();
    single_template_body(trimmed).unwrap_or(trimmed).to_string()
}

fn single_template_body(trimmed: &str) -> Option<&str> {
    let after = trimmed.strip_prefix("{{")?;
    let end = after.find("}}")?;
    if end + 2 == after.len() {
        Some(after[..end].trim())
    } else {
        None
    }
}

fn eval_expr(expr: &str, state_view: &Value, loop_vars: &Value) -> Result<Value, workflow_expr::ExprError> {
    let ast = workflow_expr::parse(expr)?;
    let ctx = workflow_expr::ScopedContext::new()
        .with_global(state_view.clone())
        .with_inputs(state_view.get("inputs").cloned().unwrap_or(Value::Null))
        .with_loop_vars(loop_vars.clone());
    workflow_expr::evaluate(&ast, &ctx)
}

/// Recursively interpolate `{{expr}}` templates inside a step's JSON
/// definition, honoring `preserve_conditions`/`preserve_templates` opt-outs
/// exactly as `step_processors.py::_replace_variables` does.
pub fn replace_variables(
    value: &Value,
    state_view: &Value,
    loop_vars: &Value,
    preserve_conditions: bool,
    preserve_templates: bool,
) -> Value {
    match value {
        Value::Object(map) => {
            let preserved_keys: &[&str] = if preserve_conditions && map.contains_key("condition") {
                &["condition"]
            } else if preserve_templates && (map.contains_key("items") || map.contains_key("condition")) {
                &["items", "condition"]
            } else {
                &[]
            };
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                if preserved_keys.contains(&k.as_str()) {
                    out.insert(k.clone(), v.clone());
                } else {
                    out.insert(
                        k.clone(),
                        replace_variables(v, state_view, loop_vars, preserve_conditions, preserve_templates),
                    );
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| replace_variables(v, state_view, loop_vars, preserve_conditions, preserve_templates))
                .collect(),
        ),
        Value::String(s) => interpolate_string(s, state_view, loop_vars),
        other => other.clone(),
    }
}

fn interpolate_string(s: &str, state_view: &Value, loop_vars: &Value) -> Value {
    let trimmed = s.trim();
    if let Some(body) = single_template_body(trimmed) {
        return eval_expr(body, state_view, loop_vars)
            .map(|v| if v.is_null() { Value::String(String::new()) } else { v })
            .unwrap_or_else(|_| Value::String(String::new()));
    }

    if !s.contains("{{") {
        return Value::String(s.to_string());
    }

    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let expr = after_open[..end].trim();
        let value = eval_expr(expr, state_view, loop_vars).unwrap_or(Value::Null);
        out.push_str(&stringify(&value));
        rest = &after_open[end + 2..];
    }
    out.push_str(rest);
    Value::String(out)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_template_returns_typed_value() {
        let state = json!({"inputs": {"counter": 5}});
        let out = interpolate_string("{{ inputs.counter }}", &state, &Value::Null);
        assert_eq!(out, Value::from(5));
    }

    #[test]
    fn mixed_template_stringifies_each_match() {
        let state = json!({"inputs": {"name": "ada"}});
        let out = interpolate_string("hello {{ inputs.name }}!", &state, &Value::Null);
        assert_eq!(out, Value::String("hello ada!".to_string()));
    }

    #[test]
    fn preserve_conditions_keeps_condition_verbatim() {
        let def = json!({"condition": "{{ inputs.x > 0 }}", "message": "{{ inputs.name }}"});
        let state = json!({"inputs": {"x": 1, "name": "ada"}});
        let out = replace_variables(&def, &state, &Value::Null, true, false);
        assert_eq!(out["condition"], Value::String("{{ inputs.x > 0 }}".to_string()));
        assert_eq!(out["message"], Value::String("ada".to_string()));
    }

    #[test]
    fn strip_template_braces_unwraps_single_wrap() {
        assert_eq!(strip_template_braces("{{ inputs.x > 0 }}"), "inputs.x > 0");
        assert_eq!(strip_template_braces("inputs.x > 0"), "inputs.x > 0");
    }
}
