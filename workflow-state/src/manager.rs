// ABOUTME: Three-tier reactive state manager
// ABOUTME: inputs/state/computed tiers, path validation, atomic updates, cascading recomputation

use crate::deps::{DependencyIndex, ResolvedField};
use crate::error::StateError;
use crate::update::{StateUpdate, UpdateOperation};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use workflow_model::StateSchema;

/// A workflow's full state: immutable inputs, freely-writable working state,
/// and derived computed fields. `raw` is a read/write alias of `inputs`
/// rather than a fourth tier.
#[derive(Debug, Clone, Default)]
pub struct WorkflowState {
    pub inputs: Map<String, Value>,
    pub state: Map<String, Value>,
    pub computed: Map<String, Value>,
}

/// Scope a write path resolves to. `Loop` and unknown scopes are rejected by
/// [`StateManager::validate_update_path`] before any write is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    This,
    Global,
    Inputs,
    State,
}

fn classify_scope(scope: &str) -> Option<Scope> {
    match scope {
        "this" => Some(Scope::This),
        "global" => Some(Scope::Global),
        "inputs" | "raw" => Some(Scope::Inputs),
        "state" => Some(Scope::State),
        _ => None,
    }
}

pub struct StateManager {
    schema: StateSchema,
    deps: DependencyIndex,
    transformer: Arc<dyn workflow_expr::Transformer>,
    states: Mutex<HashMap<String, Arc<Mutex<WorkflowState>>>>,
}

impl StateManager {
    pub fn new(schema: StateSchema) -> Result<Self, StateError> {
        Self::with_transformer(schema, Arc::new(workflow_expr::EvaluatorTransformer))
    }

    pub fn with_transformer(
        schema: StateSchema,
        transformer: Arc<dyn workflow_expr::Transformer>,
    ) -> Result<Self, StateError> {
        schema
            .validate()
            .map_err(|e| StateError::InvalidOperation {
                field: "state_schema".to_string(),
                operation: "validate".to_string(),
                reason: e.to_string(),
            })?;
        let deps = DependencyIndex::build(&schema)?;
        Ok(Self {
            schema,
            deps,
            transformer,
            states: Mutex::new(HashMap::new()),
        })
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    /// Writable paths need a `scope.field` shape with a non-empty field and
    /// no empty path segments. `loop.*` and unrecognized scopes are
    /// read-only or invalid and are rejected here, before any state is
    /// touched.
    pub fn validate_update_path(&self, path: &str) -> Result<(), StateError> {
        if path.is_empty() || !path.contains('.') {
            return Err(StateError::InvalidPath(path.to_string()));
        }
        if path.contains("..") || path.ends_with('.') {
            return Err(StateError::InvalidPath(path.to_string()));
        }
        let (scope, field) = path.split_once('.').unwrap();
        if field.is_empty() || field.starts_with('.') {
            return Err(StateError::InvalidPath(path.to_string()));
        }
        match scope {
            "loop" => Err(StateError::PermissionDenied(path.to_string())),
            "computed" => Err(StateError::PermissionDenied(path.to_string())),
            _ if classify_scope(scope).is_some() => Ok(()),
            _ => Err(StateError::InvalidPath(path.to_string())),
        }
    }

    fn workflow_cell(&self, workflow_id: &str) -> Arc<Mutex<WorkflowState>> {
        let mut states = self.states.lock();
        states
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(WorkflowState::default())))
            .clone()
    }

    fn existing_workflow(&self, workflow_id: &str) -> Result<Arc<Mutex<WorkflowState>>, StateError> {
        self.states
            .lock()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| StateError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Insert a workflow's initial inputs/state tiers directly — used when a
    /// run starts from a workflow definition's `default_state`/resolved
    /// inputs rather than through `update`.
    pub fn seed(&self, workflow_id: &str, inputs: Map<String, Value>, state: Map<String, Value>) {
        let cell = self.workflow_cell(workflow_id);
        let mut guard = cell.lock();
        guard.inputs = inputs;
        guard.state = state;
    }

    /// Nested view: `{inputs, computed, state, raw}`, `raw` aliasing
    /// `inputs`. Computed fields are refreshed before being read.
    pub fn read(&self, workflow_id: &str) -> Result<Value, StateError> {
        let cell = self.existing_workflow(workflow_id)?;
        let mut state = cell.lock();
        self.recompute_all(&mut state)?;
        Ok(nested_view(&state))
    }

    /// Apply a batch of updates atomically: either all updates and any
    /// cascading recomputation succeed, or the workflow's state is rolled
    /// back to what it was before the call.
    pub fn update(
        &self,
        workflow_id: &str,
        updates: &[StateUpdate],
        mut global_vars: Option<&mut Map<String, Value>>,
    ) -> Result<Value, StateError> {
        for update in updates {
            self.validate_update_path(&update.path)?;
        }

        let cell = self.workflow_cell(workflow_id);
        let mut state = cell.lock();
        let snapshot = state.clone();

        let result = (|| {
            let mut changed_paths = Vec::with_capacity(updates.len());
            for update in updates {
                self.apply_update(&mut state, update, global_vars.as_deref_mut())?;
                changed_paths.push(update.path.clone());
            }
            if !self.deps.is_empty() {
                self.recompute_affected(&mut state, &changed_paths)?;
            }
            Ok(flattened_view(&state))
        })();

        if let Err(e) = &result {
            debug!("update rolled back for workflow {workflow_id}: {e}");
            *state = snapshot;
        }
        result
    }

    fn apply_update(
        &self,
        state: &mut WorkflowState,
        update: &StateUpdate,
        global_vars: Option<&mut Map<String, Value>>,
    ) -> Result<(), StateError> {
        let (scope_name, field_path) = update.path.split_once('.').unwrap();
        let scope = classify_scope(scope_name).ok_or_else(|| StateError::InvalidPath(update.path.clone()))?;

        match scope {
            Scope::This | Scope::State => apply_nested_update(
                &mut state.state,
                field_path,
                update.value.clone(),
                update.operation,
            ),
            Scope::Inputs => apply_nested_update(
                &mut state.inputs,
                field_path,
                update.value.clone(),
                update.operation,
            ),
            Scope::Global => {
                let global_vars = global_vars.ok_or_else(|| StateError::InvalidOperation {
                    field: update.path.clone(),
                    operation: "global write".to_string(),
                    reason: "no execution context global scope was provided".to_string(),
                })?;
                apply_nested_update(global_vars, field_path, update.value.clone(), update.operation)
            }
        }
    }

    fn recompute_all(&self, state: &mut WorkflowState) -> Result<(), StateError> {
        if self.deps.is_empty() {
            return Ok(());
        }
        let fields: Vec<String> = self.deps.all_fields_in_order().to_vec();
        for field_name in fields {
            self.compute_field(state, &field_name)?;
        }
        Ok(())
    }

    fn recompute_affected(
        &self,
        state: &mut WorkflowState,
        changed_paths: &[String],
    ) -> Result<(), StateError> {
        for field_name in self.deps.affected_fields(changed_paths) {
            self.compute_field(state, &field_name)?;
        }
        Ok(())
    }

    fn compute_field(&self, state: &mut WorkflowState, field_name: &str) -> Result<(), StateError> {
        let field = self
            .deps
            .field(field_name)
            .expect("field_name comes from the dependency index itself")
            .clone();

        let inputs: Vec<Value> = field
            .dependencies
            .iter()
            .map(|path| get_value_from_path(state, path))
            .collect();

        let input = if inputs.len() == 1 {
            inputs.into_iter().next().unwrap()
        } else {
            Value::Array(inputs)
        };

        let ctx = workflow_expr::ScopedContext::new();
        match self.transformer.transform(&field.transform, &input, &ctx) {
            Ok(value) => {
                state.computed.insert(field_name.to_string(), value);
                Ok(())
            }
            Err(e) => self.handle_computation_error(state, field_name, &field, e),
        }
    }

    fn handle_computation_error(
        &self,
        state: &mut WorkflowState,
        field_name: &str,
        field: &ResolvedField,
        error: workflow_expr::TransformError,
    ) -> Result<(), StateError> {
        use workflow_model::OnError;
        match field.on_error {
            OnError::UseFallback => {
                debug!("computed field '{field_name}' failed, using fallback: {error}");
                state.computed.insert(field_name.to_string(), field.fallback.clone());
                Ok(())
            }
            OnError::Propagate => Err(StateError::ComputedFieldError(field_name.to_string(), error)),
            OnError::Ignore => {
                debug!("computed field '{field_name}' failed, ignoring: {error}");
                state.computed.remove(field_name);
                Ok(())
            }
        }
    }
}

fn apply_nested_update(
    target: &mut Map<String, Value>,
    field_path: &str,
    value: Value,
    operation: UpdateOperation,
) -> Result<(), StateError> {
    let parts: Vec<&str> = field_path.split('.').collect();
    let (final_key, parents) = parts.split_last().unwrap();

    let mut current = target;
    for part in parents {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = entry
            .as_object_mut()
            .ok_or_else(|| StateError::NotAnObject((*part).to_string()))?;
    }

    match operation {
        UpdateOperation::Set => {
            current.insert(final_key.to_string(), value);
        }
        UpdateOperation::Append => {
            let slot = current
                .entry(final_key.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            let Value::Array(items) = slot else {
                return Err(StateError::InvalidOperation {
                    field: final_key.to_string(),
                    operation: "append".to_string(),
                    reason: "target is not a list".to_string(),
                });
            };
            items.push(value);
        }
        UpdateOperation::Increment => {
            let slot = current
                .entry(final_key.to_string())
                .or_insert(Value::Number(0.into()));
            let current_n = slot.as_f64().ok_or_else(|| StateError::InvalidOperation {
                field: final_key.to_string(),
                operation: "increment".to_string(),
                reason: "target is not a number".to_string(),
            })?;
            let delta = if value.is_null() { 1.0 } else { value.as_f64().unwrap_or(0.0) };
            *slot = serde_json::Number::from_f64(current_n + delta)
                .map(Value::Number)
                .unwrap_or(Value::Null);
        }
        UpdateOperation::Merge => {
            let slot = current
                .entry(final_key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            let Value::Object(existing) = slot else {
                return Err(StateError::InvalidOperation {
                    field: final_key.to_string(),
                    operation: "merge".to_string(),
                    reason: "target is not an object".to_string(),
                });
            };
            let Value::Object(incoming) = value else {
                return Err(StateError::InvalidOperation {
                    field: final_key.to_string(),
                    operation: "merge".to_string(),
                    reason: "value is not an object".to_string(),
                });
            };
            existing.extend(incoming);
        }
    }
    Ok(())
}

/// Resolve `tier.field.path` against the three tiers, with `raw` as an alias
/// for `inputs`. Missing intermediate keys resolve to `Value::Null` rather
/// than erroring, matching how a not-yet-computed dependency reads.
fn get_value_from_path(state: &WorkflowState, path: &str) -> Value {
    let Some((tier, field_path)) = path.split_once('.') else {
        return Value::Null;
    };
    let tier = if tier == "raw" { "inputs" } else { tier };
    let source = match tier {
        "inputs" => &state.inputs,
        "computed" => &state.computed,
        "state" => &state.state,
        _ => return Value::Null,
    };

    let mut parts = field_path.split('.');
    let mut current: &Value = match source.get(parts.next().unwrap_or(field_path)) {
        Some(v) => v,
        None => return Value::Null,
    };
    for part in parts {
        match current.as_object().and_then(|m| m.get(part)) {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn nested_view(state: &WorkflowState) -> Value {
    serde_json::json!({
        "inputs": state.inputs,
        "computed": state.computed,
        "state": state.state,
        "raw": state.inputs,
    })
}

/// Flattened view used as the return value of `update`: `state` < `inputs` <
/// `computed` in precedence, each tier's keys merged into one object.
fn flattened_view(state: &WorkflowState) -> Value {
    let mut flat = state.state.clone();
    flat.extend(state.inputs.clone());
    flat.extend(state.computed.clone());
    Value::Object(flat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_model::ComputedFieldDefinition;

    fn schema_with_double() -> StateSchema {
        let mut schema = StateSchema::default();
        schema.computed.insert(
            "double".to_string(),
            ComputedFieldDefinition {
                from_paths: vec!["inputs.counter".to_string()],
                transform: "input * 2".to_string(),
                on_error: Default::default(),
                fallback: Value::Null,
            },
        );
        schema
    }

    #[test]
    fn rejects_unwritable_loop_scope() {
        let manager = StateManager::new(StateSchema::default()).unwrap();
        assert!(matches!(
            manager.validate_update_path("loop.index"),
            Err(StateError::PermissionDenied(_))
        ));
    }

    #[test]
    fn rejects_writes_to_computed_scope() {
        let manager = StateManager::new(StateSchema::default()).unwrap();
        assert!(matches!(
            manager.validate_update_path("computed.double"),
            Err(StateError::PermissionDenied(_))
        ));
    }

    #[test]
    fn rejects_unknown_scope() {
        let manager = StateManager::new(StateSchema::default()).unwrap();
        assert!(matches!(
            manager.validate_update_path("bogus.field"),
            Err(StateError::InvalidPath(_))
        ));
    }

    #[test]
    fn update_then_read_recomputes_computed_field() {
        let manager = StateManager::new(schema_with_double()).unwrap();
        manager
            .update(
                "wf1",
                &[StateUpdate::set("inputs.counter", Value::from(21))],
                None,
            )
            .unwrap();
        let view = manager.read("wf1").unwrap();
        assert_eq!(view["computed"]["double"], Value::from(42));
    }

    #[test]
    fn failed_update_rolls_back_state() {
        let manager = StateManager::new(StateSchema::default()).unwrap();
        manager
            .update("wf1", &[StateUpdate::set("state.counter", Value::from(1))], None)
            .unwrap();
        let bad = StateUpdate {
            path: "state.counter".to_string(),
            value: Value::from(5),
            operation: UpdateOperation::Append,
        };
        assert!(manager.update("wf1", &[bad], None).is_err());
        let view = manager.read("wf1").unwrap();
        assert_eq!(view["state"]["counter"], Value::from(1));
    }

    #[test]
    fn raw_is_an_alias_of_inputs() {
        let manager = StateManager::new(StateSchema::default()).unwrap();
        manager
            .update("wf1", &[StateUpdate::set("raw.name", Value::from("ok"))], None)
            .unwrap();
        let view = manager.read("wf1").unwrap();
        assert_eq!(view["inputs"]["name"], Value::from("ok"));
        assert_eq!(view["raw"]["name"], Value::from("ok"));
    }

    #[test]
    fn global_write_requires_context() {
        let manager = StateManager::new(StateSchema::default()).unwrap();
        let err = manager
            .update("wf1", &[StateUpdate::set("global.version", Value::from(1))], None)
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidOperation { .. }));
    }
}
