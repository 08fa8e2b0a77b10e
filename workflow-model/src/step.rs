// ABOUTME: WorkflowStep type and child-step extraction for nested step trees
// ABOUTME: Conditional/loop bodies are flattened into addressable child steps
//! A single node in a workflow's step tree.
//!
//! A step is an id, a type tag, and an arbitrary JSON payload (`definition`)
//! carrying whatever fields that step type requires. Keeping the payload as
//! `serde_json::Value` (rather than one Rust struct per step type) matches
//! the schema-less way workflow YAML documents are authored; the step
//! registry (`workflow_engine::registry`) is what gives each type its
//! required/optional field contract.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Execution-context override, only meaningful for `shell_command` steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContextHint {
    #[default]
    Server,
    Client,
}

fn is_default_execution_context(ctx: &ExecutionContextHint) -> bool {
    *ctx == ExecutionContextHint::Server
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    /// All fields other than `id`/`type`/`execution_context`, captured
    /// verbatim — this is what lets a YAML step like
    /// `{id: s1, type: user_message, message: "hi"}` round-trip without a
    /// bespoke struct per step type.
    #[serde(flatten)]
    pub definition: Map<String, Value>,
    #[serde(default, skip_serializing_if = "is_default_execution_context")]
    pub execution_context: ExecutionContextHint,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            definition: Map::new(),
            execution_context: ExecutionContextHint::default(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.definition.insert(key.into(), value.into());
        self
    }

    /// Build the child id for the `i`-th step of a conditional `then` branch.
    pub fn then_child_id(&self, i: usize) -> String {
        format!("{}.then.{}", self.id, i)
    }

    /// Build the child id for the `i`-th step of a conditional `else` branch.
    pub fn else_child_id(&self, i: usize) -> String {
        format!("{}.else.{}", self.id, i)
    }

    /// Build the child id for the `i`-th step of a loop body.
    pub fn body_child_id(&self, i: usize) -> String {
        format!("{}.body.{}", self.id, i)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.definition.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.definition.get(key).and_then(Value::as_str)
    }

    /// Parse `definition[key]` as a list of nested step definitions, producing
    /// child [`WorkflowStep`]s whose ids are derived via `id_fn`.
    pub fn child_steps(&self, key: &str, id_fn: impl Fn(usize) -> String) -> Vec<WorkflowStep> {
        let Some(Value::Array(items)) = self.definition.get(key) else {
            return Vec::new();
        };
        items
            .iter()
            .enumerate()
            .map(|(i, def)| step_from_value(id_fn(i), def))
            .collect()
    }
}

/// Convert a raw JSON step definition (as it appears nested inside a
/// `then_steps`/`else_steps`/`body` array) into a [`WorkflowStep`].
pub fn step_from_value(id: String, value: &Value) -> WorkflowStep {
    let mut definition = value.as_object().cloned().unwrap_or_default();
    let step_type = definition
        .remove("type")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    definition.remove("id");
    WorkflowStep {
        id,
        step_type,
        definition,
        execution_context: ExecutionContextHint::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn child_ids_match_original_naming_scheme() {
        let step = WorkflowStep::new("step_1", "conditional");
        assert_eq!(step.then_child_id(0), "step_1.then.0");
        assert_eq!(step.else_child_id(2), "step_1.else.2");
        assert_eq!(step.body_child_id(1), "step_1.body.1");
    }

    #[test]
    fn child_steps_extracted_from_nested_array() {
        let step = WorkflowStep::new("s", "conditional").with_field(
            "then_steps",
            json!([{"type": "user_message", "message": "hi"}]),
        );
        let children = step.child_steps("then_steps", |i| step.then_child_id(i));
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "s.then.0");
        assert_eq!(children[0].step_type, "user_message");
        assert_eq!(children[0].field_str("message"), Some("hi"));
    }
}
