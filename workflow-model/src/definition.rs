// ABOUTME: WorkflowDefinition and SubAgentTask, the loaded-from-YAML shape
// ABOUTME: of a workflow and its sub-agent tasks
//! `WorkflowDefinition` and `SubAgentTask` — the immutable, loaded-from-YAML
//! description of a workflow.

use crate::schema::{InputDefinition, StateSchema};
use crate::step::WorkflowStep;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: HashMap<String, InputDefinition>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub prompt_template: String,
    #[serde(default)]
    pub default_state: Map<String, Value>,
    #[serde(default)]
    pub state_schema: StateSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// `namespace:name`.
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub default_state: Map<String, Value>,
    #[serde(default)]
    pub state_schema: StateSchema,
    #[serde(default)]
    pub inputs: HashMap<String, InputDefinition>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub sub_agent_tasks: HashMap<String, SubAgentTask>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl WorkflowDefinition {
    pub fn sub_agent_task(&self, name: &str) -> Option<&SubAgentTask> {
        self.sub_agent_tasks.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_yaml_shaped_json() {
        let raw = serde_json::json!({
            "name": "demo:increment",
            "inputs": {"counter": {"type": "number", "required": true}},
            "state_schema": {
                "computed": {
                    "double": {"from_paths": ["inputs.counter"], "transform": "input * 2"}
                }
            },
            "steps": [{"id": "s1", "type": "user_message", "message": "hi"}]
        });
        let def: WorkflowDefinition = serde_json::from_value(raw).unwrap();
        assert_eq!(def.name, "demo:increment");
        assert_eq!(def.steps.len(), 1);
        assert!(def.state_schema.computed.contains_key("double"));
    }
}
