// ABOUTME: Per-tier state schema: input declarations and computed fields
// ABOUTME: Validates computed-field dependency lists and transform strings
//! Per-tier schema: input parameter declarations and computed-field
//! definitions.

use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// What to do when a computed field's transform fails to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    UseFallback,
    Propagate,
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputedFieldDefinition {
    /// Dependency paths this field is derived from, e.g. `["inputs.value"]`.
    pub from_paths: Vec<String>,
    /// Transform source (a JS-subset expression or pattern the transformation
    /// engine understands).
    pub transform: String,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default)]
    pub fallback: Value,
}

impl ComputedFieldDefinition {
    pub fn validate(&self, field_name: &str) -> Result<(), ModelError> {
        if self.from_paths.is_empty() {
            return Err(ModelError::InvalidComputedField {
                field: field_name.to_string(),
                reason: "from_paths cannot be empty".to_string(),
            });
        }
        if self.transform.trim().is_empty() {
            return Err(ModelError::InvalidComputedField {
                field: field_name.to_string(),
                reason: "transform cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Raw per-tier schema as authored in YAML: `{ from: ..., transform: ..., on_error: ..., fallback: ... }`
/// entries for `computed`, and loose type names for `inputs`/`state` (used for
/// documentation/validation by the out-of-scope schema validator, not enforced
/// here).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateSchema {
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    #[serde(default)]
    pub state: HashMap<String, String>,
    #[serde(default)]
    pub computed: HashMap<String, ComputedFieldDefinition>,
}

impl StateSchema {
    pub fn validate(&self) -> Result<(), ModelError> {
        for (name, def) in &self.computed {
            def.validate(name)?;
        }
        Ok(())
    }
}

/// Declaration of a workflow (or sub-agent task) input parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDefinition {
    #[serde(rename = "type")]
    pub input_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub default: Value,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_dependency_list() {
        let def = ComputedFieldDefinition {
            from_paths: vec![],
            transform: "input".into(),
            on_error: OnError::default(),
            fallback: Value::Null,
        };
        assert!(def.validate("double").is_err());
    }

    #[test]
    fn rejects_empty_transform() {
        let def = ComputedFieldDefinition {
            from_paths: vec!["inputs.x".into()],
            transform: "   ".into(),
            on_error: OnError::default(),
            fallback: Value::Null,
        };
        assert!(def.validate("double").is_err());
    }
}
