// ABOUTME: Update operation types shared by StateManager and ConcurrentStateManager

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOperation {
    #[default]
    Set,
    Append,
    Increment,
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdate {
    pub path: String,
    pub value: Value,
    #[serde(default)]
    pub operation: UpdateOperation,
}

impl StateUpdate {
    pub fn set(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
            operation: UpdateOperation::Set,
        }
    }
}
