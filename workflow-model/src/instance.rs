// ABOUTME: Runtime instance bookkeeping for running workflows
// ABOUTME: WorkflowInstance tracks overall status, StepExecution tracks a step run
//! Runtime instance bookkeeping: `WorkflowInstance` and `StepExecution`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl WorkflowInstance {
    /// `wf_<8 hex chars>`.
    pub fn fresh_id() -> String {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        format!("wf_{}", &hex[..8])
    }

    pub fn new(id: String, workflow_name: String) -> Self {
        Self {
            id,
            workflow_name,
            status: WorkflowStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }

    pub fn mark_completed(&mut self) {
        if self.status != WorkflowStatus::Failed {
            self.status = WorkflowStatus::Completed;
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = WorkflowStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub workflow_id: String,
    pub step_id: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
}

impl StepExecution {
    pub fn started(workflow_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            step_id: step_id.into(),
            status: StepStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            error_message: None,
        }
    }

    pub fn complete(&mut self, result: Option<Value>) {
        self.status = StepStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = result;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_id_has_expected_shape() {
        let id = WorkflowInstance::fresh_id();
        assert!(id.starts_with("wf_"));
        assert_eq!(id.len(), "wf_".len() + 8);
    }

    #[test]
    fn failed_status_is_sticky_against_completion() {
        let mut inst = WorkflowInstance::new("wf_1".into(), "demo".into());
        inst.mark_failed("boom");
        inst.mark_completed();
        assert_eq!(inst.status, WorkflowStatus::Failed);
    }
}
