// ABOUTME: Frame/global-variable execution context and the manager that keys it by workflow id
// ABOUTME: Grounded on original_source/.../workflow/context.py, with a bounded frame depth

//! Execution context: the frame stack and global variable map carried
//! alongside a workflow's [`crate::queue::WorkflowQueue`].
//!
//! `original_source/.../workflow/context.py` keeps `StackFrame`/`LoopState`
//! bookkeeping separate from `queue.py`'s own loop stack, tracking
//! overlapping nesting concepts in two places. This port consolidates: loop
//! iteration state lives solely in [`crate::queue::LoopContext`] (used by the
//! step processor to drive control flow), and `ExecutionContext` here owns
//! only the frame stack and the global variable map a `global.*` state write
//! resolves against.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::ContextError;

/// Frames bounded deeper than this raise [`ContextError::FrameDepthExceeded`].
/// The original Python `ExecutionContext.max_depth` defaulted to 100; this is
/// raised to 256 as a conservative engineering default since nothing in the
/// source material pins the number (see `DESIGN.md`).
pub const MAX_FRAME_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Workflow,
    Conditional,
    Loop,
}

/// One level of step-list traversal: a workflow's top-level steps, or a
/// conditional/loop body being walked independently of the parent's position.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub frame_id: String,
    pub frame_type: FrameType,
    pub step_id: Option<String>,
    pub current_step_index: usize,
    pub step_count: usize,
    pub local_variables: Map<String, Value>,
}

impl StackFrame {
    pub fn new(frame_id: impl Into<String>, frame_type: FrameType, step_id: Option<String>, step_count: usize) -> Self {
        Self {
            frame_id: frame_id.into(),
            frame_type,
            step_id,
            current_step_index: 0,
            step_count,
            local_variables: Map::new(),
        }
    }

    pub fn has_more_steps(&self) -> bool {
        self.current_step_index < self.step_count
    }

    pub fn advance(&mut self) {
        self.current_step_index += 1;
    }
}

/// Per-workflow execution bookkeeping: bounded frame stack plus global
/// variables writable through `global.*` state updates.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow_id: String,
    frames: Vec<StackFrame>,
    pub global_variables: Map<String, Value>,
    max_depth: usize,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            frames: Vec::new(),
            global_variables: Map::new(),
            max_depth: MAX_FRAME_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn push_frame(&mut self, frame: StackFrame) -> Result<(), ContextError> {
        if self.frames.len() >= self.max_depth {
            return Err(ContextError::FrameDepthExceeded(self.max_depth));
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop_frame(&mut self) -> Option<StackFrame> {
        self.frames.pop()
    }

    pub fn current_frame(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut StackFrame> {
        self.frames.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn set_global_variable(&mut self, key: impl Into<String>, value: Value) {
        self.global_variables.insert(key.into(), value);
    }

    pub fn get_global_variable(&self, key: &str) -> Option<&Value> {
        self.global_variables.get(key)
    }

    /// `{"global": ..., "local": ...}` — the scoped-variable summary exposed
    /// to diagnostics; loop variables are merged in separately by the step
    /// processor from the active [`crate::queue::LoopContext`] since loop
    /// nesting lives in the queue, not here.
    pub fn scoped_variables(&self) -> Value {
        let local = self
            .current_frame()
            .map(|f| Value::Object(f.local_variables.clone()))
            .unwrap_or(Value::Object(Map::new()));
        serde_json::json!({
            "global": self.global_variables,
            "local": local,
        })
    }
}

/// Registry of active [`ExecutionContext`]s keyed by workflow id, mirroring
/// `context.py`'s module-level `context_manager` singleton as an owned,
/// instantiable type instead of process-global state.
#[derive(Debug, Default)]
pub struct ExecutionContextManager {
    contexts: HashMap<String, ExecutionContext>,
}

impl ExecutionContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_context(&mut self, workflow_id: impl Into<String>) -> &mut ExecutionContext {
        let workflow_id = workflow_id.into();
        self.contexts
            .entry(workflow_id.clone())
            .or_insert_with(|| ExecutionContext::new(workflow_id))
    }

    pub fn get_context(&self, workflow_id: &str) -> Option<&ExecutionContext> {
        self.contexts.get(workflow_id)
    }

    pub fn get_context_mut(&mut self, workflow_id: &str) -> Option<&mut ExecutionContext> {
        self.contexts.get_mut(workflow_id)
    }

    pub fn remove_context(&mut self, workflow_id: &str) -> Option<ExecutionContext> {
        self.contexts.remove(workflow_id)
    }

    pub fn list_active_contexts(&self) -> Vec<&str> {
        self.contexts.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_depth_is_bounded() {
        let mut ctx = ExecutionContext::new("wf1").with_max_depth(2);
        ctx.push_frame(StackFrame::new("f1", FrameType::Workflow, None, 0)).unwrap();
        ctx.push_frame(StackFrame::new("f2", FrameType::Loop, None, 0)).unwrap();
        let err = ctx.push_frame(StackFrame::new("f3", FrameType::Loop, None, 0)).unwrap_err();
        assert!(matches!(err, ContextError::FrameDepthExceeded(2)));
    }

    #[test]
    fn global_variables_round_trip() {
        let mut ctx = ExecutionContext::new("wf1");
        ctx.set_global_variable("attempt", Value::from(1));
        assert_eq!(ctx.get_global_variable("attempt"), Some(&Value::from(1)));
    }

    #[test]
    fn manager_creates_and_removes_contexts() {
        let mut manager = ExecutionContextManager::new();
        manager.create_context("wf1");
        assert!(manager.get_context("wf1").is_some());
        manager.remove_context("wf1");
        assert!(manager.get_context("wf1").is_none());
    }
}
