// ABOUTME: Per-workflow step queue: main FIFO, loop contexts, and transient client/server-completed lists
// ABOUTME: Grounded on original_source/.../workflow/queue.py

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use workflow_model::WorkflowStep;

/// Which kind of loop pushed this context, used only for diagnostics —
/// the control-flow handlers identify "their" context by `loop_id`, not kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    While,
    Foreach,
    ParallelForeach,
}

/// Tracks one active loop's iteration state across repeated visits to the
/// same `while_loop`/`foreach` step as its body gets prepended and
/// re-executed. One `LoopContext` per nesting level; `WorkflowQueue::loop_stack`
/// is the full nesting, innermost last.
#[derive(Debug, Clone)]
pub struct LoopContext {
    pub loop_id: String,
    pub kind: LoopKind,
    pub iteration: u32,
    pub max_iterations: u32,
    pub items: Option<Vec<Value>>,
    pub index: usize,
    pub variable_name: String,
    pub index_name: String,
}

impl LoopContext {
    pub fn while_loop(loop_id: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            loop_id: loop_id.into(),
            kind: LoopKind::While,
            iteration: 0,
            max_iterations,
            items: None,
            index: 0,
            variable_name: "item".to_string(),
            index_name: "index".to_string(),
        }
    }

    pub fn foreach(loop_id: impl Into<String>, items: Vec<Value>) -> Self {
        Self {
            loop_id: loop_id.into(),
            kind: LoopKind::Foreach,
            iteration: 0,
            max_iterations: 100,
            items: Some(items),
            index: 0,
            variable_name: "item".to_string(),
            index_name: "index".to_string(),
        }
    }

    /// The `loop.*` bindings visible to expressions evaluated while this
    /// context is the innermost active loop.
    pub fn bindings(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self.kind {
            LoopKind::While => {
                map.insert("iteration".to_string(), Value::from(self.iteration + 1));
            }
            LoopKind::Foreach | LoopKind::ParallelForeach => {
                let item = self
                    .items
                    .as_ref()
                    .and_then(|items| items.get(self.index))
                    .cloned()
                    .unwrap_or(Value::Null);
                map.insert(self.variable_name.clone(), item);
                map.insert(self.index_name.clone(), Value::from(self.index as u64));
            }
        }
        map
    }
}

/// One step queued for the client, ready to serialize into a
/// `workflow_get_next_step` response.
#[derive(Debug, Clone, Serialize)]
pub struct ClientQueueEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    pub definition: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A workflow's pending-step FIFO plus the loop-context stack and transient
/// per-delivery client/server-completed lists.
///
/// Grounded on `queue.py`'s `WorkflowQueue`: `main_queue` is the working copy
/// of the step list (steps get popped off the front and, for control flow,
/// pushed back onto the front as expanded children); `client_queue` and
/// `server_completed` accumulate across one `get_next_step` call and are
/// cleared once delivered.
#[derive(Debug, Clone)]
pub struct WorkflowQueue {
    pub workflow_id: String,
    pub main_queue: VecDeque<WorkflowStep>,
    pub client_queue: Vec<ClientQueueEntry>,
    pub server_completed: Vec<Value>,
    pub loop_stack: Vec<LoopContext>,
}

impl WorkflowQueue {
    pub fn new(workflow_id: impl Into<String>, initial_steps: Vec<WorkflowStep>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            main_queue: initial_steps.into(),
            client_queue: Vec::new(),
            server_completed: Vec::new(),
            loop_stack: Vec::new(),
        }
    }

    pub fn has_steps(&self) -> bool {
        !self.main_queue.is_empty()
    }

    pub fn peek_next(&self) -> Option<&WorkflowStep> {
        self.main_queue.front()
    }

    pub fn pop_next(&mut self) -> Option<WorkflowStep> {
        self.main_queue.pop_front()
    }

    /// Splice `steps` onto the front of the queue, preserving their order —
    /// matches `queue.py::prepend_steps`'s `steps + main_queue`.
    pub fn prepend_steps(&mut self, steps: Vec<WorkflowStep>) {
        for step in steps.into_iter().rev() {
            self.main_queue.push_front(step);
        }
    }

    pub fn push_loop_context(&mut self, ctx: LoopContext) {
        self.loop_stack.push(ctx);
    }

    pub fn pop_loop_context(&mut self) -> Option<LoopContext> {
        self.loop_stack.pop()
    }

    pub fn current_loop(&self) -> Option<&LoopContext> {
        self.loop_stack.last()
    }

    /// Find the loop context belonging to a given step id anywhere in the
    /// (possibly nested) stack — a `while_loop`/`foreach` step looks its own
    /// context up by id every time it's revisited, not just by checking the
    /// top of the stack.
    pub fn find_loop_mut(&mut self, loop_id: &str) -> Option<&mut LoopContext> {
        self.loop_stack.iter_mut().find(|ctx| ctx.loop_id == loop_id)
    }

    pub fn clear_client_queues(&mut self) {
        self.client_queue.clear();
        self.server_completed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend_preserves_order() {
        let mut queue = WorkflowQueue::new("wf1", vec![WorkflowStep::new("tail", "user_message")]);
        queue.prepend_steps(vec![
            WorkflowStep::new("a", "user_message"),
            WorkflowStep::new("b", "user_message"),
        ]);
        let ids: Vec<_> = queue.main_queue.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "tail"]);
    }

    #[test]
    fn loop_context_round_trips_by_id() {
        let mut queue = WorkflowQueue::new("wf1", vec![]);
        queue.push_loop_context(LoopContext::while_loop("loop1", 10));
        assert!(queue.find_loop_mut("loop1").is_some());
        assert!(queue.find_loop_mut("missing").is_none());
        assert!(queue.pop_loop_context().is_some());
        assert!(queue.current_loop().is_none());
    }
}
