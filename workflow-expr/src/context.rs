// ABOUTME: Variable scope available to an expression while it evaluates
// ABOUTME: Binds the this/global/loop/inputs roots
//! Variable scope available to an expression while it evaluates.
//!
//! Four named roots are pre-bound: `this` (the value the expression is being
//! applied to, e.g. the current item in a `foreach`), `global` (the full
//! workflow state tree), `loop` (the enclosing loop's variables, if any),
//! and `inputs` (the workflow's input parameters). A bare identifier not
//! found among these roots is looked up as a top-level key of `global`,
//! which is what lets computed-field transforms reference state fields
//! directly by name.

use serde_json::{Map, Value};

#[derive(Debug, Clone, Default)]
pub struct ScopedContext {
    pub this: Value,
    pub global: Value,
    pub loop_vars: Value,
    pub inputs: Value,
}

impl ScopedContext {
    pub fn new() -> Self {
        Self {
            this: Value::Null,
            global: Value::Object(Map::new()),
            loop_vars: Value::Object(Map::new()),
            inputs: Value::Object(Map::new()),
        }
    }

    pub fn with_this(mut self, value: Value) -> Self {
        self.this = value;
        self
    }

    pub fn with_global(mut self, value: Value) -> Self {
        self.global = value;
        self
    }

    pub fn with_loop_vars(mut self, value: Value) -> Self {
        self.loop_vars = value;
        self
    }

    pub fn with_inputs(mut self, value: Value) -> Self {
        self.inputs = value;
        self
    }

    pub fn resolve(&self, name: &str) -> Option<&Value> {
        match name {
            "this" => Some(&self.this),
            "global" => Some(&self.global),
            "loop" => Some(&self.loop_vars),
            "inputs" => Some(&self.inputs),
            "true" => None,
            "false" => None,
            other => self.global.as_object().and_then(|m| m.get(other)),
        }
    }
}
