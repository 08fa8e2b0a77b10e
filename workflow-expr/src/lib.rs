// ABOUTME: Expression evaluator and computed-field transformation engine
// ABOUTME: Lexer/parser/eval for a JS-subset grammar plus a Transformer trait
//! Expression evaluator and computed-field transformation engine.
//!
//! [`parser::parse`] turns a JS-subset expression string into an
//! [`ast::Expr`]; [`eval::evaluate`] walks it against a [`context::ScopedContext`]
//! exposing the `this`/`global`/`loop`/`inputs` roots a workflow step or
//! computed field can reference. [`transform::Transformer`] wraps that
//! evaluator (plus a small pattern library for template literals and common
//! `Math.*` calls) behind a trait so a caller can swap in a full JS engine
//! via the `js-transforms` feature without changing the call site.

pub mod ast;
pub mod context;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod transform;

pub use context::ScopedContext;
pub use error::{ExprError, TransformError};
pub use eval::{evaluate, truthy};
pub use parser::parse;
pub use transform::{EvaluatorTransformer, Transformer};

#[cfg(feature = "js-transforms")]
pub use transform::JsEngineTransformer;
