// ABOUTME: Error types for expression parsing/evaluation and transforms
// ABOUTME: ExprError covers the evaluator, TransformError wraps it for callers
//! Error types for expression parsing/evaluation and computed-field
//! transformation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("unexpected token: expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String },

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("cannot index into non-object/array value with '{0}'")]
    NotIndexable(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("unsupported operation '{op}' on value of type {ty}")]
    UnsupportedOperation { op: String, ty: &'static str },
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error("transform '{0}' matched no known pattern and no expression backend is available")]
    NoMatch(String),

    #[error("js engine error: {0}")]
    JsEngine(String),
}
