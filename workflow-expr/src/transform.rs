// ABOUTME: Computed-field transformation backends
// ABOUTME: EvaluatorTransformer is default, JsEngineTransformer is feature-gated
//! Computed-field transformation backends.
//!
//! A computed field's `transform` string is evaluated against a single bound
//! name, `input`, plus the full [`ScopedContext`] for transforms that need to
//! reach into sibling state. Two backends implement [`Transformer`]:
//! [`EvaluatorTransformer`] (default — the expression evaluator plus a small
//! library of common patterns that aren't valid standalone expressions, such
//! as template literals) and, behind the `js-transforms` feature,
//! [`JsEngineTransformer`], which hands the string to a real JS engine for
//! full language coverage.

use crate::context::ScopedContext;
use crate::error::TransformError;
use crate::parser::parse;
use serde_json::Value;

pub trait Transformer: Send + Sync {
    fn transform(&self, expression: &str, input: &Value, ctx: &ScopedContext) -> Result<Value, TransformError>;
}

#[derive(Debug, Default)]
pub struct EvaluatorTransformer;

impl EvaluatorTransformer {
    fn input_ctx(input: &Value, ctx: &ScopedContext) -> ScopedContext {
        let mut inner = ctx.clone();
        inner.this = input.clone();
        inner
    }

    /// Patterns the bare evaluator can't parse as an expression but that show
    /// up constantly in computed-field transforms: template literals and a
    /// couple of `Math.*` calls.
    fn try_pattern(expression: &str, input: &Value, ctx: &ScopedContext) -> Option<Value> {
        let trimmed = expression.trim();

        if trimmed == "input" {
            return Some(input.clone());
        }

        if trimmed.starts_with('`') && trimmed.ends_with('`') && trimmed.len() >= 2 {
            return Some(Value::String(render_template(
                &trimmed[1..trimmed.len() - 1],
                input,
                ctx,
            )));
        }

        if let Some(inner) = trimmed
            .strip_prefix("Math.round(")
            .and_then(|s| s.strip_suffix(')'))
        {
            let inner_ctx = Self::input_ctx(input, ctx);
            let value = crate::eval::evaluate(&parse(inner).ok()?, &inner_ctx).ok()?;
            let n = value.as_f64()?;
            return Some(Value::Number((n.round() as i64).into()));
        }

        if let Some(inner) = trimmed
            .strip_prefix("Math.floor(")
            .and_then(|s| s.strip_suffix(')'))
        {
            let inner_ctx = Self::input_ctx(input, ctx);
            let value = crate::eval::evaluate(&parse(inner).ok()?, &inner_ctx).ok()?;
            let n = value.as_f64()?;
            return Some(Value::Number((n.floor() as i64).into()));
        }

        None
    }
}

impl Transformer for EvaluatorTransformer {
    fn transform(
        &self,
        expression: &str,
        input: &Value,
        ctx: &ScopedContext,
    ) -> Result<Value, TransformError> {
        if let Some(value) = Self::try_pattern(expression, input, ctx) {
            return Ok(value);
        }

        let inner_ctx = Self::input_ctx(input, ctx);
        let ast = parse(expression)?;
        let value = crate::eval::evaluate(&ast, &inner_ctx)?;
        Ok(value)
    }
}

/// Render a template literal body (the part between backticks), substituting
/// `${expr}` segments by evaluating `expr` with `input` bound to `this`.
fn render_template(body: &str, input: &Value, ctx: &ScopedContext) -> String {
    let mut out = String::new();
    let mut rest = body;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let inner_expr = &after[..end];
        let inner_ctx = EvaluatorTransformer::input_ctx(input, ctx);
        let rendered = parse(inner_expr)
            .ok()
            .and_then(|ast| crate::eval::evaluate(&ast, &inner_ctx).ok())
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .unwrap_or_default();
        out.push_str(&rendered);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(feature = "js-transforms")]
pub struct JsEngineTransformer;

#[cfg(feature = "js-transforms")]
impl Default for JsEngineTransformer {
    fn default() -> Self {
        Self
    }
}

#[cfg(feature = "js-transforms")]
impl Transformer for JsEngineTransformer {
    fn transform(
        &self,
        expression: &str,
        input: &Value,
        ctx: &ScopedContext,
    ) -> Result<Value, TransformError> {
        use boa_engine::{Context, Source};

        let mut engine = Context::default();
        bind_global(&mut engine, "input", input)?;
        bind_global(&mut engine, "this", &ctx.this)?;
        bind_global(&mut engine, "global", &ctx.global)?;
        bind_global(&mut engine, "loop", &ctx.loop_vars)?;
        bind_global(&mut engine, "inputs", &ctx.inputs)?;

        let result = engine.eval(Source::from_bytes(expression)).map_err(|e| {
            tracing::debug!("js transform failed for '{expression}': {e}");
            TransformError::JsEngine(e.to_string())
        })?;
        let json = result
            .to_json(&mut engine)
            .map_err(|e| TransformError::JsEngine(e.to_string()))?;
        Ok(json)
    }
}

#[cfg(feature = "js-transforms")]
fn bind_global(
    engine: &mut boa_engine::Context,
    name: &str,
    value: &Value,
) -> Result<(), TransformError> {
    use boa_engine::JsValue;

    let js_value = JsValue::from_json(value, engine).map_err(|e| TransformError::JsEngine(e.to_string()))?;
    engine
        .global_object()
        .set(name, js_value, false, engine)
        .map_err(|e| TransformError::JsEngine(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_plain_arithmetic_expression() {
        let t = EvaluatorTransformer;
        let ctx = ScopedContext::new();
        let result = t.transform("input * 2", &Value::Number(21.into()), &ctx).unwrap();
        assert_eq!(result, Value::Number(42.into()));
    }

    #[test]
    fn renders_template_literal() {
        let t = EvaluatorTransformer;
        let ctx = ScopedContext::new();
        let result = t
            .transform("`total: ${input}`", &Value::Number(3.into()), &ctx)
            .unwrap();
        assert_eq!(result, Value::String("total: 3".to_string()));
    }

    #[test]
    fn math_round_pattern() {
        let t = EvaluatorTransformer;
        let ctx = ScopedContext::new();
        let result = t
            .transform("Math.round(input)", &Value::from(3.6), &ctx)
            .unwrap();
        assert_eq!(result, Value::Number(4.into()));
    }

    #[test]
    fn input_length_pattern() {
        let t = EvaluatorTransformer;
        let ctx = ScopedContext::new();
        let result = t
            .transform("input.length", &Value::String("hello".into()), &ctx)
            .unwrap();
        assert_eq!(result, Value::Number(5.into()));
    }
}
