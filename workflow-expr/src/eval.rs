// ABOUTME: Tree-walking evaluator over the parsed expression AST
// ABOUTME: Implements JS-style loose/strict equality and numeric coercion
//! Tree-walking evaluator over the parsed [`crate::ast::Expr`].

use crate::ast::{BinaryOp, Expr, LogicalOp, UnaryOp};
use crate::context::ScopedContext;
use crate::error::ExprError;
use serde_json::Value;

pub fn evaluate(expr: &Expr, ctx: &ScopedContext) -> Result<Value, ExprError> {
    match expr {
        Expr::Number(n) => Ok(serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        Expr::String(s) => Ok(Value::String(s.clone())),
        Expr::Boolean(b) => Ok(Value::Bool(*b)),
        Expr::Null => Ok(Value::Null),
        Expr::Identifier(name) => Ok(ctx.resolve(name).cloned().unwrap_or(Value::Null)),
        Expr::Array(items) => {
            let values = items
                .iter()
                .map(|item| evaluate(item, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(values))
        }
        Expr::Member { object, property } => {
            let obj = evaluate(object, ctx)?;
            Ok(member_access(&obj, property))
        }
        Expr::Index { object, index } => {
            let obj = evaluate(object, ctx)?;
            let idx = evaluate(index, ctx)?;
            Ok(index_access(&obj, &idx))
        }
        Expr::Unary { op, expr } => {
            let value = evaluate(expr, ctx)?;
            eval_unary(*op, &value)
        }
        Expr::Logical { op, left, right } => {
            let left_val = evaluate(left, ctx)?;
            match op {
                LogicalOp::And => {
                    if !truthy(&left_val) {
                        Ok(left_val)
                    } else {
                        evaluate(right, ctx)
                    }
                }
                LogicalOp::Or => {
                    if truthy(&left_val) {
                        Ok(left_val)
                    } else {
                        evaluate(right, ctx)
                    }
                }
            }
        }
        Expr::Binary { op, left, right } => {
            let left_val = evaluate(left, ctx)?;
            let right_val = evaluate(right, ctx)?;
            eval_binary(*op, &left_val, &right_val)
        }
        Expr::Ternary {
            condition,
            if_true,
            if_false,
        } => {
            if truthy(&evaluate(condition, ctx)?) {
                evaluate(if_true, ctx)
            } else {
                evaluate(if_false, ctx)
            }
        }
    }
}

fn member_access(obj: &Value, property: &str) -> Value {
    match obj {
        Value::Object(map) => map.get(property).cloned().unwrap_or(Value::Null),
        Value::Array(items) if property == "length" => {
            Value::Number(items.len().into())
        }
        Value::String(s) if property == "length" => Value::Number(s.chars().count().into()),
        _ => Value::Null,
    }
}

fn index_access(obj: &Value, index: &Value) -> Value {
    match (obj, index) {
        (Value::Array(items), Value::Number(n)) => {
            let i = n.as_f64().unwrap_or(-1.0);
            if i < 0.0 {
                Value::Null
            } else {
                items.get(i as usize).cloned().unwrap_or(Value::Null)
            }
        }
        (Value::Object(map), Value::String(key)) => map.get(key).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Null => Some(0.0),
        _ => None,
    }
}

fn number_value(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn eval_unary(op: UnaryOp, value: &Value) -> Result<Value, ExprError> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!truthy(value))),
        UnaryOp::Negate => {
            let n = as_number(value).ok_or(ExprError::UnsupportedOperation {
                op: "-".to_string(),
                ty: type_name(value),
            })?;
            Ok(number_value(-n))
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// JS-style loose equality: numeric coercion across type boundaries, but
/// `null` only equals `null` and objects/arrays compare by structural value.
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Array(_), _) | (_, Value::Array(_)) | (Value::Object(_), _) | (_, Value::Object(_)) => {
            left == right
        }
        _ => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => a == b,
            _ => left == right,
        },
    }
}

fn eval_binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    use BinaryOp::*;
    match op {
        Eq => Ok(Value::Bool(loose_eq(left, right))),
        NotEq => Ok(Value::Bool(!loose_eq(left, right))),
        StrictEq => Ok(Value::Bool(left == right)),
        StrictNotEq => Ok(Value::Bool(left != right)),
        Add => {
            if let (Value::String(_), _) | (_, Value::String(_)) = (left, right) {
                Ok(Value::String(format!(
                    "{}{}",
                    display_value(left),
                    display_value(right)
                )))
            } else {
                let (a, b) = numeric_pair(op, left, right)?;
                Ok(number_value(a + b))
            }
        }
        Sub => {
            let (a, b) = numeric_pair(op, left, right)?;
            Ok(number_value(a - b))
        }
        Mul => {
            let (a, b) = numeric_pair(op, left, right)?;
            Ok(number_value(a * b))
        }
        Div => {
            let (a, b) = numeric_pair(op, left, right)?;
            if b == 0.0 {
                Ok(number_value(if a.is_sign_negative() { f64::NEG_INFINITY } else { f64::INFINITY }))
            } else {
                Ok(number_value(a / b))
            }
        }
        Mod => {
            let (a, b) = numeric_pair(op, left, right)?;
            if b == 0.0 {
                Ok(number_value(if a.is_sign_negative() { f64::NEG_INFINITY } else { f64::INFINITY }))
            } else {
                Ok(number_value(a % b))
            }
        }
        Lt | Lte | Gt | Gte => {
            if let (Value::String(a), Value::String(b)) = (left, right) {
                let ord = a.cmp(b);
                return Ok(Value::Bool(match op {
                    Lt => ord.is_lt(),
                    Lte => ord.is_le(),
                    Gt => ord.is_gt(),
                    Gte => ord.is_ge(),
                    _ => unreachable!(),
                }));
            }
            let (a, b) = numeric_pair(op, left, right)?;
            Ok(Value::Bool(match op {
                Lt => a < b,
                Lte => a <= b,
                Gt => a > b,
                Gte => a >= b,
                _ => unreachable!(),
            }))
        }
    }
}

fn numeric_pair(op: BinaryOp, left: &Value, right: &Value) -> Result<(f64, f64), ExprError> {
    let a = as_number(left).ok_or(ExprError::UnsupportedOperation {
        op: format!("{op:?}"),
        ty: type_name(left),
    })?;
    let b = as_number(right).ok_or(ExprError::UnsupportedOperation {
        op: format!("{op:?}"),
        ty: type_name(right),
    })?;
    Ok((a, b))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn eval_str(src: &str, ctx: &ScopedContext) -> Value {
        evaluate(&parse(src).unwrap(), ctx).unwrap()
    }

    #[test]
    fn strict_equality_distinguishes_types() {
        let ctx = ScopedContext::new();
        assert_eq!(eval_str("1 === 1", &ctx), Value::Bool(true));
        assert_eq!(eval_str("1 === '1'", &ctx), Value::Bool(false));
        assert_eq!(eval_str("1 == '1'", &ctx), Value::Bool(true));
    }

    #[test]
    fn arithmetic_and_precedence() {
        let ctx = ScopedContext::new();
        assert_eq!(eval_str("2 + 3 * 4", &ctx), Value::Number(14.into()));
    }

    #[test]
    fn string_concatenation_via_plus() {
        let ctx = ScopedContext::new();
        assert_eq!(
            eval_str("'count: ' + 5", &ctx),
            Value::String("count: 5".to_string())
        );
    }

    #[test]
    fn ternary_short_circuits_branch() {
        let ctx = ScopedContext::new();
        assert_eq!(
            eval_str("1 > 0 ? 'yes' : 'no'", &ctx),
            Value::String("yes".to_string())
        );
    }

    #[test]
    fn member_and_index_access_through_this() {
        let ctx = ScopedContext::new().with_this(serde_json::json!({"items": [10, 20]}));
        assert_eq!(
            eval_str("this.items[1]", &ctx),
            Value::Number(20.into())
        );
    }

    #[test]
    fn division_by_zero_no_longer_errors() {
        let ctx = ScopedContext::new();
        assert!(evaluate(&parse("1 / 0").unwrap(), &ctx).is_ok());
        assert!(evaluate(&parse("-1 / 0").unwrap(), &ctx).is_ok());
        assert!(evaluate(&parse("1 % 0").unwrap(), &ctx).is_ok());
    }

    #[test]
    fn unknown_identifier_falls_back_to_global_lookup() {
        let ctx = ScopedContext::new().with_global(serde_json::json!({"counter": 7}));
        assert_eq!(eval_str("counter", &ctx), Value::Number(7.into()));
    }

    #[test]
    fn unresolved_identifier_yields_null() {
        let ctx = ScopedContext::new();
        assert_eq!(eval_str("does_not_exist", &ctx), Value::Null);
    }
}
