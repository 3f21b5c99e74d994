// crates/auditflow-expr/src/eval.rs
// ============================================================================
// Module: Condition Evaluator
// Description: Evaluates a parsed `Expr` tree against one row.
// Purpose: Provide the pure, side-effect-free semantics the gate condition
//          language promises: no I/O, no mutation, no external calls.
// Dependencies: crate::{ast, error}
// ============================================================================

use serde_json::Value;

use crate::ast::CompareOp;
use crate::ast::Expr;
use crate::error::EvalError;

/// Evaluates `expr` against `row`.
///
/// `row` is expected to be a JSON object; a missing field resolves to
/// `Value::Null` rather than an error, mirroring how the orchestrator's
/// `SourceRow`/pipeline row shapes already tolerate sparse fields. The
/// result is whatever value the expression's top-level node produces
/// (typically `Value::Bool`, but a bare `row['field']` expression evaluates
/// to the field's own value) — callers that need a route label stringify
/// it themselves.
///
/// # Errors
/// Returns [`EvalError`] if a comparison is attempted between
/// non-comparable types, or a logical operator receives a non-boolean
/// operand.
pub fn evaluate(expr: &Expr, row: &Value) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Field(name) => Ok(field(row, name)),
        Expr::Not(inner) => Ok(Value::Bool(!expect_bool(evaluate(inner, row)?)?)),
        Expr::And(parts) => {
            for part in parts {
                if !expect_bool(evaluate(part, row)?)? {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        Expr::Or(parts) => {
            for part in parts {
                if expect_bool(evaluate(part, row)?)? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        Expr::Compare(op, lhs, rhs) => {
            let lhs = evaluate(lhs, row)?;
            let rhs = evaluate(rhs, row)?;
            compare(*op, lhs, rhs)
        }
    }
}

fn field(row: &Value, name: &str) -> Value {
    row.as_object().and_then(|map| map.get(name)).cloned().unwrap_or(Value::Null)
}

fn expect_bool(value: Value) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::NonBoolean(other)),
    }
}

fn compare(op: CompareOp, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    match op {
        CompareOp::Eq => Ok(Value::Bool(lhs == rhs)),
        CompareOp::Ne => Ok(Value::Bool(lhs != rhs)),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ordering = match (&lhs, &rhs) {
                (Value::Number(a), Value::Number(b)) => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let Some(ordering) = ordering else { return Err(EvalError::Uncomparable { op, lhs, rhs }) };
            Ok(Value::Bool(match op {
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Ge => ordering.is_ge(),
                CompareOp::Eq | CompareOp::Ne => false,
            }))
        }
    }
}
