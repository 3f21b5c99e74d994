// crates/auditflow-expr/src/ast.rs
// ============================================================================
// Module: Condition AST
// Description: The parsed representation of a gate condition.
// Purpose: Decouple the parser's grammar from the evaluator's semantics.
// Dependencies: serde_json
// ============================================================================

use serde_json::Value;

/// A parsed gate condition.
///
/// `Expr` is plain data: evaluating it (see [`crate::eval::evaluate`]) can
/// only read from the row it is given and cannot perform I/O or mutate
/// anything, satisfying the no-side-effects requirement on gate conditions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal value (string, number, boolean, or null).
    Literal(Value),
    /// `row['field']` — the named field of the row, or `Value::Null` if the
    /// row has no such field.
    Field(String),
    /// `not expr`
    Not(Box<Expr>),
    /// `a and b and c …`, flattened at parse time.
    And(Vec<Expr>),
    /// `a or b or c …`, flattened at parse time.
    Or(Vec<Expr>),
    /// `lhs OP rhs` for a relational or equality comparison.
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

/// A relational or equality comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}
