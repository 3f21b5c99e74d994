// crates/auditflow-expr/src/lib.rs
// ============================================================================
// Module: Gate Condition Language
// Description: Public API surface for the gate condition parser and
//              evaluator.
// Purpose: Wire together the lexer, parser, AST, and evaluator, and expose
//          a single pair of entry points.
// Dependencies: crate::{ast, eval, error, lexer, parser}
// ============================================================================

//! ## Overview
//! Built-in configuration gates accept a small pure-expression language
//! over a row's fields: equality and ordering comparisons, `and`/`or`/`not`,
//! string/number/boolean/null literals, and `row['field']` access. There is
//! no variable assignment, no function call syntax, and no way to reach
//! outside the row passed to [`evaluate`] — the language cannot have side
//! effects or make external calls by construction.
//!
//! ```
//! use auditflow_expr::evaluate;
//! use auditflow_expr::parse_condition;
//! use serde_json::json;
//!
//! let expr = parse_condition("row['category'] == 'A'").unwrap();
//! let result = evaluate(&expr, &json!({"category": "A"})).unwrap();
//! assert_eq!(result, json!(true));
//! ```

mod ast;
mod error;
mod eval;
mod lexer;
mod parser;

pub use ast::CompareOp;
pub use ast::Expr;
pub use error::EvalError;
pub use error::ParseError;
pub use eval::evaluate;
pub use parser::parse_condition;
