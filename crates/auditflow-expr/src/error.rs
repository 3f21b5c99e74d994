// crates/auditflow-expr/src/error.rs
// ============================================================================
// Module: Condition Errors
// Description: Parse- and evaluation-time failures for the gate condition
//              language.
// Purpose: Give every fallible boundary in this crate a stable,
//          programmatically matchable error type.
// Dependencies: thiserror, serde_json
// ============================================================================

use serde_json::Value;
use thiserror::Error;

use crate::ast::CompareOp;

/// Maximum allowed condition source size in bytes.
pub const MAX_CONDITION_INPUT_BYTES: usize = 64 * 1024;
/// Maximum supported nesting depth (parentheses and `not` chains).
pub const MAX_CONDITION_NESTING: usize = 32;

/// Failures raised while lexing or parsing a condition string.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Input was empty or contained only whitespace.
    #[error("condition input is empty")]
    EmptyInput,
    /// Input exceeded [`MAX_CONDITION_INPUT_BYTES`].
    #[error("condition input exceeds {max_bytes} bytes (got {actual_bytes})")]
    InputTooLarge {
        /// Maximum allowed bytes.
        max_bytes: usize,
        /// Actual input length in bytes.
        actual_bytes: usize,
    },
    /// Input exceeded [`MAX_CONDITION_NESTING`].
    #[error("condition nesting exceeds {max_depth} (got {actual_depth}) at byte {position}")]
    NestingTooDeep {
        /// Maximum allowed nesting depth.
        max_depth: usize,
        /// Actual nesting depth when the error occurred.
        actual_depth: usize,
        /// Byte offset in the original input.
        position: usize,
    },
    /// Unexpected token encountered during lexing or parsing.
    #[error("unexpected token `{found}` at byte {position}, expected {expected}")]
    UnexpectedToken {
        /// Human-friendly expectation summary.
        expected: &'static str,
        /// The token that was actually seen.
        found: String,
        /// Byte offset in the original input.
        position: usize,
    },
    /// A string literal was never closed before end of input.
    #[error("unterminated string literal starting at byte {position}")]
    UnterminatedString {
        /// Byte offset of the opening quote.
        position: usize,
    },
    /// A numeric literal failed to parse.
    #[error("invalid number literal `{raw}` at byte {position}")]
    InvalidNumber {
        /// The raw numeric text.
        raw: String,
        /// Byte offset in the original input.
        position: usize,
    },
    /// Trailing input remained after a complete expression.
    #[error("unexpected trailing input at byte {position}")]
    TrailingInput {
        /// Byte offset where unexpected input begins.
        position: usize,
    },
}

/// Failures raised while evaluating a parsed condition against a row.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
/// - Evaluation never executes arbitrary code or performs I/O; every
///   variant here describes a mismatch between the condition's shape and
///   the row's actual field values, never an external failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    /// A relational comparison (`<`, `<=`, `>`, `>=`) was applied to
    /// operands that are not both numbers or both strings.
    #[error("comparison {op:?} is not defined between {lhs} and {rhs}")]
    Uncomparable {
        /// The comparison operator that was attempted.
        op: CompareOp,
        /// Left-hand operand.
        lhs: Value,
        /// Right-hand operand.
        rhs: Value,
    },
    /// A logical operator (`and`, `or`, `not`) received a non-boolean
    /// operand.
    #[error("logical operator requires a boolean operand, got {0}")]
    NonBoolean(Value),
}
