// crates/auditflow-expr/src/parser.rs
// ============================================================================
// Module: Condition Parser
// Description: Recursive-descent parser for the gate condition language.
// Purpose: Turn a token stream into an `Expr` tree with standard `or`/`and`/
//          `not`/comparison precedence.
// Dependencies: crate::{ast, error, lexer}
// ============================================================================

use serde_json::Value;

use crate::ast::CompareOp;
use crate::ast::Expr;
use crate::error::MAX_CONDITION_INPUT_BYTES;
use crate::error::MAX_CONDITION_NESTING;
use crate::error::ParseError;
use crate::lexer::Lexer;
use crate::lexer::SpannedToken;
use crate::lexer::Token;

/// Parses a gate condition string into an [`Expr`] tree.
///
/// # Grammar (informal)
/// ```text
/// expression := or_expr
/// or_expr     := and_expr ("or" and_expr)*
/// and_expr    := unary ("and" unary)*
/// unary       := "not" unary | comparison
/// comparison  := primary (("==" | "!=" | "<" | "<=" | ">" | ">=") primary)?
/// primary     := "true" | "false" | "null" | NUMBER | STRING
///              | "row" "[" STRING "]" | "(" expression ")"
/// ```
///
/// # Errors
/// Returns [`ParseError`] for empty input, oversized input, excessive
/// nesting, malformed tokens, or unconsumed trailing input.
pub fn parse_condition(input: &str) -> Result<Expr, ParseError> {
    if input.len() > MAX_CONDITION_INPUT_BYTES {
        return Err(ParseError::InputTooLarge { max_bytes: MAX_CONDITION_INPUT_BYTES, actual_bytes: input.len() });
    }
    let tokens = Lexer::new(input).lex()?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_or()?;
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser<'a> {
    tokens: Vec<SpannedToken<'a>>,
    index: usize,
    nesting: usize,
}

impl<'a> Parser<'a> {
    const fn new(tokens: Vec<SpannedToken<'a>>) -> Self {
        Self { tokens, index: 0, nesting: 0 }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut parts = vec![self.parse_and()?];
        while self.matches(Token::Or) {
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Expr::Or(parts) })
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut parts = vec![self.parse_unary()?];
        while self.matches(Token::And) {
            parts.push(self.parse_unary()?);
        }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Expr::And(parts) })
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.matches(Token::Not) {
            let position = self.current().position;
            return self.with_nesting(position, |parser| Ok(Expr::Not(Box::new(parser.parse_unary()?))));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_primary()?;
        let op = match self.current().token {
            Token::EqEq => CompareOp::Eq,
            Token::NotEq => CompareOp::Ne,
            Token::Lt => CompareOp::Lt,
            Token::LtEq => CompareOp::Le,
            Token::Gt => CompareOp::Gt,
            Token::GtEq => CompareOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_primary()?;
        Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let SpannedToken { token, position } = *self.current();
        match token {
            Token::True => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(true)))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(false)))
            }
            Token::Null => {
                self.advance();
                Ok(Expr::Literal(Value::Null))
            }
            Token::Number(raw) => {
                self.advance();
                Ok(Expr::Literal(Value::Number(parse_number(raw).ok_or_else(|| ParseError::InvalidNumber {
                    raw: raw.to_string(),
                    position,
                })?)))
            }
            Token::Str(body) => {
                self.advance();
                Ok(Expr::Literal(Value::String(unescape(body))))
            }
            Token::Ident("row") => {
                self.advance();
                self.expect(Token::LBracket, "`[` after `row`")?;
                let field = match self.current().token {
                    Token::Str(body) => {
                        let name = unescape(body);
                        self.advance();
                        name
                    }
                    _ => {
                        return Err(ParseError::UnexpectedToken {
                            expected: "quoted field name",
                            found: self.describe_current(),
                            position: self.current().position,
                        });
                    }
                };
                self.expect(Token::RBracket, "`]` after field name")?;
                Ok(Expr::Field(field))
            }
            Token::LParen => {
                self.advance();
                self.with_nesting(position, |parser| {
                    let expr = parser.parse_or()?;
                    parser.expect(Token::RParen, "`)`")?;
                    Ok(expr)
                })
            }
            _ => Err(ParseError::UnexpectedToken {
                expected: "literal, `row[...]`, or `(`",
                found: self.describe_current(),
                position,
            }),
        }
    }

    fn with_nesting<T>(&mut self, position: usize, f: impl FnOnce(&mut Self) -> Result<T, ParseError>) -> Result<T, ParseError> {
        let next_depth = self.nesting + 1;
        if next_depth > MAX_CONDITION_NESTING {
            return Err(ParseError::NestingTooDeep { max_depth: MAX_CONDITION_NESTING, actual_depth: next_depth, position });
        }
        self.nesting = next_depth;
        let result = f(self);
        self.nesting = self.nesting.saturating_sub(1);
        result
    }

    fn expect(&mut self, token: Token<'_>, expected: &'static str) -> Result<(), ParseError> {
        if std::mem::discriminant(&self.current().token) == std::mem::discriminant(&token) {
            self.advance();
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken { expected, found: self.describe_current(), position: self.current().position })
        }
    }

    fn expect_eof(&self) -> Result<(), ParseError> {
        if matches!(self.current().token, Token::Eof) {
            Ok(())
        } else {
            Err(ParseError::TrailingInput { position: self.current().position })
        }
    }

    fn matches(&mut self, kind: Token<'_>) -> bool {
        if std::mem::discriminant(&self.current().token) == std::mem::discriminant(&kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn current(&self) -> &SpannedToken<'a> {
        debug_assert!(self.index < self.tokens.len(), "parser index out of bounds");
        &self.tokens[self.index]
    }

    const fn advance(&mut self) {
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
    }

    fn describe_current(&self) -> String {
        match self.current().token {
            Token::Ident(name) => name.to_string(),
            Token::Number(raw) => raw.to_string(),
            Token::Str(body) => format!("\"{body}\""),
            Token::And => "and".to_string(),
            Token::Or => "or".to_string(),
            Token::Not => "not".to_string(),
            Token::True => "true".to_string(),
            Token::False => "false".to_string(),
            Token::Null => "null".to_string(),
            Token::EqEq => "==".to_string(),
            Token::NotEq => "!=".to_string(),
            Token::Lt => "<".to_string(),
            Token::LtEq => "<=".to_string(),
            Token::Gt => ">".to_string(),
            Token::GtEq => ">=".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::LBracket => "[".to_string(),
            Token::RBracket => "]".to_string(),
            Token::Eof => "end of input".to_string(),
        }
    }
}

/// Parses a numeric literal the same way `serde_json` parses a JSON number:
/// integers stay integers so that `row['value'] == 10` compares equal
/// against a row field that was itself parsed from JSON, where `10` and
/// `10.0` are distinct [`serde_json::Number`] values.
fn parse_number(raw: &str) -> Option<serde_json::Number> {
    if !raw.contains('.') {
        if let Ok(i) = raw.parse::<i64>() {
            return Some(serde_json::Number::from(i));
        }
    }
    raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64)
}

/// Resolves the two escape sequences the lexer allows (`\\` and the
/// matching quote) in a string literal's body.
fn unescape(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_field_equality() {
        let expr = parse_condition("row['category'] == 'A'").unwrap();
        assert_eq!(
            expr,
            Expr::Compare(
                CompareOp::Eq,
                Box::new(Expr::Field("category".to_string())),
                Box::new(Expr::Literal(Value::String("A".to_string())))
            )
        );
    }

    #[test]
    fn parses_and_or_not_with_precedence() {
        let expr = parse_condition("not row['a'] == 1 and row['b'] == 2 or row['c'] == 3").unwrap();
        // `or` binds loosest, so this is (not (a==1) and (b==2)) or (c==3).
        let Expr::Or(parts) = expr else { panic!("expected top-level or") };
        assert_eq!(parts.len(), 2);
        assert!(matches!(parts[0], Expr::And(_)));
    }

    #[test]
    fn rejects_empty_input() {
        assert_eq!(parse_condition("").unwrap_err(), ParseError::EmptyInput);
        assert_eq!(parse_condition("   ").unwrap_err(), ParseError::EmptyInput);
    }

    #[test]
    fn rejects_trailing_input() {
        let err = parse_condition("true true").unwrap_err();
        assert!(matches!(err, ParseError::TrailingInput { .. }));
    }

    #[test]
    fn rejects_unterminated_string() {
        let err = parse_condition("row['category'] == 'A").unwrap_err();
        assert!(matches!(err, ParseError::UnterminatedString { .. }));
    }

    #[test]
    fn rejects_excessive_nesting() {
        let deeply_nested: String = "(".repeat(40) + "true" + &")".repeat(40);
        let err = parse_condition(&deeply_nested).unwrap_err();
        assert!(matches!(err, ParseError::NestingTooDeep { .. }));
    }

    #[test]
    fn parenthesized_expression_overrides_precedence() {
        let expr = parse_condition("(row['a'] == 1 or row['b'] == 2) and row['c'] == 3").unwrap();
        let Expr::And(parts) = expr else { panic!("expected top-level and") };
        assert!(matches!(parts[0], Expr::Or(_)));
    }
}
