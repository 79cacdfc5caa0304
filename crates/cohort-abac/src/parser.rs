//! Recursive-descent parser for advanced-mode policy expressions.
//!
//! # Syntax
//!
//! ```text
//! expr      = or
//! or        = and { ("||" | "or") and }
//! and       = unary { ("&&" | "and") unary }
//! unary     = ("!" | "not") unary | primary
//! primary   = "(" expr ")" | predicate
//! predicate = attr ("==" | "!=") value
//!           | attr ["not"] "in" "[" value { "," value } [","] "]"
//!           | attr "is" ["not"] "set"
//! value     = string | word
//! ```
//!
//! # Examples
//!
//! ```text
//! Dept == "Engineering"
//! Dept == "Engineering" && Office == "Remote"
//! user.attributes.Clearance in ["secret", "top-secret"]
//! !(Contractor is set) || Program not in ["legacy"]
//! ```

use std::collections::BTreeSet;

use crate::error::{CompileError, CompileErrorKind, Result};
use crate::expression::Condition;
use crate::lexer::{Token, TokenKind, Tokenizer};

/// Nesting limit for parentheses and negations; keeps evaluation recursion bounded.
pub const MAX_DEPTH: usize = 64;

/// Attribute prefix accepted for compatibility with `user.attributes.X` style sources.
const ATTRIBUTE_PREFIX: &str = "user.attributes.";

pub(crate) struct Parser {
    tokens: Vec<Token>,
    index: usize,
    depth: usize,
}

impl Parser {
    pub fn new(source: &str) -> Result<Self> {
        if source.trim().is_empty() {
            return Err(CompileError::new(
                CompileErrorKind::Empty,
                0,
                "expression source is empty",
            ));
        }

        Ok(Self {
            tokens: Tokenizer::new(source).tokenize()?,
            index: 0,
            depth: 0,
        })
    }

    /// Parses the complete input. Trailing tokens are an error.
    pub fn parse(mut self) -> Result<Condition> {
        let condition = self.parse_or()?;
        let token = self.current();
        if token.kind != TokenKind::Eof {
            return Err(CompileError::syntax(
                token.pos,
                format!("unexpected {} after expression", describe(&token.kind)),
            ));
        }
        Ok(condition)
    }

    fn current(&self) -> &Token {
        // The tokenizer always terminates the stream with `Eof`.
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) {
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(&self.current().kind, TokenKind::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<usize> {
        let token = self.current();
        if &token.kind == kind {
            let pos = token.pos;
            self.advance();
            Ok(pos)
        } else {
            Err(CompileError::syntax(
                token.pos,
                format!("expected {what}, found {}", describe(&token.kind)),
            ))
        }
    }

    fn enter(&mut self, pos: usize) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CompileError::syntax(
                pos,
                format!("expression nested deeper than {MAX_DEPTH} levels"),
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Parse OR expressions.
    fn parse_or(&mut self) -> Result<Condition> {
        let mut operands = vec![self.parse_and()?];

        while self.current().kind == TokenKind::OrOr || self.at_keyword("or") {
            self.advance();
            operands.push(self.parse_and()?);
        }

        Ok(flatten(operands, Combinator::Or))
    }

    /// Parse AND expressions.
    fn parse_and(&mut self) -> Result<Condition> {
        let mut operands = vec![self.parse_unary()?];

        while self.current().kind == TokenKind::AndAnd || self.at_keyword("and") {
            self.advance();
            operands.push(self.parse_unary()?);
        }

        Ok(flatten(operands, Combinator::And))
    }

    /// Parse NOT expressions.
    fn parse_unary(&mut self) -> Result<Condition> {
        if self.current().kind == TokenKind::Bang || self.at_keyword("not") {
            let pos = self.current().pos;
            self.advance();
            self.enter(pos)?;
            let inner = self.parse_unary()?;
            self.leave();
            return Ok(Condition::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    /// Parse primary expressions (predicates and parenthesized groups).
    fn parse_primary(&mut self) -> Result<Condition> {
        if self.current().kind == TokenKind::OpenParen {
            let pos = self.current().pos;
            self.advance();
            self.enter(pos)?;
            let inner = self.parse_or()?;
            self.leave();
            self.expect(&TokenKind::CloseParen, "')'")?;
            return Ok(inner);
        }

        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> Result<Condition> {
        let token = self.current().clone();
        let attribute = match &token.kind {
            TokenKind::Word(word) if !is_reserved(word) => normalize_attribute(word, token.pos)?,
            other => {
                return Err(CompileError::syntax(
                    token.pos,
                    format!("expected attribute name, found {}", describe(other)),
                ));
            }
        };
        self.advance();

        let op = self.current().clone();
        match &op.kind {
            TokenKind::Operator(symbol) if symbol == "==" || symbol == "!=" => {
                self.advance();
                let value = self.parse_scalar_operand(symbol)?;
                Ok(if symbol == "==" {
                    Condition::Equals { attribute, value }
                } else {
                    Condition::NotEquals { attribute, value }
                })
            }
            TokenKind::Operator(symbol) => Err(CompileError::new(
                CompileErrorKind::UnknownOperator,
                op.pos,
                format!("operator '{symbol}' is not supported"),
            )),
            TokenKind::Word(word) if word.eq_ignore_ascii_case("in") => {
                self.advance();
                let values = self.parse_list_operand("in")?;
                Ok(Condition::In { attribute, values })
            }
            TokenKind::Word(word) if word.eq_ignore_ascii_case("not") => {
                self.advance();
                if !self.at_keyword("in") {
                    let token = self.current();
                    return Err(CompileError::syntax(
                        token.pos,
                        format!("expected 'in' after 'not', found {}", describe(&token.kind)),
                    ));
                }
                self.advance();
                let values = self.parse_list_operand("not in")?;
                Ok(Condition::NotIn { attribute, values })
            }
            TokenKind::Word(word) if word.eq_ignore_ascii_case("is") => {
                self.advance();
                let negated = self.at_keyword("not");
                if negated {
                    self.advance();
                }
                if !self.at_keyword("set") {
                    let token = self.current();
                    return Err(CompileError::syntax(
                        token.pos,
                        format!("expected 'set', found {}", describe(&token.kind)),
                    ));
                }
                self.advance();
                Ok(if negated {
                    Condition::IsNotSet { attribute }
                } else {
                    Condition::IsSet { attribute }
                })
            }
            TokenKind::Word(word) => Err(CompileError::new(
                CompileErrorKind::UnknownOperator,
                op.pos,
                format!("operator '{word}' is not supported"),
            )),
            other => Err(CompileError::syntax(
                op.pos,
                format!("expected comparison operator, found {}", describe(other)),
            )),
        }
    }

    fn parse_scalar_operand(&mut self, symbol: &str) -> Result<String> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Str(value) | TokenKind::Word(value) => {
                self.advance();
                Ok(value)
            }
            TokenKind::OpenBracket => Err(CompileError::type_mismatch(
                token.pos,
                format!("'{symbol}' compares against a single value; use 'in' for lists"),
            )),
            other => Err(CompileError::syntax(
                token.pos,
                format!("expected value, found {}", describe(&other)),
            )),
        }
    }

    fn parse_list_operand(&mut self, symbol: &str) -> Result<BTreeSet<String>> {
        let open = self.current().clone();
        match open.kind {
            TokenKind::OpenBracket => self.advance(),
            TokenKind::Str(_) | TokenKind::Word(_) => {
                return Err(CompileError::type_mismatch(
                    open.pos,
                    format!("'{symbol}' requires a list such as [\"a\", \"b\"]"),
                ));
            }
            other => {
                return Err(CompileError::syntax(
                    open.pos,
                    format!("expected '[', found {}", describe(&other)),
                ));
            }
        }

        let mut values = BTreeSet::new();
        loop {
            let token = self.current().clone();
            match token.kind {
                TokenKind::CloseBracket => {
                    self.advance();
                    break;
                }
                TokenKind::Str(value) | TokenKind::Word(value) => {
                    self.advance();
                    values.insert(value);
                    match self.current().kind {
                        TokenKind::Comma => self.advance(),
                        TokenKind::CloseBracket => {}
                        _ => {
                            let token = self.current();
                            return Err(CompileError::syntax(
                                token.pos,
                                format!("expected ',' or ']', found {}", describe(&token.kind)),
                            ));
                        }
                    }
                }
                other => {
                    return Err(CompileError::syntax(
                        token.pos,
                        format!("expected list value, found {}", describe(&other)),
                    ));
                }
            }
        }

        if values.is_empty() {
            return Err(CompileError::type_mismatch(
                open.pos,
                format!("'{symbol}' requires at least one value"),
            ));
        }
        Ok(values)
    }
}

#[derive(Clone, Copy)]
enum Combinator {
    And,
    Or,
}

/// Builds an n-ary node, merging directly nested nodes of the same kind.
fn flatten(operands: Vec<Condition>, combinator: Combinator) -> Condition {
    if operands.len() == 1 {
        return operands.into_iter().next().unwrap_or(Condition::And(Vec::new()));
    }

    let mut flat = Vec::with_capacity(operands.len());
    for operand in operands {
        match (combinator, operand) {
            (Combinator::And, Condition::And(children))
            | (Combinator::Or, Condition::Or(children)) => flat.extend(children),
            (_, other) => flat.push(other),
        }
    }

    match combinator {
        Combinator::And => Condition::And(flat),
        Combinator::Or => Condition::Or(flat),
    }
}

fn is_reserved(word: &str) -> bool {
    ["and", "or", "not", "in", "is", "set"]
        .iter()
        .any(|k| word.eq_ignore_ascii_case(k))
}

/// Strips the `user.attributes.` prefix and validates the remaining name.
pub(crate) fn normalize_attribute(raw: &str, pos: usize) -> Result<String> {
    let name = raw.strip_prefix(ATTRIBUTE_PREFIX).unwrap_or(raw);
    if !is_valid_attribute(name) {
        return Err(CompileError::syntax(
            pos,
            format!("'{raw}' is not a valid attribute name"),
        ));
    }
    Ok(name.to_string())
}

fn is_valid_attribute(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | ':'))
        && !is_reserved(name)
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Word(w) => format!("'{w}'"),
        TokenKind::Str(s) => format!("string \"{s}\""),
        TokenKind::OpenParen => "'('".to_string(),
        TokenKind::CloseParen => "')'".to_string(),
        TokenKind::OpenBracket => "'['".to_string(),
        TokenKind::CloseBracket => "']'".to_string(),
        TokenKind::Comma => "','".to_string(),
        TokenKind::AndAnd => "'&&'".to_string(),
        TokenKind::OrOr => "'||'".to_string(),
        TokenKind::Bang => "'!'".to_string(),
        TokenKind::Operator(op) => format!("'{op}'"),
        TokenKind::Eof => "end of input".to_string(),
    }
}
