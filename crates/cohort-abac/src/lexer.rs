//! Tokenizer for policy expressions.

use crate::error::{CompileError, CompileErrorKind, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenKind {
    /// Attribute name, keyword or bare literal.
    Word(String),
    /// Quoted string literal (escapes resolved).
    Str(String),
    OpenParen,
    CloseParen,
    OpenBracket,
    CloseBracket,
    Comma,
    AndAnd,
    OrOr,
    Bang,
    /// Run of comparison characters; validated by the parser.
    Operator(String),
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Byte offset of the token's first character.
    pub pos: usize,
}

pub(crate) struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    /// Tokenizes the whole input, ending with a single `Eof` token.
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.input[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while self.peek_char().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn next_token(&mut self) -> Result<Token> {
        self.skip_whitespace();
        let start = self.pos;

        let Some(ch) = self.peek_char() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                pos: start,
            });
        };

        let kind = match ch {
            '(' => self.single(TokenKind::OpenParen),
            ')' => self.single(TokenKind::CloseParen),
            '[' => self.single(TokenKind::OpenBracket),
            ']' => self.single(TokenKind::CloseBracket),
            ',' => self.single(TokenKind::Comma),
            '&' | '|' => {
                if self.peek_second() == Some(ch) {
                    self.pos += 2;
                    if ch == '&' {
                        TokenKind::AndAnd
                    } else {
                        TokenKind::OrOr
                    }
                } else {
                    return Err(CompileError::syntax(
                        start,
                        format!("expected '{ch}{ch}', found single '{ch}'"),
                    ));
                }
            }
            '!' if self.peek_second() != Some('=') => self.single(TokenKind::Bang),
            '"' | '\'' => self.quoted(ch)?,
            c if is_operator_char(c) => {
                while self.peek_char().is_some_and(is_operator_char) {
                    self.bump();
                }
                TokenKind::Operator(self.input[start..self.pos].to_string())
            }
            c if is_word_start(c) => {
                while self.peek_char().is_some_and(is_word_char) {
                    self.bump();
                }
                TokenKind::Word(self.input[start..self.pos].to_string())
            }
            other => {
                return Err(CompileError::syntax(
                    start,
                    format!("unexpected character '{other}'"),
                ));
            }
        };

        Ok(Token { kind, pos: start })
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.bump();
        kind
    }

    fn quoted(&mut self, quote: char) -> Result<TokenKind> {
        let start = self.pos;
        self.bump();
        let mut value = String::new();

        while let Some(c) = self.bump() {
            match c {
                c if c == quote => return Ok(TokenKind::Str(value)),
                '\\' => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(escaped @ ('\\' | '"' | '\'')) => value.push(escaped),
                    Some(other) => {
                        return Err(CompileError::syntax(
                            self.pos - other.len_utf8() - 1,
                            format!("unknown escape sequence '\\{other}'"),
                        ));
                    }
                    None => break,
                },
                c => value.push(c),
            }
        }

        Err(CompileError::new(
            CompileErrorKind::UnterminatedString,
            start,
            "string literal is never closed",
        ))
    }
}

fn is_operator_char(c: char) -> bool {
    matches!(c, '=' | '!' | '<' | '>' | '~')
}

fn is_word_start(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | ':')
}
