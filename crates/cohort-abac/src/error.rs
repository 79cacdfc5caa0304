//! Compilation errors.

use std::fmt::{self, Display};

use thiserror::Error;

/// What went wrong while compiling a policy expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompileErrorKind {
    /// The source (or rule list) is empty.
    Empty,
    /// Malformed input: unexpected token, missing parenthesis, bad identifier.
    Syntax,
    /// A string literal was opened but never closed.
    UnterminatedString,
    /// A comparison operator the language does not support (`>`, `=~`, `contains`, ...).
    UnknownOperator,
    /// The operator and its operand disagree, e.g. a list given to `==`.
    TypeMismatch,
}

impl Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty expression"),
            Self::Syntax => write!(f, "syntax error"),
            Self::UnterminatedString => write!(f, "unterminated string"),
            Self::UnknownOperator => write!(f, "unknown operator"),
            Self::TypeMismatch => write!(f, "type mismatch"),
        }
    }
}

/// Error returned when a policy expression or rule list fails to compile.
///
/// `position` is a byte offset into the expression source. For simple-mode
/// rule lists it is the index of the offending rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at position {position}: {message}")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub position: usize,
    pub message: String,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, position: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            position,
            message: message.into(),
        }
    }

    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::new(CompileErrorKind::Syntax, position, message)
    }

    pub(crate) fn type_mismatch(position: usize, message: impl Into<String>) -> Self {
        Self::new(CompileErrorKind::TypeMismatch, position, message)
    }
}

/// Result type for compilation.
pub type Result<T> = std::result::Result<T, CompileError>;
