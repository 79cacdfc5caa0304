//! Canonical expression tree.
//!
//! Both policy modes end up here: advanced-mode source text is parsed into a
//! [`Condition`] tree, and simple-mode rule lists are lowered into an `And` of
//! leaf conditions. Evaluation only ever sees this one representation.

use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::parser::Parser;

// ============================================================================
// Condition
// ============================================================================

/// A node of a compiled policy expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    // -- Scalar comparisons --
    /// Attribute equals the value (a set-valued attribute must contain it).
    Equals { attribute: String, value: String },
    /// Attribute differs from the value (a set-valued attribute must not contain it).
    NotEquals { attribute: String, value: String },

    // -- List membership --
    /// Attribute is one of the listed values (for sets: any overlap).
    In {
        attribute: String,
        values: BTreeSet<String>,
    },
    /// Attribute is none of the listed values (for sets: no overlap).
    NotIn {
        attribute: String,
        values: BTreeSet<String>,
    },

    // -- Presence --
    /// Attribute has a non-empty value.
    IsSet { attribute: String },
    /// Attribute is missing or empty. The only leaf that is true for absent values.
    IsNotSet { attribute: String },

    // -- Logical combinators --
    /// All sub-conditions must be true.
    And(Vec<Condition>),
    /// At least one sub-condition must be true.
    Or(Vec<Condition>),
    /// The sub-condition must be false.
    Not(Box<Condition>),
}

impl Condition {
    /// Returns the attribute a leaf condition tests, or `None` for combinators.
    pub fn attribute(&self) -> Option<&str> {
        match self {
            Self::Equals { attribute, .. }
            | Self::NotEquals { attribute, .. }
            | Self::In { attribute, .. }
            | Self::NotIn { attribute, .. }
            | Self::IsSet { attribute }
            | Self::IsNotSet { attribute } => Some(attribute),
            Self::And(_) | Self::Or(_) | Self::Not(_) => None,
        }
    }

    fn collect_attributes<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_attributes(out);
                }
            }
            Self::Not(inner) => inner.collect_attributes(out),
            leaf => {
                if let Some(attribute) = leaf.attribute() {
                    out.insert(attribute);
                }
            }
        }
    }

    fn is_leaf(&self) -> bool {
        self.attribute().is_some()
    }
}

// ============================================================================
// Canonical rendering
// ============================================================================

impl Display for Condition {
    /// Renders advanced-mode source that parses back to an equivalent tree.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals { attribute, value } => write!(f, "{attribute} == {}", Quoted(value)),
            Self::NotEquals { attribute, value } => {
                write!(f, "{attribute} != {}", Quoted(value))
            }
            Self::In { attribute, values } => {
                write!(f, "{attribute} in ")?;
                write_list(f, values)
            }
            Self::NotIn { attribute, values } => {
                write!(f, "{attribute} not in ")?;
                write_list(f, values)
            }
            Self::IsSet { attribute } => write!(f, "{attribute} is set"),
            Self::IsNotSet { attribute } => write!(f, "{attribute} is not set"),
            Self::And(children) => write_joined(f, children, " && ", |c| {
                matches!(c, Self::Or(_) | Self::And(_))
            }),
            Self::Or(children) => {
                write_joined(f, children, " || ", |c| matches!(c, Self::Or(_)))
            }
            Self::Not(inner) => write!(f, "!({inner})"),
        }
    }
}

struct Quoted<'a>(&'a str);

impl Display for Quoted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"")?;
        for c in self.0.chars() {
            match c {
                '"' => f.write_str("\\\"")?,
                '\\' => f.write_str("\\\\")?,
                '\n' => f.write_str("\\n")?,
                '\t' => f.write_str("\\t")?,
                c => write!(f, "{c}")?,
            }
        }
        f.write_str("\"")
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, values: &BTreeSet<String>) -> fmt::Result {
    f.write_str("[")?;
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", Quoted(value))?;
    }
    f.write_str("]")
}

fn write_joined(
    f: &mut fmt::Formatter<'_>,
    children: &[Condition],
    separator: &str,
    needs_parens: impl Fn(&Condition) -> bool,
) -> fmt::Result {
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            f.write_str(separator)?;
        }
        if !child.is_leaf() && needs_parens(child) {
            write!(f, "({child})")?;
        } else {
            write!(f, "{child}")?;
        }
    }
    Ok(())
}

// ============================================================================
// CompiledExpression
// ============================================================================

/// A compiled, immutable policy expression.
///
/// Cloning is cheap (shared tree), and the structure holds no interior
/// mutability, so one compiled expression can be evaluated concurrently
/// against any number of attribute sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledExpression {
    root: Arc<Condition>,
}

impl CompiledExpression {
    pub(crate) fn from_condition(root: Condition) -> Self {
        Self {
            root: Arc::new(root),
        }
    }

    pub fn root(&self) -> &Condition {
        &self.root
    }

    /// Names of every attribute the expression reads.
    pub fn attributes(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.root.collect_attributes(&mut out);
        out
    }
}

impl Display for CompiledExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)
    }
}

/// Compiles advanced-mode source text.
///
/// # Errors
///
/// Returns a [`CompileError`](crate::CompileError) locating the first problem:
/// syntax errors, unsupported operators, or operator/operand mismatches.
pub fn compile(source: &str) -> Result<CompiledExpression> {
    let root = Parser::new(source)?.parse()?;
    Ok(CompiledExpression::from_condition(root))
}
