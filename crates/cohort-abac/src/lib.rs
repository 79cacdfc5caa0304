//! # cohort-abac: Attribute-based membership policies
//!
//! Compiles policy definitions into immutable expression trees and evaluates
//! them against user attributes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │  Simple mode             │   │  Advanced mode           │
//! │  Vec<Rule> (implicit AND)│   │  "Dept == \"Eng\" && ..."│
//! └────────────┬─────────────┘   └────────────┬─────────────┘
//!              │ compile_rules                 │ lexer + parser
//!              ▼                               ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │  CompiledExpression (shared Condition tree)             │
//! └────────────────────────────┬────────────────────────────┘
//!                              │ evaluate(attributes)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │  bool - total, no I/O, absent attributes never match    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Grammar
//!
//! ```text
//! expr      := or
//! or        := and (("||" | "or") and)*
//! and       := unary (("&&" | "and") unary)*
//! unary     := ("!" | "not") unary | primary
//! primary   := "(" expr ")" | predicate
//! predicate := attr ("==" | "!=") value
//!            | attr ("in" | "not in") "[" value ("," value)* "]"
//!            | attr "is" ["not"] "set"
//! ```
//!
//! ## Examples
//!
//! ```
//! use cohort_abac::{compile, evaluate};
//! use cohort_types::AttributeSet;
//!
//! let expr = compile(r#"Dept == "Engineering" && Office in ["Remote", "Berlin"]"#).unwrap();
//! let alice = AttributeSet::new()
//!     .with("Dept", "Engineering")
//!     .with("Office", "Remote");
//!
//! assert!(evaluate(&expr, &alice));
//! assert!(!evaluate(&expr, &AttributeSet::new()));
//! ```

pub mod error;
pub mod evaluator;
pub mod expression;
mod lexer;
mod parser;
pub mod policy;

pub use error::{CompileError, CompileErrorKind, Result};
pub use evaluator::evaluate;
pub use expression::{compile, CompiledExpression, Condition};
pub use parser::MAX_DEPTH;
pub use policy::{compile_rules, CompiledPolicy, Policy, PolicyDefinition, Rule, RuleOperator};
