//! Expression evaluation.
//!
//! Evaluation is pure and total: every compiled expression yields a boolean
//! for every attribute set. Comparisons against an absent attribute are
//! `false`; `is not set` is the only leaf that holds for an absent value.

use std::collections::BTreeSet;

use cohort_types::{AttributeSet, AttributeValue};

use crate::expression::{CompiledExpression, Condition};

// ============================================================================
// Public API
// ============================================================================

/// Evaluates a compiled expression against one user's attributes.
///
/// # Postcondition
///
/// Always returns a `bool` -- never panics, never fails on missing attributes.
pub fn evaluate(expression: &CompiledExpression, attributes: &AttributeSet) -> bool {
    evaluate_condition(expression.root(), attributes)
}

// ============================================================================
// Condition Evaluation
// ============================================================================

/// Present value of an attribute, with empty values folded into `None`.
enum Present<'a> {
    Scalar(&'a str),
    Set(&'a BTreeSet<String>),
}

fn present(value: &AttributeValue) -> Option<Present<'_>> {
    if value.is_absent() {
        return None;
    }
    match value {
        AttributeValue::Scalar(s) => Some(Present::Scalar(s)),
        AttributeValue::Set(s) => Some(Present::Set(s)),
        AttributeValue::Absent => None,
    }
}

/// Recursively evaluates a single condition against the attribute set.
fn evaluate_condition(condition: &Condition, attributes: &AttributeSet) -> bool {
    match condition {
        // -- Scalar comparisons --
        Condition::Equals { attribute, value } => match present(attributes.get(attribute)) {
            Some(Present::Scalar(s)) => s == value,
            Some(Present::Set(set)) => set.contains(value),
            None => false,
        },
        Condition::NotEquals { attribute, value } => match present(attributes.get(attribute)) {
            Some(Present::Scalar(s)) => s != value,
            Some(Present::Set(set)) => !set.contains(value),
            None => false,
        },

        // -- List membership --
        Condition::In { attribute, values } => match present(attributes.get(attribute)) {
            Some(Present::Scalar(s)) => values.contains(s),
            Some(Present::Set(set)) => !set.is_disjoint(values),
            None => false,
        },
        Condition::NotIn { attribute, values } => match present(attributes.get(attribute)) {
            Some(Present::Scalar(s)) => !values.contains(s),
            Some(Present::Set(set)) => set.is_disjoint(values),
            None => false,
        },

        // -- Presence --
        Condition::IsSet { attribute } => !attributes.get(attribute).is_absent(),
        Condition::IsNotSet { attribute } => attributes.get(attribute).is_absent(),

        // -- Logical combinators --
        Condition::And(sub) => sub.iter().all(|c| evaluate_condition(c, attributes)),
        Condition::Or(sub) => sub.iter().any(|c| evaluate_condition(c, attributes)),
        Condition::Not(sub) => !evaluate_condition(sub, attributes),
    }
}

// ============================================================================
// Tests
// ============================================================================
