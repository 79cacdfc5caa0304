//! Membership policy definitions.
//!
//! A policy is a named predicate over user attributes plus the collections it
//! governs. It is written either as a list of simple-mode [`Rule`]s (implicitly
//! AND-ed) or as one advanced-mode expression; both compile to the same
//! [`CompiledExpression`].

use std::collections::BTreeSet;

use cohort_types::{AttributeSet, CollectionId, PolicyId, Revision};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CompileError, CompileErrorKind, Result};
use crate::evaluator;
use crate::expression::{self, CompiledExpression, Condition};
use crate::parser::normalize_attribute;

// ============================================================================
// Rule
// ============================================================================

/// Comparison used by a simple-mode rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    /// Attribute equals the single value.
    Equals,
    /// Attribute differs from the single value.
    NotEquals,
    /// Attribute is one of the values.
    In,
    /// Attribute is none of the values.
    NotIn,
    /// Attribute has any value. Takes no values.
    IsSet,
    /// Attribute has no value. Takes no values.
    IsNotSet,
}

/// A single simple-mode building block: `attribute operator values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Attribute name, e.g. `"Dept"`.
    pub attribute: String,
    pub operator: RuleOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl Rule {
    pub fn new(attribute: impl Into<String>, operator: RuleOperator, values: &[&str]) -> Self {
        Self {
            attribute: attribute.into(),
            operator,
            values: values.iter().map(ToString::to_string).collect(),
        }
    }

    /// `attribute == value`
    pub fn equals(attribute: impl Into<String>, value: &str) -> Self {
        Self::new(attribute, RuleOperator::Equals, &[value])
    }

    /// Lowers the rule to a leaf condition, checking operator arity.
    ///
    /// `index` is reported as the error position.
    fn to_condition(&self, index: usize) -> Result<Condition> {
        let attribute = normalize_attribute(&self.attribute, index)?;

        match self.operator {
            RuleOperator::Equals | RuleOperator::NotEquals => {
                let [value] = self.values.as_slice() else {
                    return Err(CompileError::type_mismatch(
                        index,
                        format!(
                            "{:?} takes exactly one value, got {}",
                            self.operator,
                            self.values.len()
                        ),
                    ));
                };
                let value = value.clone();
                Ok(if self.operator == RuleOperator::Equals {
                    Condition::Equals { attribute, value }
                } else {
                    Condition::NotEquals { attribute, value }
                })
            }
            RuleOperator::In | RuleOperator::NotIn => {
                if self.values.is_empty() {
                    return Err(CompileError::type_mismatch(
                        index,
                        format!("{:?} requires at least one value", self.operator),
                    ));
                }
                let values = self.values.iter().cloned().collect();
                Ok(if self.operator == RuleOperator::In {
                    Condition::In { attribute, values }
                } else {
                    Condition::NotIn { attribute, values }
                })
            }
            RuleOperator::IsSet | RuleOperator::IsNotSet => {
                if !self.values.is_empty() {
                    return Err(CompileError::type_mismatch(
                        index,
                        format!("{:?} takes no values", self.operator),
                    ));
                }
                Ok(if self.operator == RuleOperator::IsSet {
                    Condition::IsSet { attribute }
                } else {
                    Condition::IsNotSet { attribute }
                })
            }
        }
    }
}

/// Compiles a simple-mode rule list into the conjunction of its rules.
///
/// # Errors
///
/// An empty list is rejected so that a policy never matches everyone by
/// accident. Arity problems report the index of the offending rule.
pub fn compile_rules(rules: &[Rule]) -> Result<CompiledExpression> {
    if rules.is_empty() {
        return Err(CompileError::new(
            CompileErrorKind::Empty,
            0,
            "a policy needs at least one rule",
        ));
    }

    let mut conditions = rules
        .iter()
        .enumerate()
        .map(|(index, rule)| rule.to_condition(index))
        .collect::<Result<Vec<_>>>()?;

    let root = if conditions.len() == 1 {
        conditions.remove(0)
    } else {
        Condition::And(conditions)
    };
    Ok(CompiledExpression::from_condition(root))
}

// ============================================================================
// Policy
// ============================================================================

/// How a policy's predicate is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDefinition {
    /// Simple mode: rules combined with implicit AND.
    Rules(Vec<Rule>),
    /// Advanced mode: a boolean expression with AND/OR/NOT and parentheses.
    Expression(String),
}

/// An attribute-based membership policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    /// Human-readable name for logs and the admin UI.
    pub name: String,
    pub definition: PolicyDefinition,
    /// Collections whose membership this policy governs.
    #[serde(default)]
    pub collections: BTreeSet<CollectionId>,
    /// When `false`, the engine only reports what it would change.
    #[serde(default)]
    pub auto_sync: bool,
    /// Inactive policies are ignored by sync passes.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Incremented by the repository on every save.
    #[serde(default)]
    pub revision: Revision,
}

fn default_active() -> bool {
    true
}

impl Policy {
    /// Creates an active, unsaved policy without auto-sync or targets.
    pub fn new(id: impl Into<PolicyId>, name: impl Into<String>, definition: PolicyDefinition) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            definition,
            collections: BTreeSet::new(),
            auto_sync: false,
            active: true,
            revision: Revision::UNSAVED,
        }
    }

    /// Creates an advanced-mode policy from expression source.
    pub fn from_expression(id: impl Into<PolicyId>, source: impl Into<String>) -> Self {
        let id = id.into();
        let name = id.to_string();
        Self::new(id, name, PolicyDefinition::Expression(source.into()))
    }

    /// Creates a simple-mode policy from a rule list.
    pub fn from_rules(id: impl Into<PolicyId>, rules: Vec<Rule>) -> Self {
        let id = id.into();
        let name = id.to_string();
        Self::new(id, name, PolicyDefinition::Rules(rules))
    }

    /// Adds a target collection (builder pattern).
    pub fn with_collection(mut self, collection: impl Into<CollectionId>) -> Self {
        self.collections.insert(collection.into());
        self
    }

    /// Sets the auto-sync flag (builder pattern).
    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }

    /// Sets the active flag (builder pattern).
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn targets(&self, collection: &CollectionId) -> bool {
        self.collections.contains(collection)
    }

    /// Returns `true` when sync passes should reconcile this policy.
    pub fn is_synced(&self) -> bool {
        self.active && self.auto_sync
    }

    /// Compiles the definition, pinning the result to the current revision.
    pub fn compile(&self) -> Result<CompiledPolicy> {
        let expression = match &self.definition {
            PolicyDefinition::Rules(rules) => compile_rules(rules)?,
            PolicyDefinition::Expression(source) => expression::compile(source)?,
        };

        debug!(
            policy_id = %self.id,
            revision = %self.revision,
            attributes = ?expression.attributes(),
            "Compiled policy"
        );

        Ok(CompiledPolicy {
            policy_id: self.id.clone(),
            revision: self.revision,
            expression,
        })
    }

    /// Renders the definition as advanced-mode source.
    ///
    /// Used when an administrator switches a simple-mode policy to advanced mode.
    pub fn to_expression_source(&self) -> Result<String> {
        match &self.definition {
            PolicyDefinition::Expression(source) => Ok(source.clone()),
            PolicyDefinition::Rules(rules) => Ok(compile_rules(rules)?.to_string()),
        }
    }
}

// ============================================================================
// CompiledPolicy
// ============================================================================

/// A policy's compiled expression, pinned to the revision it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPolicy {
    pub policy_id: PolicyId,
    pub revision: Revision,
    pub expression: CompiledExpression,
}

impl CompiledPolicy {
    /// Returns `true` if the attribute set satisfies the policy.
    pub fn is_satisfied_by(&self, attributes: &AttributeSet) -> bool {
        evaluator::evaluate(&self.expression, attributes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_compile_to_conjunction() {
        let policy = Policy::from_rules(
            "p1",
            vec![
                Rule::equals("Dept", "Engineering"),
                Rule::new("Office", RuleOperator::In, &["Remote", "Berlin"]),
            ],
        );
        let compiled = policy.compile().expect("compile");

        let remote_engineer = AttributeSet::new()
            .with("Dept", "Engineering")
            .with("Office", "Remote");
        let hq_engineer = AttributeSet::new()
            .with("Dept", "Engineering")
            .with("Office", "HQ");

        assert!(compiled.is_satisfied_by(&remote_engineer));
        assert!(!compiled.is_satisfied_by(&hq_engineer));
    }

    #[test]
    fn test_rules_and_expression_are_equivalent() {
        let simple = Policy::from_rules(
            "p1",
            vec![
                Rule::equals("Dept", "Engineering"),
                Rule::equals("Office", "Remote"),
            ],
        );
        let advanced =
            Policy::from_expression("p1", r#"Dept == "Engineering" && Office == "Remote""#);

        assert_eq!(
            simple.compile().expect("simple").expression,
            advanced.compile().expect("advanced").expression
        );
    }

    #[test]
    fn test_empty_rule_list_is_rejected() {
        let err = Policy::from_rules("p1", vec![]).compile().unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::Empty);
    }

    #[test]
    fn test_rule_arity_errors_report_rule_index() {
        let err = compile_rules(&[
            Rule::equals("Dept", "Engineering"),
            Rule::new("Office", RuleOperator::Equals, &["a", "b"]),
        ])
        .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::TypeMismatch);
        assert_eq!(err.position, 1);

        let err = compile_rules(&[Rule::new("Office", RuleOperator::IsSet, &["x"])]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::TypeMismatch);

        let err = compile_rules(&[Rule::new("Office", RuleOperator::NotIn, &[])]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::TypeMismatch);
    }

    #[test]
    fn test_invalid_rule_attribute() {
        let err = compile_rules(&[Rule::equals("bad name", "x")]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::Syntax);
    }

    #[test]
    fn test_switch_to_advanced_mode() {
        let policy = Policy::from_rules(
            "p1",
            vec![
                Rule::equals("Dept", "Engineering"),
                Rule::new("Clearance", RuleOperator::IsSet, &[]),
            ],
        );
        let source = policy.to_expression_source().expect("render");
        assert_eq!(source, r#"Dept == "Engineering" && Clearance is set"#);

        let advanced = Policy::from_expression("p1", source);
        assert_eq!(
            advanced.compile().expect("advanced").expression,
            policy.compile().expect("simple").expression
        );
    }

    #[test]
    fn test_rule_attribute_prefix_matches_expression() {
        let simple = Policy::from_rules("p1", vec![Rule::equals("user.attributes.Dept", "Engineering")]);
        let advanced = Policy::from_expression("p1", r#"user.attributes.Dept == "Engineering""#);

        let source = simple.to_expression_source().expect("render");
        assert_eq!(source, r#"Dept == "Engineering""#);
        assert_eq!(
            simple.compile().expect("simple").expression,
            advanced.compile().expect("advanced").expression
        );
        assert_eq!(
            Policy::from_expression("p1", source).compile().expect("reparse").expression,
            simple.compile().expect("simple").expression
        );
    }

    #[test]
    fn test_compiled_policy_pins_revision() {
        let mut policy = Policy::from_expression("p1", "Dept is set");
        policy.revision = Revision::new(7);
        let compiled = policy.compile().expect("compile");

        assert_eq!(compiled.policy_id, PolicyId::from("p1"));
        assert_eq!(compiled.revision, Revision::new(7));
    }

    #[test]
    fn test_policy_serialization_roundtrip() {
        let policy = Policy::from_rules("p1", vec![Rule::equals("Dept", "Sales")])
            .with_collection("town-square")
            .with_auto_sync(true);

        let json = serde_json::to_string(&policy).expect("serialize policy");
        let deserialized: Policy = serde_json::from_str(&json).expect("deserialize policy");
        assert_eq!(deserialized, policy);
    }

    #[test]
    fn test_is_synced() {
        let policy = Policy::from_expression("p1", "Dept is set");
        assert!(!policy.is_synced());
        assert!(policy.clone().with_auto_sync(true).is_synced());
        assert!(!policy.with_auto_sync(true).with_active(false).is_synced());
    }
}
