//! # cohort-types: Core types for `Cohort`
//!
//! This crate contains shared types used across the `Cohort` engine:
//! - Entity IDs ([`UserId`], [`PolicyId`], [`CollectionId`])
//! - Policy revisions ([`Revision`])
//! - User attributes ([`AttributeValue`], [`AttributeSet`])
//! - Membership provenance ([`Origin`], [`MembershipRecord`])

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

// ============================================================================
// Entity IDs - Clone (opaque string identifiers issued by the host service)
// ============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Unique identifier for a user whose attributes drive membership.
    UserId
);

string_id!(
    /// Unique identifier for an access policy. Immutable for the policy's lifetime.
    PolicyId
);

string_id!(
    /// Unique identifier for a restricted collection (e.g. a private channel).
    CollectionId
);

// ============================================================================
// Revision - Copy (monotonic edit counter)
// ============================================================================

/// Edit counter of a policy, incremented by the repository on every save.
///
/// A compiled expression is pinned to the revision it was compiled from; a
/// new revision always means a fresh compilation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    /// Revision of a policy that has never been saved.
    pub const UNSAVED: Revision = Revision(0);

    pub fn new(revision: u64) -> Self {
        Self(revision)
    }

    /// Returns the revision that follows this one.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl From<u64> for Revision {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Revision> for u64 {
    fn from(revision: Revision) -> Self {
        revision.0
    }
}

// ============================================================================
// Attribute Values - Clone (loosely typed values from the attribute store)
// ============================================================================

/// A single attribute value, tagged by shape.
///
/// Attribute stores hand back loosely typed data; it is modelled here as a
/// tagged union instead of being coerced. An empty string and an empty set
/// both count as absent (see [`AttributeValue::is_absent`]).
///
/// In JSON a scalar is a string, a set is an array of strings and an absent
/// value is `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A single string value, e.g. `"Engineering"`.
    Scalar(String),
    /// A multi-valued attribute, e.g. a set of program codes.
    Set(BTreeSet<String>),
    /// No value recorded for this user.
    #[default]
    Absent,
}

static ABSENT: AttributeValue = AttributeValue::Absent;

impl AttributeValue {
    pub fn scalar(value: impl Into<String>) -> Self {
        Self::Scalar(value.into())
    }

    pub fn set<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Set(values.into_iter().map(Into::into).collect())
    }

    /// Returns `true` when the value carries no usable data.
    pub fn is_absent(&self) -> bool {
        match self {
            Self::Scalar(s) => s.is_empty(),
            Self::Set(s) => s.is_empty(),
            Self::Absent => true,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Scalar(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Scalar(value)
    }
}

// ============================================================================
// Attribute Set - Clone (one user's attribute snapshot)
// ============================================================================

/// Mapping from attribute name to value for a single user.
///
/// Supplied by the attribute provider and never mutated by the engine once
/// handed to an evaluation pass. Lookups of unknown names yield
/// [`AttributeValue::Absent`] rather than failing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeSet(BTreeMap<String, AttributeValue>);

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a scalar attribute (builder pattern).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), AttributeValue::Scalar(value.into()));
        self
    }

    /// Adds a set-valued attribute (builder pattern).
    pub fn with_set<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.insert(name.into(), AttributeValue::set(values));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: AttributeValue) {
        self.0.insert(name.into(), value);
    }

    /// Returns the value for `name`, or `Absent` when the user has none.
    pub fn get(&self, name: &str) -> &AttributeValue {
        self.0.get(name).unwrap_or(&ABSENT)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>> FromIterator<(K, AttributeValue)> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = (K, AttributeValue)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

// ============================================================================
// Membership - Clone (rows of the collection membership store)
// ============================================================================

/// Provenance of a membership row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Added by an administrator, or present before auto-sync was enabled.
    /// The engine never removes these.
    Manual,
    /// Added by the engine on behalf of one or more policies.
    Policy,
}

impl Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Policy => write!(f, "policy"),
        }
    }
}

/// Association between a user and a collection.
///
/// Rows of origin [`Origin::Policy`] record every policy that currently
/// justifies them. The row disappears once its last attribution is withdrawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub user_id: UserId,
    pub collection_id: CollectionId,
    pub origin: Origin,
    /// Policies justifying a `Policy`-origin row. Always empty for `Manual` rows.
    #[serde(default)]
    pub policies: BTreeSet<PolicyId>,
}

impl MembershipRecord {
    pub fn manual(collection_id: CollectionId, user_id: UserId) -> Self {
        Self {
            user_id,
            collection_id,
            origin: Origin::Manual,
            policies: BTreeSet::new(),
        }
    }

    pub fn from_policy(collection_id: CollectionId, user_id: UserId, policy_id: PolicyId) -> Self {
        Self {
            user_id,
            collection_id,
            origin: Origin::Policy,
            policies: BTreeSet::from([policy_id]),
        }
    }

    pub fn is_manual(&self) -> bool {
        self.origin == Origin::Manual
    }

    pub fn is_attributed_to(&self, policy_id: &PolicyId) -> bool {
        self.origin == Origin::Policy && self.policies.contains(policy_id)
    }

    /// Returns `true` if `policy_id` is the only policy justifying this row.
    pub fn attributed_solely_to(&self, policy_id: &PolicyId) -> bool {
        self.is_attributed_to(policy_id) && self.policies.len() == 1
    }
}
