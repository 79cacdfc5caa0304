//! Error taxonomy for the sync engine.
//!
//! Failures are isolated to the smallest unit that can absorb them: a user
//! (lookup errors), a single membership mutation, a policy/collection pair,
//! and only then a whole run.

use std::fmt::{self, Display};
use std::time::Duration;

use cohort_abac::CompileError;
use cohort_types::{CollectionId, PolicyId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Attribute lookup failed for one user; that user is skipped for the pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttributeLookupError {
    #[error("user {0} not found in attribute store")]
    NotFound(UserId),

    #[error("attribute provider unavailable: {0}")]
    Unavailable(String),

    #[error("attribute lookup timed out after {0:?}")]
    Timeout(Duration),
}

/// A single add or remove was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipMutationError {
    #[error("membership store rejected the change: {0}")]
    Rejected(String),

    #[error("membership store unavailable: {0}")]
    Unavailable(String),

    #[error("membership change timed out after {0:?}")]
    Timeout(Duration),
}

/// Reading a collection's current membership failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipStoreError {
    #[error("collection {0} not found")]
    CollectionNotFound(CollectionId),

    #[error("membership store unavailable: {0}")]
    Unavailable(String),
}

/// Listing, loading or saving policies failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("policy {0} not found")]
    NotFound(PolicyId),

    #[error("policy repository unavailable: {0}")]
    Unavailable(String),
}

/// The candidate population for a collection could not be determined.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PopulationError {
    #[error("collection {0} not found")]
    CollectionNotFound(CollectionId),

    #[error("population source unavailable: {0}")]
    Unavailable(String),
}

/// Kind of membership mutation issued by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    /// New policy-origin row.
    Add,
    /// Existing policy-origin row gains an attribution.
    Attribute,
    /// Sole attribution withdrawn; the row disappears.
    Remove,
    /// One of several attributions withdrawn; the row stays.
    Detach,
}

impl Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Attribute => write!(f, "attribute"),
            Self::Remove => write!(f, "remove"),
            Self::Detach => write!(f, "detach"),
        }
    }
}

/// Error raised while processing a sync run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("policy {policy_id} does not compile: {source}")]
    Compile {
        policy_id: PolicyId,
        #[source]
        source: CompileError,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Population(#[from] PopulationError),

    #[error(transparent)]
    Membership(#[from] MembershipStoreError),

    #[error("failed to {op} {user_id} in {collection_id}: {source}")]
    Mutation {
        op: MutationOp,
        collection_id: CollectionId,
        user_id: UserId,
        #[source]
        source: MembershipMutationError,
    },

    #[error("lookup for {user_id} failed: {source}")]
    Lookup {
        user_id: UserId,
        #[source]
        source: AttributeLookupError,
    },

    #[error("policy {0} is still active; only inactive policies can be swept")]
    StillActive(PolicyId),

    #[error("sync task failed: {0}")]
    Task(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// User the error concerns, if it is a per-user failure.
    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            Self::Mutation { user_id, .. } | Self::Lookup { user_id, .. } => Some(user_id),
            _ => None,
        }
    }
}

/// Errors from the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("sync queue is closed")]
    Closed,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors from [`PolicyService::save`](crate::PolicyService::save).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The policy does not compile; nothing was saved.
    #[error("policy rejected: {0}")]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// The policy was saved but its sync could not be scheduled.
    #[error("policy saved but sync was not scheduled: {0}")]
    Queue(#[from] QueueError),
}
