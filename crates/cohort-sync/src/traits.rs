//! Seams to the surrounding service.
//!
//! The engine owns none of these stores. Hosts implement the traits over
//! their own persistence; [`crate::memory`] provides in-process versions.

use async_trait::async_trait;
use cohort_abac::Policy;
use cohort_types::{AttributeSet, CollectionId, MembershipRecord, PolicyId, Revision, UserId};

use crate::error::{
    AttributeLookupError, MembershipMutationError, MembershipStoreError, PopulationError,
    RepositoryError, Result,
};
use crate::history::{SyncRun, SyncRunId};

/// Read-only source of user attributes.
#[async_trait]
pub trait AttributeProvider: Send + Sync {
    /// Returns the user's current attributes.
    async fn attributes(&self, user_id: &UserId) -> Result<AttributeSet, AttributeLookupError>;
}

/// Durable store of policy definitions.
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    /// All policies with `active = true`.
    async fn list_active(&self) -> Result<Vec<Policy>, RepositoryError>;

    async fn get(&self, policy_id: &PolicyId) -> Result<Policy, RepositoryError>;

    /// Persists the policy and returns its new revision.
    async fn save(&self, policy: Policy) -> Result<Revision, RepositoryError>;
}

/// Membership of restricted collections.
///
/// Mutations are individual and attributed to a policy; the engine never
/// replaces a collection's membership in bulk.
#[async_trait]
pub trait CollectionMembership: Send + Sync {
    async fn list_members(
        &self,
        collection_id: &CollectionId,
    ) -> Result<Vec<MembershipRecord>, MembershipStoreError>;

    /// Collections holding at least one row attributed to `policy_id`,
    /// including ones the policy no longer targets.
    async fn collections_attributed_to(
        &self,
        policy_id: &PolicyId,
    ) -> Result<Vec<CollectionId>, MembershipStoreError>;

    /// Adds a policy-origin membership, or attributes an existing
    /// policy-origin row to `policy_id`. Manual rows are left as they are.
    async fn add(
        &self,
        collection_id: &CollectionId,
        user_id: &UserId,
        policy_id: &PolicyId,
    ) -> Result<(), MembershipMutationError>;

    /// Withdraws `policy_id`'s attribution. The row is deleted once no
    /// attribution remains. Manual rows are never deleted.
    async fn remove(
        &self,
        collection_id: &CollectionId,
        user_id: &UserId,
        policy_id: &PolicyId,
    ) -> Result<(), MembershipMutationError>;
}

/// Candidate users for a collection, typically the members of its parent team.
#[async_trait]
pub trait PopulationSource: Send + Sync {
    async fn eligible_users(&self, collection_id: &CollectionId)
    -> Result<Vec<UserId>, PopulationError>;
}

/// Query surface over sync run history.
pub trait SyncRunStore: Send + Sync {
    /// Most recently started run, finished or not.
    fn latest(&self) -> Result<Option<SyncRun>>;

    /// All retained runs, oldest first.
    fn list(&self) -> Result<Vec<SyncRun>>;

    fn get(&self, id: SyncRunId) -> Result<Option<SyncRun>>;
}
