//! In-memory collaborators.
//!
//! Used by tests, the CLI and hosts that embed the engine without their own
//! stores. Each adapter supports simple fault injection.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use cohort_abac::Policy;
use cohort_types::{
    AttributeSet, CollectionId, MembershipRecord, Origin, PolicyId, Revision, UserId,
};

use crate::error::{
    AttributeLookupError, MembershipMutationError, MembershipStoreError, PopulationError,
    RepositoryError,
};
use crate::traits::{AttributeProvider, CollectionMembership, PolicyRepository, PopulationSource};

const POISONED: &str = "lock poisoned";

// ============================================================================
// Attributes
// ============================================================================

#[derive(Debug, Default)]
struct AttributeState {
    users: HashMap<UserId, AttributeSet>,
    failing: HashSet<UserId>,
    delays: HashMap<UserId, Duration>,
}

/// Attribute store backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryAttributes {
    state: RwLock<AttributeState>,
    lookups: AtomicUsize,
}

impl InMemoryAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a user's attributes.
    pub fn set(&self, user_id: impl Into<UserId>, attributes: AttributeSet) {
        if let Ok(mut state) = self.state.write() {
            state.users.insert(user_id.into(), attributes);
        }
    }

    pub fn remove(&self, user_id: &UserId) {
        if let Ok(mut state) = self.state.write() {
            state.users.remove(user_id);
        }
    }

    /// Lookups for this user fail with `Unavailable` until cleared.
    pub fn fail_lookups_for(&self, user_id: impl Into<UserId>) {
        if let Ok(mut state) = self.state.write() {
            state.failing.insert(user_id.into());
        }
    }

    /// Lookups for this user sleep before answering.
    pub fn delay_lookups_for(&self, user_id: impl Into<UserId>, delay: Duration) {
        if let Ok(mut state) = self.state.write() {
            state.delays.insert(user_id.into(), delay);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut state) = self.state.write() {
            state.failing.clear();
            state.delays.clear();
        }
    }

    /// Lookups served so far.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AttributeProvider for InMemoryAttributes {
    async fn attributes(&self, user_id: &UserId) -> Result<AttributeSet, AttributeLookupError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);

        let delay = {
            let state = self
                .state
                .read()
                .map_err(|_| AttributeLookupError::Unavailable(POISONED.to_string()))?;
            state.delays.get(user_id).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self
            .state
            .read()
            .map_err(|_| AttributeLookupError::Unavailable(POISONED.to_string()))?;
        if state.failing.contains(user_id) {
            return Err(AttributeLookupError::Unavailable(format!(
                "injected failure for {user_id}"
            )));
        }
        state
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| AttributeLookupError::NotFound(user_id.clone()))
    }
}

// ============================================================================
// Policies
// ============================================================================

#[derive(Debug, Default)]
struct PolicyState {
    policies: BTreeMap<PolicyId, Policy>,
    unavailable: bool,
}

/// Policy repository backed by a map. `save` bumps the revision.
#[derive(Debug, Default)]
pub struct InMemoryPolicies {
    state: RwLock<PolicyState>,
}

impl InMemoryPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a policy as-is, without bumping its revision.
    pub fn insert(&self, policy: Policy) {
        if let Ok(mut state) = self.state.write() {
            state.policies.insert(policy.id.clone(), policy);
        }
    }

    /// Every call fails with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.write() {
            state.unavailable = unavailable;
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, PolicyState>, RepositoryError> {
        let state = self
            .state
            .read()
            .map_err(|_| RepositoryError::Unavailable(POISONED.to_string()))?;
        if state.unavailable {
            return Err(RepositoryError::Unavailable("injected failure".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl PolicyRepository for InMemoryPolicies {
    async fn list_active(&self) -> Result<Vec<Policy>, RepositoryError> {
        Ok(self
            .read()?
            .policies
            .values()
            .filter(|p| p.active)
            .cloned()
            .collect())
    }

    async fn get(&self, policy_id: &PolicyId) -> Result<Policy, RepositoryError> {
        self.read()?
            .policies
            .get(policy_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(policy_id.clone()))
    }

    async fn save(&self, mut policy: Policy) -> Result<Revision, RepositoryError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| RepositoryError::Unavailable(POISONED.to_string()))?;
        if state.unavailable {
            return Err(RepositoryError::Unavailable("injected failure".to_string()));
        }

        let current = state
            .policies
            .get(&policy.id)
            .map_or(Revision::UNSAVED, |p| p.revision);
        policy.revision = current.max(policy.revision).next();
        let revision = policy.revision;
        state.policies.insert(policy.id.clone(), policy);
        Ok(revision)
    }
}

// ============================================================================
// Membership
// ============================================================================

#[derive(Debug, Default)]
struct MembershipState {
    rows: BTreeMap<(CollectionId, UserId), MembershipRecord>,
    failing_users: HashSet<UserId>,
    unavailable: HashSet<CollectionId>,
}

/// Collection membership backed by a map keyed by (collection, user).
#[derive(Debug, Default)]
pub struct InMemoryMembership {
    state: RwLock<MembershipState>,
    mutations: AtomicUsize,
}

impl InMemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a manual membership, as the external membership API would.
    pub fn add_manual(&self, collection_id: impl Into<CollectionId>, user_id: impl Into<UserId>) {
        self.insert(MembershipRecord::manual(collection_id.into(), user_id.into()));
    }

    /// Stores a record as-is.
    pub fn insert(&self, record: MembershipRecord) {
        if let Ok(mut state) = self.state.write() {
            state.rows.insert(
                (record.collection_id.clone(), record.user_id.clone()),
                record,
            );
        }
    }

    pub fn record(&self, collection_id: &CollectionId, user_id: &UserId) -> Option<MembershipRecord> {
        let state = self.state.read().ok()?;
        state
            .rows
            .get(&(collection_id.clone(), user_id.clone()))
            .cloned()
    }

    pub fn records(&self, collection_id: &CollectionId) -> Vec<MembershipRecord> {
        self.state.read().map_or_else(
            |_| Vec::new(),
            |state| {
                state
                    .rows
                    .values()
                    .filter(|r| &r.collection_id == collection_id)
                    .cloned()
                    .collect()
            },
        )
    }

    /// Members of a collection, any origin.
    pub fn members(&self, collection_id: &CollectionId) -> BTreeSet<UserId> {
        self.records(collection_id)
            .into_iter()
            .map(|r| r.user_id)
            .collect()
    }

    /// Mutations applied so far (successful adds and removes).
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Adds and removes for this user fail until cleared.
    pub fn fail_mutations_for(&self, user_id: impl Into<UserId>) {
        if let Ok(mut state) = self.state.write() {
            state.failing_users.insert(user_id.into());
        }
    }

    /// Listing this collection fails until cleared.
    pub fn fail_listing_for(&self, collection_id: impl Into<CollectionId>) {
        if let Ok(mut state) = self.state.write() {
            state.unavailable.insert(collection_id.into());
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut state) = self.state.write() {
            state.failing_users.clear();
            state.unavailable.clear();
        }
    }

    fn write(&self, user_id: &UserId) -> Result<std::sync::RwLockWriteGuard<'_, MembershipState>, MembershipMutationError> {
        let state = self
            .state
            .write()
            .map_err(|_| MembershipMutationError::Unavailable(POISONED.to_string()))?;
        if state.failing_users.contains(user_id) {
            return Err(MembershipMutationError::Rejected(format!(
                "injected failure for {user_id}"
            )));
        }
        Ok(state)
    }
}

#[async_trait]
impl CollectionMembership for InMemoryMembership {
    async fn list_members(
        &self,
        collection_id: &CollectionId,
    ) -> Result<Vec<MembershipRecord>, MembershipStoreError> {
        {
            let state = self
                .state
                .read()
                .map_err(|_| MembershipStoreError::Unavailable(POISONED.to_string()))?;
            if state.unavailable.contains(collection_id) {
                return Err(MembershipStoreError::Unavailable(format!(
                    "injected failure for {collection_id}"
                )));
            }
        }
        Ok(self.records(collection_id))
    }

    async fn collections_attributed_to(
        &self,
        policy_id: &PolicyId,
    ) -> Result<Vec<CollectionId>, MembershipStoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| MembershipStoreError::Unavailable(POISONED.to_string()))?;
        let collections: BTreeSet<CollectionId> = state
            .rows
            .values()
            .filter(|r| r.is_attributed_to(policy_id))
            .map(|r| r.collection_id.clone())
            .collect();
        Ok(collections.into_iter().collect())
    }

    async fn add(
        &self,
        collection_id: &CollectionId,
        user_id: &UserId,
        policy_id: &PolicyId,
    ) -> Result<(), MembershipMutationError> {
        let mut state = self.write(user_id)?;
        let key = (collection_id.clone(), user_id.clone());

        match state.rows.get_mut(&key) {
            Some(record) if record.origin == Origin::Manual => {}
            Some(record) => {
                record.policies.insert(policy_id.clone());
            }
            None => {
                state.rows.insert(
                    key,
                    MembershipRecord::from_policy(
                        collection_id.clone(),
                        user_id.clone(),
                        policy_id.clone(),
                    ),
                );
            }
        }

        self.mutations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove(
        &self,
        collection_id: &CollectionId,
        user_id: &UserId,
        policy_id: &PolicyId,
    ) -> Result<(), MembershipMutationError> {
        let mut state = self.write(user_id)?;
        let key = (collection_id.clone(), user_id.clone());

        if let Some(record) = state.rows.get_mut(&key) {
            if record.origin == Origin::Manual {
                return Ok(());
            }
            record.policies.remove(policy_id);
            if record.policies.is_empty() {
                state.rows.remove(&key);
            }
        }

        self.mutations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ============================================================================
// Population
// ============================================================================

/// Fixed candidate populations per collection.
#[derive(Debug, Default)]
pub struct InMemoryPopulation {
    populations: RwLock<HashMap<CollectionId, Vec<UserId>>>,
}

impl InMemoryPopulation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<I, U>(&self, collection_id: impl Into<CollectionId>, users: I)
    where
        I: IntoIterator<Item = U>,
        U: Into<UserId>,
    {
        if let Ok(mut populations) = self.populations.write() {
            populations.insert(
                collection_id.into(),
                users.into_iter().map(Into::into).collect(),
            );
        }
    }
}

#[async_trait]
impl PopulationSource for InMemoryPopulation {
    async fn eligible_users(
        &self,
        collection_id: &CollectionId,
    ) -> Result<Vec<UserId>, PopulationError> {
        let populations = self
            .populations
            .read()
            .map_err(|_| PopulationError::Unavailable(POISONED.to_string()))?;
        populations
            .get(collection_id)
            .cloned()
            .ok_or_else(|| PopulationError::CollectionNotFound(collection_id.clone()))
    }
}
