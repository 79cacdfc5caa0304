//! Membership reconciliation.
//!
//! Planning is pure: one fixed membership snapshot plus one fixed resolution
//! yield a [`MembershipDelta`]. Applying the delta is a separate step that
//! issues individual, policy-attributed mutations and records each failure
//! without stopping the others.
//!
//! Guarantees of [`reconcile`]:
//! - manual rows never appear in any set;
//! - users whose lookup failed are never removed or detached;
//! - a row attributed only to this policy whose user satisfies another
//!   active, auto-synced policy on the collection is handed off rather than
//!   removed;
//! - a row whose user only satisfies report-only policies is kept as is.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use cohort_abac::Policy;
use cohort_config::SyncConfig;
use cohort_types::{CollectionId, MembershipRecord, PolicyId, UserId};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{MembershipMutationError, MembershipStoreError, MutationOp, SyncError};
use crate::resolver::Resolution;
use crate::traits::CollectionMembership;

// ============================================================================
// Snapshot
// ============================================================================

/// One fixed read of a collection's membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipSnapshot {
    pub collection_id: CollectionId,
    records: BTreeMap<UserId, MembershipRecord>,
}

impl MembershipSnapshot {
    pub fn new(collection_id: CollectionId, records: impl IntoIterator<Item = MembershipRecord>) -> Self {
        let records = records
            .into_iter()
            .filter(|r| r.collection_id == collection_id)
            .map(|r| (r.user_id.clone(), r))
            .collect();
        Self {
            collection_id,
            records,
        }
    }

    pub fn get(&self, user_id: &UserId) -> Option<&MembershipRecord> {
        self.records.get(user_id)
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.records.contains_key(user_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &MembershipRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Users whose row carries an attribution to `policy_id`.
    pub fn attributed_to(&self, policy_id: &PolicyId) -> Vec<UserId> {
        self.records()
            .filter(|r| r.is_attributed_to(policy_id))
            .map(|r| r.user_id.clone())
            .collect()
    }
}

// ============================================================================
// Delta
// ============================================================================

/// Membership changes that bring a collection in line with one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipDelta {
    pub policy_id: PolicyId,
    pub collection_id: CollectionId,
    /// Satisfying users with no membership row.
    pub to_add: BTreeSet<UserId>,
    /// Satisfying users holding a policy row not yet attributed to this policy.
    pub to_attribute: BTreeSet<UserId>,
    /// Rows attributed solely to this policy whose user satisfies nothing.
    pub to_remove: BTreeSet<UserId>,
    /// Rows shared with other policies whose user no longer satisfies this one.
    pub to_detach: BTreeSet<UserId>,
    /// Rows attributed solely to this policy, taken over by the given sibling.
    pub handoffs: BTreeMap<UserId, PolicyId>,
    /// Rows kept, still attributed to this policy, because a report-only
    /// sibling is satisfied. Report-only policies are never written for.
    pub retained: BTreeSet<UserId>,
    /// Users left untouched because a lookup failed.
    pub undetermined: BTreeSet<UserId>,
}

impl MembershipDelta {
    fn new(policy_id: PolicyId, collection_id: CollectionId) -> Self {
        Self {
            policy_id,
            collection_id,
            to_add: BTreeSet::new(),
            to_attribute: BTreeSet::new(),
            to_remove: BTreeSet::new(),
            to_detach: BTreeSet::new(),
            handoffs: BTreeMap::new(),
            retained: BTreeSet::new(),
            undetermined: BTreeSet::new(),
        }
    }

    /// `true` when applying the delta would issue no mutation.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty()
            && self.to_attribute.is_empty()
            && self.to_remove.is_empty()
            && self.to_detach.is_empty()
            && self.handoffs.is_empty()
    }

    /// Number of mutations applying the delta issues.
    pub fn mutation_count(&self) -> usize {
        self.to_add.len()
            + self.to_attribute.len()
            + self.to_remove.len()
            + self.to_detach.len()
            + 2 * self.handoffs.len()
    }
}

/// Resolution of another active policy targeting the same collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sibling {
    pub resolution: Resolution,
    pub auto_sync: bool,
}

impl Sibling {
    pub fn synced(resolution: Resolution) -> Self {
        Self {
            resolution,
            auto_sync: true,
        }
    }

    pub fn report_only(resolution: Resolution) -> Self {
        Self {
            resolution,
            auto_sync: false,
        }
    }

    fn policy_id(&self) -> &PolicyId {
        &self.resolution.policy_id
    }
}

/// Computes the delta for one policy on one collection.
///
/// `siblings` are resolutions of the other active policies targeting the
/// collection. They only need to cover the users this policy may remove.
/// Only auto-synced siblings inherit rows; a satisfied report-only sibling
/// keeps the row where it is.
pub fn reconcile(
    snapshot: &MembershipSnapshot,
    resolution: &Resolution,
    siblings: &[Sibling],
) -> MembershipDelta {
    let policy_id = &resolution.policy_id;
    let mut delta = MembershipDelta::new(policy_id.clone(), snapshot.collection_id.clone());

    // -- Additions --
    for user_id in &resolution.satisfying {
        match snapshot.get(user_id) {
            None => {
                delta.to_add.insert(user_id.clone());
            }
            Some(record) if record.is_manual() || record.is_attributed_to(policy_id) => {}
            Some(_) => {
                delta.to_attribute.insert(user_id.clone());
            }
        }
    }

    // -- Withdrawals --
    let mut siblings: Vec<&Sibling> = siblings
        .iter()
        .filter(|s| s.policy_id() != policy_id)
        .collect();
    siblings.sort_by(|a, b| a.policy_id().cmp(b.policy_id()));

    for record in snapshot.records() {
        let user_id = &record.user_id;
        if record.is_manual()
            || !record.is_attributed_to(policy_id)
            || resolution.is_satisfied_by(user_id)
        {
            continue;
        }
        if resolution.is_undetermined(user_id) {
            delta.undetermined.insert(user_id.clone());
            continue;
        }
        if !record.attributed_solely_to(policy_id) {
            delta.to_detach.insert(user_id.clone());
            continue;
        }

        if let Some(heir) = siblings
            .iter()
            .find(|s| s.auto_sync && s.resolution.is_satisfied_by(user_id))
        {
            delta.handoffs.insert(user_id.clone(), heir.policy_id().clone());
        } else if siblings.iter().any(|s| s.resolution.is_undetermined(user_id)) {
            delta.undetermined.insert(user_id.clone());
        } else if siblings.iter().any(|s| s.resolution.is_satisfied_by(user_id)) {
            delta.retained.insert(user_id.clone());
        } else {
            delta.to_remove.insert(user_id.clone());
        }
    }

    for user_id in resolution.failures.keys() {
        if snapshot.get(user_id).is_none_or(|r| !r.is_manual()) {
            delta.undetermined.insert(user_id.clone());
        }
    }

    debug!(
        policy_id = %delta.policy_id,
        collection_id = %delta.collection_id,
        add = delta.to_add.len(),
        attribute = delta.to_attribute.len(),
        remove = delta.to_remove.len(),
        detach = delta.to_detach.len(),
        handoff = delta.handoffs.len(),
        retained = delta.retained.len(),
        undetermined = delta.undetermined.len(),
        "Planned membership delta"
    );

    delta
}

// ============================================================================
// Apply
// ============================================================================

/// Result of applying (or declining to apply) a delta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    /// `false` when the policy is not auto-synced; counts are then zero.
    pub applied: bool,
    pub added: usize,
    pub attributed: usize,
    pub removed: usize,
    pub detached: usize,
    pub handed_off: usize,
    #[serde(skip)]
    pub errors: Vec<SyncError>,
}

impl ApplyOutcome {
    /// Total mutations that succeeded.
    pub fn mutations(&self) -> usize {
        self.added + self.attributed + self.removed + self.detached + 2 * self.handed_off
    }
}

/// Reads collection snapshots and applies planned deltas.
#[derive(Clone)]
pub struct MembershipReconciler {
    membership: Arc<dyn CollectionMembership>,
    mutation_timeout: Duration,
}

impl MembershipReconciler {
    pub fn new(membership: Arc<dyn CollectionMembership>, config: &SyncConfig) -> Self {
        Self {
            membership,
            mutation_timeout: config.mutation_timeout(),
        }
    }

    /// Reads the collection's membership once.
    pub async fn snapshot(
        &self,
        collection_id: &CollectionId,
    ) -> Result<MembershipSnapshot, MembershipStoreError> {
        let records = self.membership.list_members(collection_id).await?;
        Ok(MembershipSnapshot::new(collection_id.clone(), records))
    }

    /// Collections holding rows attributed to `policy_id`.
    pub async fn collections_attributed_to(
        &self,
        policy_id: &PolicyId,
    ) -> Result<Vec<CollectionId>, MembershipStoreError> {
        self.membership.collections_attributed_to(policy_id).await
    }

    /// Applies `delta` if `policy` is auto-synced; otherwise reports it only.
    pub async fn apply(&self, policy: &Policy, delta: &MembershipDelta) -> ApplyOutcome {
        if !policy.auto_sync {
            debug!(
                policy_id = %policy.id,
                collection_id = %delta.collection_id,
                pending = delta.mutation_count(),
                "Auto-sync disabled, delta not applied"
            );
            return ApplyOutcome::default();
        }
        self.execute(delta).await
    }

    /// Applies `delta` unconditionally.
    ///
    /// Every user is handled independently; a failed mutation is recorded
    /// and the next user is processed.
    pub(crate) async fn execute(&self, delta: &MembershipDelta) -> ApplyOutcome {
        let mut outcome = ApplyOutcome {
            applied: true,
            ..ApplyOutcome::default()
        };
        let collection_id = &delta.collection_id;
        let policy_id = &delta.policy_id;

        for user_id in &delta.to_add {
            match self.mutate(MutationOp::Add, collection_id, user_id, policy_id).await {
                Ok(()) => outcome.added += 1,
                Err(e) => outcome.errors.push(e),
            }
        }

        for user_id in &delta.to_attribute {
            match self.mutate(MutationOp::Attribute, collection_id, user_id, policy_id).await {
                Ok(()) => outcome.attributed += 1,
                Err(e) => outcome.errors.push(e),
            }
        }

        // The heir is attributed before this policy lets go, so the
        // membership never lapses. A failed attribution keeps the row as is.
        for (user_id, heir) in &delta.handoffs {
            if let Err(e) = self.mutate(MutationOp::Attribute, collection_id, user_id, heir).await {
                outcome.errors.push(e);
                continue;
            }
            match self.mutate(MutationOp::Detach, collection_id, user_id, policy_id).await {
                Ok(()) => outcome.handed_off += 1,
                Err(e) => outcome.errors.push(e),
            }
        }

        for user_id in &delta.to_detach {
            match self.mutate(MutationOp::Detach, collection_id, user_id, policy_id).await {
                Ok(()) => outcome.detached += 1,
                Err(e) => outcome.errors.push(e),
            }
        }

        for user_id in &delta.to_remove {
            match self.mutate(MutationOp::Remove, collection_id, user_id, policy_id).await {
                Ok(()) => outcome.removed += 1,
                Err(e) => outcome.errors.push(e),
            }
        }

        info!(
            policy_id = %policy_id,
            collection_id = %collection_id,
            added = outcome.added,
            attributed = outcome.attributed,
            removed = outcome.removed,
            detached = outcome.detached,
            handed_off = outcome.handed_off,
            failed = outcome.errors.len(),
            "Applied membership delta"
        );

        outcome
    }

    async fn mutate(
        &self,
        op: MutationOp,
        collection_id: &CollectionId,
        user_id: &UserId,
        policy_id: &PolicyId,
    ) -> Result<(), SyncError> {
        let call = async {
            match op {
                MutationOp::Add | MutationOp::Attribute => {
                    self.membership.add(collection_id, user_id, policy_id).await
                }
                MutationOp::Remove | MutationOp::Detach => {
                    self.membership.remove(collection_id, user_id, policy_id).await
                }
            }
        };

        let result = match tokio::time::timeout(self.mutation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(MembershipMutationError::Timeout(self.mutation_timeout)),
        };

        result.map_err(|source| {
            warn!(
                op = %op,
                collection_id = %collection_id,
                user_id = %user_id,
                policy_id = %policy_id,
                error = %source,
                "Membership mutation failed"
            );
            SyncError::Mutation {
                op,
                collection_id: collection_id.clone(),
                user_id: user_id.clone(),
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests;
