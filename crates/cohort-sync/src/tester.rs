//! Dry-run access tests for draft policies.
//!
//! The tester runs the resolver the sync runner uses, on the same compiled
//! form, so a preview always matches what a sync of the saved policy would
//! do. Nothing here writes to any store.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use cohort_abac::{CompileError, Policy};
use cohort_types::{CollectionId, PolicyId, Revision, UserId};
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::reconciler::{self, MembershipDelta};
use crate::resolver::Resolution;
use crate::runner::{self, SyncRunner};

// ============================================================================
// Reports
// ============================================================================

/// Satisfying set of a draft policy, with explicit partial-failure detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessReport {
    pub policy_id: PolicyId,
    pub revision: Revision,
    pub satisfying: BTreeSet<UserId>,
    /// Users left out because their attributes could not be read.
    pub skipped: BTreeMap<UserId, String>,
    pub evaluated: usize,
}

impl AccessReport {
    fn from_resolution(resolution: Resolution) -> Self {
        Self {
            policy_id: resolution.policy_id,
            revision: resolution.revision,
            skipped: resolution
                .failures
                .into_iter()
                .map(|(user, err)| (user, err.to_string()))
                .collect(),
            satisfying: resolution.satisfying,
            evaluated: resolution.evaluated,
        }
    }

    /// `true` if every evaluated user could be decided.
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }

    /// Up to `limit` satisfying users ordered by id, starting after `after`.
    pub fn page(&self, after: Option<&UserId>, limit: usize) -> Page {
        let start = after.map_or(Bound::Unbounded, Bound::Excluded);
        let mut remaining = self.satisfying.range::<UserId, _>((start, Bound::Unbounded));

        let users: Vec<UserId> = remaining.by_ref().take(limit).cloned().collect();
        let next = if remaining.next().is_some() {
            users.last().cloned()
        } else {
            None
        };

        Page { users, next }
    }
}

/// One page of an [`AccessReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub users: Vec<UserId>,
    /// Cursor for the following page, if there is one.
    pub next: Option<UserId>,
}

/// What saving a draft would do to one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessPreview {
    pub report: AccessReport,
    pub delta: MembershipDelta,
}

// ============================================================================
// Tester
// ============================================================================

/// Front end for "test access rule" requests.
#[derive(Clone)]
pub struct AccessTester {
    runner: SyncRunner,
}

impl AccessTester {
    pub fn new(runner: SyncRunner) -> Self {
        Self { runner }
    }

    /// Resolves a draft policy against an explicit population.
    pub async fn test_access(
        &self,
        draft: &Policy,
        population: &[UserId],
    ) -> std::result::Result<AccessReport, CompileError> {
        let compiled = draft.compile()?;
        let resolution = self.runner.resolver().resolve(&compiled, population).await;

        debug!(
            policy_id = %draft.id,
            evaluated = resolution.evaluated,
            satisfying = resolution.satisfying.len(),
            skipped = resolution.skipped(),
            "Access test finished"
        );
        Ok(AccessReport::from_resolution(resolution))
    }

    /// Plans the delta a sync of `draft` would produce on `collection_id`,
    /// without applying it and regardless of the draft's auto-sync flag.
    pub async fn preview(&self, draft: &Policy, collection_id: &CollectionId) -> Result<AccessPreview> {
        let compiled = draft.compile().map_err(|source| SyncError::Compile {
            policy_id: draft.id.clone(),
            source,
        })?;

        let population = self.runner.population().eligible_users(collection_id).await?;
        let snapshot = self.runner.reconciler().snapshot(collection_id).await?;
        let candidates = runner::candidates(&population, &snapshot, &draft.id);
        let resolution = self.runner.resolver().resolve(&compiled, &candidates).await;

        // The stored version of the draft is replaced by the draft itself.
        let active: Vec<Policy> = self
            .runner
            .repository()
            .list_active()
            .await?
            .into_iter()
            .filter(|p| p.id != draft.id)
            .collect();
        let (compiled_active, _) = runner::compile_all(&active);
        let siblings = runner::siblings_of(&active, &compiled_active, &draft.id, collection_id);
        let siblings = self
            .runner
            .resolve_siblings(&siblings, &snapshot, &resolution)
            .await;

        let delta = reconciler::reconcile(&snapshot, &resolution, &siblings);

        debug!(
            policy_id = %draft.id,
            collection_id = %collection_id,
            pending = delta.mutation_count(),
            "Access preview planned"
        );
        Ok(AccessPreview {
            report: AccessReport::from_resolution(resolution),
            delta,
        })
    }
}
