//! Policy administration entry point.

use std::sync::Arc;

use cohort_abac::Policy;
use cohort_types::{PolicyId, Revision};
use serde::Serialize;
use tracing::info;

use crate::error::ServiceError;
use crate::history::SyncTrigger;
use crate::queue::SyncQueue;
use crate::traits::PolicyRepository;

/// Result of a successful save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedPolicy {
    pub policy_id: PolicyId,
    pub revision: Revision,
    /// `true` if a sync run was queued (or coalesced into a queued one).
    pub sync_scheduled: bool,
}

/// Validates, persists and schedules policies.
#[derive(Clone)]
pub struct PolicyService {
    repository: Arc<dyn PolicyRepository>,
    queue: SyncQueue,
}

impl PolicyService {
    pub fn new(repository: Arc<dyn PolicyRepository>, queue: SyncQueue) -> Self {
        Self { repository, queue }
    }

    /// Saves a policy.
    ///
    /// A policy that does not compile is rejected before anything is
    /// written. A saved policy that is active and auto-synced gets a
    /// `PolicySaved` sync run queued for it.
    pub async fn save(&self, policy: Policy) -> Result<SavedPolicy, ServiceError> {
        policy.compile()?;

        let policy_id = policy.id.clone();
        let schedule = policy.is_synced();
        let revision = self.repository.save(policy).await?;

        if schedule {
            self.queue
                .enqueue(SyncTrigger::PolicySaved(policy_id.clone()))
                .await?;
        }

        info!(
            policy_id = %policy_id,
            revision = %revision,
            sync_scheduled = schedule,
            "Policy saved"
        );

        Ok(SavedPolicy {
            policy_id,
            revision,
            sync_scheduled: schedule,
        })
    }
}
