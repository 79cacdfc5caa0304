//! Per-(policy, collection) exclusivity tokens.
//!
//! Passes over different pairs never wait on each other. Passes over the same
//! pair are strictly serialized, and waiters are served in arrival order, so
//! a pass triggered by a newer save runs once the in-flight pass finishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cohort_types::{CollectionId, PolicyId};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

use crate::error::{Result, SyncError};

type PairKey = (PolicyId, CollectionId);

/// Arena of exclusivity tokens, one per policy/collection pair.
#[derive(Debug, Default)]
pub struct ExclusivityArena {
    slots: Mutex<HashMap<PairKey, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of one reconciliation pass; released on drop.
#[derive(Debug)]
pub struct PairGuard {
    policy_id: PolicyId,
    collection_id: CollectionId,
    _token: OwnedMutexGuard<()>,
}

impl PairGuard {
    pub fn policy_id(&self) -> &PolicyId {
        &self.policy_id
    }

    pub fn collection_id(&self) -> &CollectionId {
        &self.collection_id
    }
}

impl ExclusivityArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, policy_id: &PolicyId, collection_id: &CollectionId) -> Result<Arc<AsyncMutex<()>>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| SyncError::internal("exclusivity arena lock poisoned"))?;
        let slot = slots
            .entry((policy_id.clone(), collection_id.clone()))
            .or_default();
        Ok(Arc::clone(slot))
    }

    /// Waits for the pair's token.
    pub async fn acquire(&self, policy_id: &PolicyId, collection_id: &CollectionId) -> Result<PairGuard> {
        let slot = self.slot(policy_id, collection_id)?;
        let token = slot.lock_owned().await;
        trace!(policy_id = %policy_id, collection_id = %collection_id, "Acquired pair token");

        Ok(PairGuard {
            policy_id: policy_id.clone(),
            collection_id: collection_id.clone(),
            _token: token,
        })
    }

    /// Takes the pair's token only if no pass currently holds it.
    pub fn try_acquire(&self, policy_id: &PolicyId, collection_id: &CollectionId) -> Result<Option<PairGuard>> {
        let slot = self.slot(policy_id, collection_id)?;
        Ok(slot.try_lock_owned().ok().map(|token| PairGuard {
            policy_id: policy_id.clone(),
            collection_id: collection_id.clone(),
            _token: token,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pair(p: &str, c: &str) -> (PolicyId, CollectionId) {
        (PolicyId::from(p), CollectionId::from(c))
    }

    #[tokio::test]
    async fn test_same_pair_is_exclusive() {
        let arena = ExclusivityArena::new();
        let (p, c) = pair("p1", "c1");

        let guard = arena.acquire(&p, &c).await.expect("acquire");
        assert!(arena.try_acquire(&p, &c).expect("try").is_none());

        drop(guard);
        assert!(arena.try_acquire(&p, &c).expect("try").is_some());
    }

    #[tokio::test]
    async fn test_distinct_pairs_do_not_block() {
        let arena = ExclusivityArena::new();
        let (p1, c1) = pair("p1", "c1");
        let (p2, _) = pair("p2", "c1");
        let (_, c2) = pair("p1", "c2");

        let _held = arena.acquire(&p1, &c1).await.expect("acquire");
        assert!(arena.try_acquire(&p2, &c1).expect("try").is_some());
        assert!(arena.try_acquire(&p1, &c2).expect("try").is_some());
    }

    #[tokio::test]
    async fn test_waiter_runs_after_holder_releases() {
        let arena = Arc::new(ExclusivityArena::new());
        let (p, c) = pair("p1", "c1");
        let held = arena.acquire(&p, &c).await.expect("acquire");

        let waiter = {
            let arena = Arc::clone(&arena);
            let (p, c) = (p.clone(), c.clone());
            tokio::spawn(async move { arena.acquire(&p, &c).await.map(|g| g.policy_id().clone()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let acquired = waiter.await.expect("join").expect("acquire");
        assert_eq!(acquired, p);
    }
}
