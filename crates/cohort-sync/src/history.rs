//! Sync run records and their append-only history.

use std::collections::VecDeque;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use cohort_config::HistoryConfig;
use cohort_types::{CollectionId, PolicyId, Revision, UserId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::traits::SyncRunStore;

// ============================================================================
// Identifiers and triggers
// ============================================================================

/// Sequential identifier of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncRunId(u64);

impl SyncRunId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for SyncRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Why a sync run was started.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "policy_id")]
pub enum SyncTrigger {
    /// A policy was saved; only that policy is reconciled.
    PolicySaved(PolicyId),
    /// Periodic pass over every active auto-synced policy.
    Scheduled,
    /// Administrator-initiated pass over every active auto-synced policy.
    Manual,
    /// Explicit cleanup of an inactive policy's remaining memberships.
    OrphanSweep(PolicyId),
}

impl Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PolicySaved(id) => write!(f, "policy-saved({id})"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Manual => write!(f, "manual"),
            Self::OrphanSweep(id) => write!(f, "orphan-sweep({id})"),
        }
    }
}

// ============================================================================
// SyncRun
// ============================================================================

/// Terminal (or in-flight) state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::PartiallyFailed => write!(f, "partially failed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Counts for one policy on one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairReport {
    pub policy_id: PolicyId,
    pub revision: Revision,
    pub collection_id: CollectionId,
    pub evaluated: usize,
    pub satisfying: usize,
    pub added: usize,
    pub attributed: usize,
    pub removed: usize,
    pub detached: usize,
    pub handed_off: usize,
    /// Users excluded because their attributes could not be read.
    pub skipped_users: usize,
}

impl PairReport {
    pub fn mutations(&self) -> usize {
        self.added + self.attributed + self.removed + self.detached + 2 * self.handed_off
    }
}

/// One recorded failure inside a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItemError {
    pub policy_id: Option<PolicyId>,
    pub collection_id: Option<CollectionId>,
    pub user_id: Option<UserId>,
    pub message: String,
}

impl SyncItemError {
    pub fn new(
        policy_id: Option<&PolicyId>,
        collection_id: Option<&CollectionId>,
        error: &SyncError,
    ) -> Self {
        Self {
            policy_id: policy_id.cloned(),
            collection_id: collection_id.cloned(),
            user_id: error.user_id().cloned(),
            message: error.to_string(),
        }
    }
}

/// Record of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: SyncRunId,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub pairs: Vec<PairReport>,
    pub errors: Vec<SyncItemError>,
}

impl SyncRun {
    fn started(id: SyncRunId, trigger: SyncTrigger) -> Self {
        Self {
            id,
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            status: SyncStatus::Running,
            pairs: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status != SyncStatus::Running
    }

    pub fn total_added(&self) -> usize {
        self.pairs.iter().map(|p| p.added + p.attributed).sum()
    }

    pub fn total_removed(&self) -> usize {
        self.pairs.iter().map(|p| p.removed + p.detached).sum()
    }

    /// Every membership mutation the run performed.
    pub fn mutations(&self) -> usize {
        self.pairs.iter().map(PairReport::mutations).sum()
    }

    pub fn skipped_users(&self) -> usize {
        self.pairs.iter().map(|p| p.skipped_users).sum()
    }

    /// Reports for one policy, across its collections.
    pub fn reports_for<'a>(&'a self, policy_id: &'a PolicyId) -> impl Iterator<Item = &'a PairReport> {
        self.pairs.iter().filter(move |p| &p.policy_id == policy_id)
    }

    pub(crate) fn record_error(
        &mut self,
        policy_id: Option<&PolicyId>,
        collection_id: Option<&CollectionId>,
        error: &SyncError,
    ) {
        self.errors.push(SyncItemError::new(policy_id, collection_id, error));
    }

    fn conclude(&self) -> SyncStatus {
        if self.errors.is_empty() && self.skipped_users() == 0 {
            SyncStatus::Succeeded
        } else if self.pairs.is_empty() {
            SyncStatus::Failed
        } else {
            SyncStatus::PartiallyFailed
        }
    }
}

// ============================================================================
// SyncHistory
// ============================================================================

/// Append-only, bounded history of sync runs.
///
/// A run is recorded as `Running` by [`SyncHistory::begin`] and finalized
/// exactly once by [`SyncHistory::finish`]. Finalized runs never change;
/// the oldest are dropped once more than `max_runs` are retained.
#[derive(Debug)]
pub struct SyncHistory {
    runs: RwLock<VecDeque<SyncRun>>,
    next_id: AtomicU64,
    max_runs: usize,
}

impl SyncHistory {
    pub fn new(config: &HistoryConfig) -> Self {
        Self {
            runs: RwLock::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            max_runs: config.max_runs.max(1),
        }
    }

    /// Records a new `Running` run and returns a working copy of it.
    pub fn begin(&self, trigger: SyncTrigger) -> Result<SyncRun> {
        let id = SyncRunId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let run = SyncRun::started(id, trigger);

        let mut runs = self
            .runs
            .write()
            .map_err(|_| SyncError::internal("sync history lock poisoned"))?;
        runs.push_back(run.clone());

        debug!(run_id = %id, trigger = %run.trigger, "Sync run started");
        Ok(run)
    }

    /// Finalizes a run begun by this history and returns the stored record.
    pub fn finish(&self, mut run: SyncRun) -> Result<SyncRun> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| SyncError::internal("sync history lock poisoned"))?;

        let slot = runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or_else(|| SyncError::internal(format!("{} was never begun", run.id)))?;
        if slot.is_finished() {
            return Err(SyncError::internal(format!("{} is already finalized", run.id)));
        }

        run.status = run.conclude();
        run.finished_at = Some(Utc::now());
        *slot = run.clone();

        let mut finished = runs.iter().filter(|r| r.is_finished()).count();
        while finished > self.max_runs {
            match runs.iter().position(SyncRun::is_finished) {
                Some(oldest) => {
                    runs.remove(oldest);
                    finished -= 1;
                }
                None => break,
            }
        }

        Ok(run)
    }
}

impl SyncRunStore for SyncHistory {
    fn latest(&self) -> Result<Option<SyncRun>> {
        let runs = self
            .runs
            .read()
            .map_err(|_| SyncError::internal("sync history lock poisoned"))?;
        Ok(runs.iter().max_by_key(|r| r.id).cloned())
    }

    fn list(&self) -> Result<Vec<SyncRun>> {
        let runs = self
            .runs
            .read()
            .map_err(|_| SyncError::internal("sync history lock poisoned"))?;
        let mut all: Vec<SyncRun> = runs.iter().cloned().collect();
        all.sort_by_key(|r| r.id);
        Ok(all)
    }

    fn get(&self, id: SyncRunId) -> Result<Option<SyncRun>> {
        let runs = self
            .runs
            .read()
            .map_err(|_| SyncError::internal("sync history lock poisoned"))?;
        Ok(runs.iter().find(|r| r.id == id).cloned())
    }
}
