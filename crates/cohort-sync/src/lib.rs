//! # cohort-sync: Policy-driven collection membership
//!
//! Keeps restricted collections in line with the policies that target them.
//! The engine owns no storage; hosts plug in their own stores through the
//! traits in [`traits`].
//!
//! ## Architecture
//!
//! ```text
//! PolicyService::save ──► SyncQueue ──► SyncWorker ──► SyncRunner::run_sync
//!                                                          │
//!                         one task per (policy, collection) pair, under its
//!                         exclusivity token                │
//!                                                          ▼
//!   PopulationSource ──► PolicySatisfactionResolver ◄── AttributeProvider
//!                                  │ Resolution
//!                                  ▼
//!   CollectionMembership ──► reconcile (pure) ──► MembershipDelta
//!            ▲                                         │
//!            └──────── MembershipReconciler::apply ◄───┘
//!                                  │
//!                                  ▼
//!                         SyncHistory (SyncRunStore)
//! ```
//!
//! [`AccessTester`] runs the same resolver and planner for draft policies
//! and stops before anything is applied.
//!
//! ## Guarantees
//!
//! - Manual memberships are never removed.
//! - A membership attributed to several policies survives until none of
//!   them is satisfied.
//! - A user whose attributes could not be read is neither added nor removed.
//! - Passes for the same policy and collection never overlap, and each one
//!   reads the stored policy only after taking the pair's token.
//! - Report-only policies are never written for; they can only keep a
//!   membership from being removed.
//! - Attributions left in collections a policy no longer targets are
//!   withdrawn by its next sync pass.

pub mod error;
pub mod exclusivity;
pub mod history;
pub mod memory;
pub mod queue;
pub mod reconciler;
pub mod resolver;
pub mod runner;
pub mod service;
pub mod tester;
pub mod traits;

pub use error::{
    AttributeLookupError, MembershipMutationError, MembershipStoreError, MutationOp,
    PopulationError, QueueError, RepositoryError, Result, ServiceError, SyncError,
};
pub use exclusivity::{ExclusivityArena, PairGuard};
pub use history::{
    PairReport, SyncHistory, SyncItemError, SyncRun, SyncRunId, SyncStatus, SyncTrigger,
};
pub use queue::{SyncQueue, SyncWorker, sync_queue};
pub use reconciler::{
    ApplyOutcome, MembershipDelta, MembershipReconciler, MembershipSnapshot, Sibling, reconcile,
};
pub use resolver::{PolicySatisfactionResolver, Resolution};
pub use runner::{Collaborators, SyncRunner};
pub use service::{PolicyService, SavedPolicy};
pub use tester::{AccessPreview, AccessReport, AccessTester, Page};
pub use traits::{
    AttributeProvider, CollectionMembership, PolicyRepository, PopulationSource, SyncRunStore,
};
