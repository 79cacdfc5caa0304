//! Policy satisfaction: which users of a population match a compiled policy.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use cohort_abac::CompiledPolicy;
use cohort_config::SyncConfig;
use cohort_types::{PolicyId, Revision, UserId};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::AttributeLookupError;
use crate::traits::AttributeProvider;

// ============================================================================
// Resolution
// ============================================================================

/// Outcome of resolving one policy revision against a population.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub policy_id: PolicyId,
    pub revision: Revision,
    /// Users whose attributes satisfy the policy.
    pub satisfying: BTreeSet<UserId>,
    /// Users whose attributes could not be read this pass.
    #[serde(serialize_with = "serialize_failures")]
    pub failures: BTreeMap<UserId, AttributeLookupError>,
    /// Distinct users considered.
    pub evaluated: usize,
}

impl Resolution {
    /// A resolution in which nobody satisfies the policy.
    pub fn empty(policy_id: PolicyId, revision: Revision) -> Self {
        Self {
            policy_id,
            revision,
            satisfying: BTreeSet::new(),
            failures: BTreeMap::new(),
            evaluated: 0,
        }
    }

    pub fn is_satisfied_by(&self, user_id: &UserId) -> bool {
        self.satisfying.contains(user_id)
    }

    /// `true` if the user's lookup failed, so neither membership nor
    /// non-membership is known.
    pub fn is_undetermined(&self, user_id: &UserId) -> bool {
        self.failures.contains_key(user_id)
    }

    /// Number of users skipped because of lookup failures.
    pub fn skipped(&self) -> usize {
        self.failures.len()
    }
}

fn serialize_failures<S>(
    failures: &BTreeMap<UserId, AttributeLookupError>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_map(failures.iter().map(|(user, err)| (user, err.to_string())))
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolves compiled policies against user populations.
///
/// Lookups for one resolution run concurrently, bounded by
/// `lookup_concurrency`; each lookup is bounded by `provider_timeout`.
/// Nothing is cached between calls, so a new revision is always evaluated
/// against fresh attributes.
#[derive(Clone)]
pub struct PolicySatisfactionResolver {
    provider: Arc<dyn AttributeProvider>,
    lookup_concurrency: usize,
    provider_timeout: Duration,
}

impl PolicySatisfactionResolver {
    pub fn new(provider: Arc<dyn AttributeProvider>, config: &SyncConfig) -> Self {
        Self {
            provider,
            lookup_concurrency: config.lookup_concurrency.max(1),
            provider_timeout: config.provider_timeout(),
        }
    }

    /// Returns the subset of `population` that satisfies `policy`.
    ///
    /// Duplicate ids are considered once. A failed or timed-out lookup
    /// excludes that user and is recorded in [`Resolution::failures`]; it
    /// never aborts the rest of the population.
    pub async fn resolve(&self, policy: &CompiledPolicy, population: &[UserId]) -> Resolution {
        let candidates: BTreeSet<UserId> = population.iter().cloned().collect();
        let mut resolution = Resolution::empty(policy.policy_id.clone(), policy.revision);
        resolution.evaluated = candidates.len();

        let mut join_set = JoinSet::new();
        let mut outcomes: BTreeMap<UserId, Result<bool, AttributeLookupError>> = BTreeMap::new();

        for user_id in &candidates {
            let provider = Arc::clone(&self.provider);
            let policy = policy.clone();
            let user_id = user_id.clone();
            let timeout = self.provider_timeout;

            join_set.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, provider.attributes(&user_id)).await
                {
                    Ok(Ok(attributes)) => Ok(policy.is_satisfied_by(&attributes)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(AttributeLookupError::Timeout(timeout)),
                };
                (user_id, outcome)
            });

            // Limit concurrency
            if join_set.len() >= self.lookup_concurrency {
                if let Some(joined) = join_set.join_next().await {
                    record(&mut outcomes, joined);
                }
            }
        }

        while let Some(joined) = join_set.join_next().await {
            record(&mut outcomes, joined);
        }

        for user_id in candidates {
            match outcomes.remove(&user_id) {
                Some(Ok(true)) => {
                    resolution.satisfying.insert(user_id);
                }
                Some(Ok(false)) => {}
                Some(Err(e)) => {
                    warn!(
                        policy_id = %policy.policy_id,
                        user_id = %user_id,
                        error = %e,
                        "Attribute lookup failed, user skipped"
                    );
                    resolution.failures.insert(user_id, e);
                }
                // The lookup task panicked; its user cannot be judged.
                None => {
                    warn!(
                        policy_id = %policy.policy_id,
                        user_id = %user_id,
                        "Attribute lookup task aborted, user skipped"
                    );
                    resolution.failures.insert(
                        user_id,
                        AttributeLookupError::Unavailable("lookup task aborted".to_string()),
                    );
                }
            }
        }

        debug!(
            policy_id = %resolution.policy_id,
            revision = %resolution.revision,
            evaluated = resolution.evaluated,
            satisfying = resolution.satisfying.len(),
            skipped = resolution.skipped(),
            "Resolved policy"
        );

        resolution
    }
}

type LookupOutcome = (UserId, Result<bool, AttributeLookupError>);

fn record(
    outcomes: &mut BTreeMap<UserId, Result<bool, AttributeLookupError>>,
    joined: Result<LookupOutcome, tokio::task::JoinError>,
) {
    match joined {
        Ok((user_id, outcome)) => {
            outcomes.insert(user_id, outcome);
        }
        Err(e) => warn!(error = %e, "Attribute lookup task failed"),
    }
}

// ============================================================================
// Tests
// ============================================================================
