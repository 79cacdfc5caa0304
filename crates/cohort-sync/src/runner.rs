//! Sync runner: drives resolution and reconciliation in bulk.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cohort_abac::{CompiledPolicy, Policy};
use cohort_config::CohortConfig;
use cohort_types::{CollectionId, PolicyId, Revision, UserId};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::exclusivity::ExclusivityArena;
use crate::history::{PairReport, SyncHistory, SyncItemError, SyncRun, SyncTrigger};
use crate::reconciler::{self, MembershipReconciler, MembershipSnapshot, Sibling};
use crate::resolver::{PolicySatisfactionResolver, Resolution};
use crate::traits::{AttributeProvider, CollectionMembership, PolicyRepository, PopulationSource};

/// What a pair was planned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairKind {
    /// Reconcile an auto-synced policy. A collection it no longer targets
    /// has its attributions withdrawn instead.
    Sync,
    /// Withdraw an inactive policy's attributions.
    Sweep,
}

/// How a pair is processed, decided under its token from the stored policy.
enum PairMode {
    /// Resolve the compiled policy and apply its delta.
    Sync(CompiledPolicy),
    /// Treat nobody as satisfying and apply unconditionally.
    Withdraw,
}

/// One policy on one collection, with the other active policies that
/// govern the same collection.
struct PairJob {
    policy_id: PolicyId,
    /// Revision the run was planned from; the pass itself uses whatever is
    /// stored once it holds the token.
    planned: Revision,
    kind: PairKind,
    collection_id: CollectionId,
    siblings: Vec<SiblingPolicy>,
}

/// A compiled sibling and whether the engine may write on its behalf.
#[derive(Clone)]
pub(crate) struct SiblingPolicy {
    compiled: CompiledPolicy,
    auto_sync: bool,
}

/// What one pair contributed to the run.
struct PairResult {
    report: Option<PairReport>,
    errors: Vec<SyncItemError>,
}

/// External stores the engine works against.
#[derive(Clone)]
pub struct Collaborators {
    pub repository: Arc<dyn PolicyRepository>,
    pub attributes: Arc<dyn AttributeProvider>,
    pub membership: Arc<dyn CollectionMembership>,
    pub population: Arc<dyn PopulationSource>,
}

/// Orchestrates sync runs.
///
/// Pairs run concurrently on a bounded worker pool. Each pair holds its
/// exclusivity token from snapshot to the last mutation, so the same pair is
/// never reconciled twice at once while unrelated pairs proceed freely.
#[derive(Clone)]
pub struct SyncRunner {
    repository: Arc<dyn PolicyRepository>,
    population: Arc<dyn PopulationSource>,
    resolver: PolicySatisfactionResolver,
    reconciler: MembershipReconciler,
    arena: Arc<ExclusivityArena>,
    history: Arc<SyncHistory>,
    max_concurrency: usize,
}

impl SyncRunner {
    pub fn new(collaborators: Collaborators, config: &CohortConfig) -> Self {
        Self {
            repository: collaborators.repository,
            population: collaborators.population,
            resolver: PolicySatisfactionResolver::new(collaborators.attributes, &config.sync),
            reconciler: MembershipReconciler::new(collaborators.membership, &config.sync),
            arena: Arc::new(ExclusivityArena::new()),
            history: Arc::new(SyncHistory::new(&config.history)),
            max_concurrency: config.sync.max_concurrency.max(1),
        }
    }

    /// Run history, also available through [`SyncRunStore`](crate::SyncRunStore).
    pub fn history(&self) -> &Arc<SyncHistory> {
        &self.history
    }

    pub fn resolver(&self) -> &PolicySatisfactionResolver {
        &self.resolver
    }

    pub fn reconciler(&self) -> &MembershipReconciler {
        &self.reconciler
    }

    pub fn population(&self) -> &Arc<dyn PopulationSource> {
        &self.population
    }

    pub fn repository(&self) -> &Arc<dyn PolicyRepository> {
        &self.repository
    }

    /// Runs one sync pass and returns its finalized record.
    ///
    /// Only history bookkeeping failures are returned as `Err`; everything
    /// else is recorded in the run and reflected in its status.
    pub async fn run_sync(&self, trigger: SyncTrigger) -> Result<SyncRun> {
        if let SyncTrigger::OrphanSweep(policy_id) = &trigger {
            return self.sweep_orphans(policy_id).await;
        }

        let mut run = self.history.begin(trigger.clone())?;

        let active = match self.repository.list_active().await {
            Ok(active) => active,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Listing active policies failed");
                run.record_error(None, None, &SyncError::from(e));
                return self.finish(run);
            }
        };

        let (compiled, broken) = compile_all(&active);
        let touched: Vec<&Policy> = active
            .iter()
            .filter(|p| p.auto_sync)
            .filter(|p| match &trigger {
                SyncTrigger::PolicySaved(id) => &p.id == id,
                _ => true,
            })
            .collect();

        // Policies outside this run's scope report their own errors.
        for (policy_id, error) in broken {
            if touched.iter().any(|p| p.id == policy_id) {
                run.record_error(Some(&policy_id), None, &error);
            }
        }

        if touched.is_empty() {
            debug!(run_id = %run.id, trigger = %trigger, "No auto-synced policy touched");
        }

        let mut jobs = Vec::new();
        for policy in touched.into_iter().filter(|p| compiled.contains_key(&p.id)) {
            let collections = match self.collections_of(policy).await {
                Ok(collections) => collections,
                Err(e) => {
                    warn!(policy_id = %policy.id, error = %e, "Listing attributed collections failed");
                    run.record_error(Some(&policy.id), None, &e);
                    policy.collections.clone()
                }
            };
            for collection_id in collections {
                jobs.push(PairJob {
                    policy_id: policy.id.clone(),
                    planned: policy.revision,
                    kind: PairKind::Sync,
                    siblings: siblings_of(&active, &compiled, &policy.id, &collection_id),
                    collection_id,
                });
            }
        }

        self.run_jobs(&mut run, jobs).await;
        self.finish(run)
    }

    /// Withdraws an inactive policy's attributions from every collection
    /// that still holds them, targeted or not.
    ///
    /// Members still satisfying another active, auto-synced policy on the
    /// collection are handed off to it; manual members are untouched.
    pub async fn sweep_orphans(&self, policy_id: &PolicyId) -> Result<SyncRun> {
        let mut run = self
            .history
            .begin(SyncTrigger::OrphanSweep(policy_id.clone()))?;

        let policy = match self.repository.get(policy_id).await {
            Ok(policy) => policy,
            Err(e) => {
                run.record_error(Some(policy_id), None, &SyncError::from(e));
                return self.finish(run);
            }
        };
        if policy.active {
            run.record_error(Some(policy_id), None, &SyncError::StillActive(policy_id.clone()));
            return self.finish(run);
        }

        let active = match self.repository.list_active().await {
            Ok(active) => active,
            Err(e) => {
                run.record_error(Some(policy_id), None, &SyncError::from(e));
                return self.finish(run);
            }
        };
        let (compiled, _) = compile_all(&active);

        let collections = match self.collections_of(&policy).await {
            Ok(collections) => collections,
            Err(e) => {
                run.record_error(Some(policy_id), None, &e);
                policy.collections.clone()
            }
        };
        let jobs = collections
            .into_iter()
            .map(|collection_id| PairJob {
                policy_id: policy_id.clone(),
                planned: policy.revision,
                kind: PairKind::Sweep,
                siblings: siblings_of(&active, &compiled, policy_id, &collection_id),
                collection_id,
            })
            .collect();

        self.run_jobs(&mut run, jobs).await;
        self.finish(run)
    }

    /// Targeted collections plus any that still hold rows attributed to
    /// the policy.
    async fn collections_of(&self, policy: &Policy) -> Result<BTreeSet<CollectionId>> {
        let mut collections = policy.collections.clone();
        collections.extend(self.reconciler.collections_attributed_to(&policy.id).await?);
        Ok(collections)
    }

    fn finish(&self, run: SyncRun) -> Result<SyncRun> {
        let run = self.history.finish(run)?;
        info!(
            run_id = %run.id,
            trigger = %run.trigger,
            status = %run.status,
            pairs = run.pairs.len(),
            added = run.total_added(),
            removed = run.total_removed(),
            skipped_users = run.skipped_users(),
            errors = run.errors.len(),
            "Sync run finished"
        );
        Ok(run)
    }

    async fn run_jobs(&self, run: &mut SyncRun, jobs: Vec<PairJob>) {
        let mut join_set = JoinSet::new();

        for job in jobs {
            let this = self.clone();
            join_set.spawn(async move { this.sync_pair(job).await });

            // Limit concurrency
            if join_set.len() >= self.max_concurrency {
                if let Some(joined) = join_set.join_next().await {
                    collect(run, joined);
                }
            }
        }

        while let Some(joined) = join_set.join_next().await {
            collect(run, joined);
        }

        run.pairs
            .sort_by(|a, b| (&a.policy_id, &a.collection_id).cmp(&(&b.policy_id, &b.collection_id)));
    }

    /// Snapshot, resolve, plan and apply for one pair, under its token.
    async fn sync_pair(&self, job: PairJob) -> PairResult {
        let policy_id = &job.policy_id;
        let collection_id = &job.collection_id;
        let mut result = PairResult {
            report: None,
            errors: Vec::new(),
        };
        let fail = |result: &mut PairResult, error: SyncError| {
            result
                .errors
                .push(SyncItemError::new(Some(policy_id), Some(collection_id), &error));
        };

        let _guard = match self.arena.acquire(policy_id, collection_id).await {
            Ok(guard) => guard,
            Err(e) => {
                fail(&mut result, e);
                return result;
            }
        };

        // Re-read under the token so a pass never applies a revision older
        // than the one a concurrent pass may already have applied.
        let policy = match self.repository.get(policy_id).await {
            Ok(policy) => policy,
            Err(e) => {
                fail(&mut result, e.into());
                return result;
            }
        };
        if policy.revision != job.planned {
            debug!(
                policy_id = %policy_id,
                collection_id = %collection_id,
                planned = %job.planned,
                current = %policy.revision,
                "Policy changed since the run was planned"
            );
        }

        let mode = match job.kind {
            PairKind::Sync if !policy.is_synced() => {
                debug!(
                    policy_id = %policy_id,
                    collection_id = %collection_id,
                    "Policy no longer auto-synced, pair skipped"
                );
                return result;
            }
            PairKind::Sync if policy.targets(collection_id) => match policy.compile() {
                Ok(compiled) => PairMode::Sync(compiled),
                Err(source) => {
                    fail(
                        &mut result,
                        SyncError::Compile {
                            policy_id: policy_id.clone(),
                            source,
                        },
                    );
                    return result;
                }
            },
            PairKind::Sync => PairMode::Withdraw,
            PairKind::Sweep if policy.active => {
                fail(&mut result, SyncError::StillActive(policy_id.clone()));
                return result;
            }
            PairKind::Sweep => PairMode::Withdraw,
        };

        let snapshot = match self.reconciler.snapshot(collection_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    policy_id = %policy_id,
                    collection_id = %collection_id,
                    error = %e,
                    "Membership snapshot failed"
                );
                fail(&mut result, e.into());
                return result;
            }
        };

        let resolution = match &mode {
            PairMode::Withdraw => Resolution::empty(policy_id.clone(), policy.revision),
            PairMode::Sync(compiled) => {
                let population = match self.population.eligible_users(collection_id).await {
                    Ok(population) => population,
                    Err(e) => {
                        warn!(
                            policy_id = %policy_id,
                            collection_id = %collection_id,
                            error = %e,
                            "Population lookup failed"
                        );
                        fail(&mut result, e.into());
                        return result;
                    }
                };
                let candidates = candidates(&population, &snapshot, policy_id);
                self.resolver.resolve(compiled, &candidates).await
            }
        };

        let siblings = self
            .resolve_siblings(&job.siblings, &snapshot, &resolution)
            .await;
        let delta = reconciler::reconcile(&snapshot, &resolution, &siblings);

        let outcome = match mode {
            PairMode::Withdraw => self.reconciler.execute(&delta).await,
            PairMode::Sync(_) => self.reconciler.apply(&policy, &delta).await,
        };

        for (user_id, error) in &resolution.failures {
            fail(
                &mut result,
                SyncError::Lookup {
                    user_id: user_id.clone(),
                    source: error.clone(),
                },
            );
        }
        for error in outcome.errors {
            fail(&mut result, error);
        }

        result.report = Some(PairReport {
            policy_id: policy_id.clone(),
            revision: resolution.revision,
            collection_id: collection_id.clone(),
            evaluated: resolution.evaluated,
            satisfying: resolution.satisfying.len(),
            added: outcome.added,
            attributed: outcome.attributed,
            removed: outcome.removed,
            detached: outcome.detached,
            handed_off: outcome.handed_off,
            skipped_users: resolution.skipped(),
        });
        result
    }

    /// Resolves siblings, but only for the users this pass might remove.
    pub(crate) async fn resolve_siblings(
        &self,
        siblings: &[SiblingPolicy],
        snapshot: &MembershipSnapshot,
        resolution: &Resolution,
    ) -> Vec<Sibling> {
        let at_risk: Vec<UserId> = snapshot
            .records()
            .filter(|r| r.attributed_solely_to(&resolution.policy_id))
            .filter(|r| {
                !resolution.is_satisfied_by(&r.user_id) && !resolution.is_undetermined(&r.user_id)
            })
            .map(|r| r.user_id.clone())
            .collect();

        if at_risk.is_empty() {
            return Vec::new();
        }

        let mut resolved = Vec::with_capacity(siblings.len());
        for sibling in siblings {
            let resolution = self.resolver.resolve(&sibling.compiled, &at_risk).await;
            resolved.push(Sibling {
                resolution,
                auto_sync: sibling.auto_sync,
            });
        }
        resolved
    }
}

/// Everyone who may end up in or out of the collection for this policy:
/// the eligible population plus current members attributed to the policy.
pub(crate) fn candidates(
    population: &[UserId],
    snapshot: &MembershipSnapshot,
    policy_id: &PolicyId,
) -> Vec<UserId> {
    let mut all: BTreeSet<UserId> = population.iter().cloned().collect();
    all.extend(snapshot.attributed_to(policy_id));
    all.into_iter().collect()
}

/// Compiles every policy, separating out the ones that fail.
pub(crate) fn compile_all(
    policies: &[Policy],
) -> (BTreeMap<PolicyId, CompiledPolicy>, Vec<(PolicyId, SyncError)>) {
    let mut compiled = BTreeMap::new();
    let mut broken = Vec::new();

    for policy in policies {
        match policy.compile() {
            Ok(c) => {
                compiled.insert(policy.id.clone(), c);
            }
            Err(source) => {
                warn!(policy_id = %policy.id, error = %source, "Stored policy does not compile");
                broken.push((
                    policy.id.clone(),
                    SyncError::Compile {
                        policy_id: policy.id.clone(),
                        source,
                    },
                ));
            }
        }
    }

    (compiled, broken)
}

/// Other active policies targeting `collection_id`.
pub(crate) fn siblings_of(
    active: &[Policy],
    compiled: &BTreeMap<PolicyId, CompiledPolicy>,
    policy_id: &PolicyId,
    collection_id: &CollectionId,
) -> Vec<SiblingPolicy> {
    active
        .iter()
        .filter(|p| p.active && &p.id != policy_id && p.targets(collection_id))
        .filter_map(|p| {
            compiled.get(&p.id).map(|c| SiblingPolicy {
                compiled: c.clone(),
                auto_sync: p.auto_sync,
            })
        })
        .collect()
}

fn collect(run: &mut SyncRun, joined: std::result::Result<PairResult, tokio::task::JoinError>) {
    match joined {
        Ok(result) => {
            run.pairs.extend(result.report);
            run.errors.extend(result.errors);
        }
        Err(e) => {
            warn!(run_id = %run.id, error = %e, "Sync task failed");
            run.record_error(None, None, &SyncError::Task(e.to_string()));
        }
    }
}
