//! End-to-end scenarios over the in-memory stores.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cohort_abac::Policy;
use cohort_config::CohortConfig;
use cohort_sync::memory::{
    InMemoryAttributes, InMemoryMembership, InMemoryPolicies, InMemoryPopulation,
};
use cohort_sync::{
    AccessTester, Collaborators, CollectionMembership, MembershipMutationError,
    MembershipStoreError, PolicyRepository, PolicyService, RepositoryError, SyncRunStore,
    SyncRunner, SyncStatus, SyncTrigger, sync_queue,
};
use cohort_types::{
    AttributeSet, CollectionId, MembershipRecord, Origin, PolicyId, Revision, UserId,
};

struct Harness {
    attributes: Arc<InMemoryAttributes>,
    policies: Arc<InMemoryPolicies>,
    membership: Arc<InMemoryMembership>,
    population: Arc<InMemoryPopulation>,
    runner: SyncRunner,
}

impl Harness {
    fn new() -> Self {
        Self::build(
            |policies| policies as Arc<dyn PolicyRepository>,
            |membership| membership as Arc<dyn CollectionMembership>,
        )
    }

    /// Harness whose runner sees the in-memory stores through wrappers.
    fn build(
        repository: impl FnOnce(Arc<InMemoryPolicies>) -> Arc<dyn PolicyRepository>,
        store: impl FnOnce(Arc<InMemoryMembership>) -> Arc<dyn CollectionMembership>,
    ) -> Self {
        let attributes = Arc::new(InMemoryAttributes::new());
        let policies = Arc::new(InMemoryPolicies::new());
        let membership = Arc::new(InMemoryMembership::new());
        let population = Arc::new(InMemoryPopulation::new());

        let runner = SyncRunner::new(
            Collaborators {
                repository: repository(policies.clone()),
                attributes: attributes.clone(),
                membership: store(membership.clone()),
                population: population.clone(),
            },
            &CohortConfig::default(),
        );

        Self {
            attributes,
            policies,
            membership,
            population,
            runner,
        }
    }

    /// Channel `c` with Alice (Engineering, Berlin) and Bob (Sales, Remote).
    fn with_team() -> Self {
        Self::new().team()
    }

    fn team(self) -> Self {
        let h = self;
        h.user("alice", &[("Dept", "Engineering"), ("Office", "Berlin")]);
        h.user("bob", &[("Dept", "Sales"), ("Office", "Remote")]);
        h.population.set("c", ["alice", "bob"]);
        h
    }

    fn user(&self, id: &str, attrs: &[(&str, &str)]) {
        let set = attrs
            .iter()
            .fold(AttributeSet::new(), |set, (name, value)| set.with(*name, *value));
        self.attributes.set(id, set);
    }

    async fn save(&self, policy: Policy) {
        self.policies.save(policy).await.expect("save");
    }

    async fn sync(&self) -> cohort_sync::SyncRun {
        self.runner.run_sync(SyncTrigger::Manual).await.expect("history")
    }

    fn members(&self) -> BTreeSet<UserId> {
        self.membership.members(&CollectionId::from("c"))
    }

    fn record(&self, user: &str) -> Option<MembershipRecord> {
        self.membership.record(&"c".into(), &user.into())
    }
}

fn set(ids: &[&str]) -> BTreeSet<UserId> {
    ids.iter().map(|id| UserId::from(*id)).collect()
}

fn sales(auto_sync: bool) -> Policy {
    Policy::from_expression("sales", r#"Dept == "Sales""#)
        .with_collection("c")
        .with_auto_sync(auto_sync)
}

fn engineering(auto_sync: bool) -> Policy {
    Policy::from_expression("eng", r#"Dept == "Engineering""#)
        .with_collection("c")
        .with_auto_sync(auto_sync)
}

/// Repository whose first listing is served late, after later saves.
struct StaleFirstListing {
    inner: Arc<InMemoryPolicies>,
    delay: Duration,
    delayed: AtomicBool,
}

#[async_trait]
impl PolicyRepository for StaleFirstListing {
    async fn list_active(&self) -> Result<Vec<Policy>, RepositoryError> {
        let listed = self.inner.list_active().await;
        if !self.delayed.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        listed
    }

    async fn get(&self, policy_id: &PolicyId) -> Result<Policy, RepositoryError> {
        self.inner.get(policy_id).await
    }

    async fn save(&self, policy: Policy) -> Result<Revision, RepositoryError> {
        self.inner.save(policy).await
    }
}

/// Membership store with slow listings that counts overlapping snapshots.
struct SlowMembership {
    inner: Arc<InMemoryMembership>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowMembership {
    fn new(inner: Arc<InMemoryMembership>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CollectionMembership for SlowMembership {
    async fn list_members(
        &self,
        collection_id: &CollectionId,
    ) -> Result<Vec<MembershipRecord>, MembershipStoreError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let listed = self.inner.list_members(collection_id).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        listed
    }

    async fn collections_attributed_to(
        &self,
        policy_id: &PolicyId,
    ) -> Result<Vec<CollectionId>, MembershipStoreError> {
        self.inner.collections_attributed_to(policy_id).await
    }

    async fn add(
        &self,
        collection_id: &CollectionId,
        user_id: &UserId,
        policy_id: &PolicyId,
    ) -> Result<(), MembershipMutationError> {
        self.inner.add(collection_id, user_id, policy_id).await
    }

    async fn remove(
        &self,
        collection_id: &CollectionId,
        user_id: &UserId,
        policy_id: &PolicyId,
    ) -> Result<(), MembershipMutationError> {
        self.inner.remove(collection_id, user_id, policy_id).await
    }
}

// ============================================================================
// Auto-sync off and on
// ============================================================================

#[tokio::test]
async fn report_only_policy_previews_but_never_mutates() {
    let h = Harness::with_team();
    h.save(engineering(false)).await;

    let tester = AccessTester::new(h.runner.clone());
    let report = tester
        .test_access(&engineering(false), &[UserId::from("alice"), UserId::from("bob")])
        .await
        .expect("compiles");
    assert_eq!(report.satisfying, set(&["alice"]));

    let preview = tester
        .preview(&engineering(false), &"c".into())
        .await
        .expect("preview");
    assert_eq!(preview.delta.to_add, set(&["alice"]));

    let run = h.sync().await;
    assert_eq!(run.status, SyncStatus::Succeeded);
    assert!(run.pairs.is_empty());
    assert!(h.members().is_empty());
    assert_eq!(h.membership.mutation_count(), 0);
}

#[tokio::test]
async fn auto_sync_adds_satisfying_user_with_policy_origin() {
    let h = Harness::with_team();
    h.save(engineering(true)).await;

    let run = h.sync().await;

    assert_eq!(run.status, SyncStatus::Succeeded);
    assert_eq!(run.total_added(), 1);
    let record = h.record("alice").expect("alice is a member");
    assert_eq!(record.origin, Origin::Policy);
    assert!(record.is_attributed_to(&PolicyId::from("eng")));
    assert!(h.record("bob").is_none());
}

// ============================================================================
// Edits
// ============================================================================

#[tokio::test]
async fn retargeting_a_policy_swaps_members() {
    let h = Harness::with_team();
    h.save(engineering(true)).await;
    h.sync().await;

    h.save(
        Policy::from_expression("eng", r#"Dept == "Sales""#)
            .with_collection("c")
            .with_auto_sync(true),
    )
    .await;
    let run = h.sync().await;

    assert_eq!(h.members(), set(&["bob"]));
    assert_eq!(run.total_added(), 1);
    assert_eq!(run.total_removed(), 1);
}

#[tokio::test]
async fn narrowing_a_policy_removes_only_non_matching_members() {
    let h = Harness::with_team();
    h.user("carol", &[("Dept", "Engineering"), ("Office", "Remote")]);
    h.user("dave", &[("Dept", "Sales"), ("Office", "Remote")]);
    h.population.set("c", ["alice", "bob", "carol", "dave"]);

    // Alice joined under an earlier, broader rule; Carol is not in yet.
    h.membership
        .insert(MembershipRecord::from_policy("c".into(), "alice".into(), "eng".into()));
    h.save(
        Policy::from_expression("eng", r#"Dept == "Engineering" && Office == "Remote""#)
            .with_collection("c")
            .with_auto_sync(true),
    )
    .await;

    let run = h.sync().await;

    assert_eq!(h.members(), set(&["carol"]));
    assert_eq!(run.total_added(), 1);
    assert_eq!(run.total_removed(), 1);
}

#[tokio::test]
async fn relaxing_a_policy_only_adds() {
    let h = Harness::with_team();
    h.save(engineering(true)).await;
    h.sync().await;

    h.save(
        Policy::from_expression("eng", r#"Dept in ["Engineering", "Sales"]"#)
            .with_collection("c")
            .with_auto_sync(true),
    )
    .await;
    let run = h.sync().await;

    assert_eq!(run.total_removed(), 0);
    assert_eq!(run.total_added(), 1);
    assert_eq!(h.members(), set(&["alice", "bob"]));
}

#[tokio::test]
async fn second_run_without_changes_is_a_no_op() {
    let h = Harness::with_team();
    h.save(engineering(true)).await;

    let first = h.sync().await;
    let mutations = h.membership.mutation_count();
    let second = h.sync().await;

    assert!(first.mutations() > 0);
    assert_eq!(second.mutations(), 0);
    assert_eq!(h.membership.mutation_count(), mutations);
}

// ============================================================================
// Origins and multiple policies
// ============================================================================

#[tokio::test]
async fn manual_members_survive_any_policy() {
    let h = Harness::with_team();
    h.membership.add_manual("c", "bob");
    h.save(engineering(true)).await;

    h.sync().await;

    let bob = h.record("bob").expect("bob kept");
    assert_eq!(bob.origin, Origin::Manual);
    assert_eq!(h.members(), set(&["alice", "bob"]));
}

#[tokio::test]
async fn user_matching_either_policy_stays_a_member() {
    let h = Harness::with_team();
    h.save(engineering(true)).await;
    h.save(
        Policy::from_expression("berlin", r#"Office == "Berlin""#)
            .with_collection("c")
            .with_auto_sync(true),
    )
    .await;
    h.sync().await;
    assert!(h.record("alice").expect("member").is_attributed_to(&"berlin".into()));

    // Alice moves to Sales but stays in Berlin.
    h.user("alice", &[("Dept", "Sales"), ("Office", "Berlin")]);
    h.sync().await;
    let alice = h.record("alice").expect("still a member");
    assert!(alice.attributed_solely_to(&"berlin".into()));

    // Satisfying neither policy finally removes her.
    h.user("alice", &[("Dept", "Sales"), ("Office", "Remote")]);
    h.sync().await;
    assert!(h.record("alice").is_none());
}

#[tokio::test]
async fn report_only_sibling_never_inherits_a_membership() {
    let h = Harness::with_team();
    h.save(engineering(true)).await;
    h.save(sales(false)).await;
    h.sync().await;
    assert!(h.record("alice").expect("member").attributed_solely_to(&"eng".into()));

    // Satisfying only the report-only policy keeps the row where it is.
    h.user("alice", &[("Dept", "Sales"), ("Office", "Berlin")]);
    h.sync().await;
    let alice = h.record("alice").expect("kept");
    assert!(alice.attributed_solely_to(&"eng".into()));

    h.user("alice", &[("Dept", "Marketing"), ("Office", "Berlin")]);
    h.sync().await;
    assert!(h.record("alice").is_none());
    assert!(h.members().is_empty());
}

#[tokio::test]
async fn retargeted_policy_withdraws_from_its_old_collection() {
    let h = Harness::with_team();
    h.population.set("d", ["alice", "bob"]);
    h.membership.add_manual("c", "bob");
    h.save(engineering(true)).await;
    h.sync().await;
    assert_eq!(h.members(), set(&["alice", "bob"]));

    h.save(
        Policy::from_expression("eng", r#"Dept == "Engineering""#)
            .with_collection("d")
            .with_auto_sync(true),
    )
    .await;
    let run = h.sync().await;

    assert_eq!(run.status, SyncStatus::Succeeded);
    assert_eq!(run.pairs.len(), 2);
    assert_eq!(h.members(), set(&["bob"]));
    assert_eq!(h.membership.members(&"d".into()), set(&["alice"]));
}

#[tokio::test]
async fn retargeted_policy_hands_old_members_to_a_synced_sibling() {
    let h = Harness::with_team();
    h.population.set("d", ["alice"]);
    h.save(engineering(true)).await;
    h.sync().await;

    h.save(
        Policy::from_expression("berlin", r#"Office == "Berlin""#)
            .with_collection("c")
            .with_auto_sync(true),
    )
    .await;
    h.save(
        Policy::from_expression("eng", r#"Dept == "Engineering""#)
            .with_collection("d")
            .with_auto_sync(true),
    )
    .await;
    h.runner
        .run_sync(SyncTrigger::PolicySaved("eng".into()))
        .await
        .expect("history");

    let alice = h.record("alice").expect("still a member");
    assert!(alice.attributed_solely_to(&"berlin".into()));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn lookup_failure_skips_user_without_removing() {
    let h = Harness::with_team();
    h.save(engineering(true)).await;
    h.sync().await;

    h.attributes.fail_lookups_for("alice");
    let run = h.sync().await;

    assert_eq!(run.status, SyncStatus::PartiallyFailed);
    assert_eq!(run.skipped_users(), 1);
    assert_eq!(run.total_removed(), 0);
    assert_eq!(h.members(), set(&["alice"]));
}

#[tokio::test]
async fn broken_collection_does_not_stop_the_run() {
    let h = Harness::with_team();
    h.population.set("other", ["alice"]);
    h.save(engineering(true).with_collection("other")).await;
    h.membership.fail_listing_for("c");

    let run = h.sync().await;

    assert_eq!(run.status, SyncStatus::PartiallyFailed);
    assert_eq!(run.pairs.len(), 1);
    assert_eq!(h.membership.members(&"other".into()), set(&["alice"]));
}

#[tokio::test]
async fn broken_unrelated_policy_does_not_taint_a_save() {
    let h = Harness::with_team();
    h.policies.insert(
        Policy::from_expression("broken", "Dept ==")
            .with_collection("c")
            .with_auto_sync(true),
    );
    h.save(engineering(true)).await;

    let saved = h
        .runner
        .run_sync(SyncTrigger::PolicySaved("eng".into()))
        .await
        .expect("history");
    assert_eq!(saved.status, SyncStatus::Succeeded);
    assert!(saved.errors.is_empty());

    let full = h.sync().await;
    assert_eq!(full.status, SyncStatus::PartiallyFailed);
    assert_eq!(full.errors.len(), 1);
}

#[tokio::test]
async fn repository_outage_fails_the_run() {
    let h = Harness::with_team();
    h.policies.set_unavailable(true);

    let run = h.sync().await;

    assert_eq!(run.status, SyncStatus::Failed);
    assert_eq!(h.runner.history().latest().expect("history"), Some(run));
}

// ============================================================================
// Deactivation
// ============================================================================

#[tokio::test]
async fn deactivated_policy_keeps_members_until_swept() {
    let h = Harness::with_team();
    h.membership.add_manual("c", "bob");
    h.save(engineering(true)).await;
    h.sync().await;

    h.save(engineering(true).with_active(false)).await;
    h.sync().await;
    assert_eq!(h.members(), set(&["alice", "bob"]));

    let sweep = h
        .runner
        .run_sync(SyncTrigger::OrphanSweep("eng".into()))
        .await
        .expect("history");

    assert_eq!(sweep.status, SyncStatus::Succeeded);
    assert_eq!(sweep.total_removed(), 1);
    assert_eq!(h.members(), set(&["bob"]));
}

#[tokio::test]
async fn sweeping_an_active_policy_is_refused() {
    let h = Harness::with_team();
    h.save(engineering(true)).await;
    h.sync().await;

    let sweep = h.runner.sweep_orphans(&"eng".into()).await.expect("history");

    assert_eq!(sweep.status, SyncStatus::Failed);
    assert_eq!(h.members(), set(&["alice"]));
}

// ============================================================================
// Concurrent runs
// ============================================================================

#[tokio::test]
async fn run_planned_from_a_stale_revision_applies_the_stored_one() {
    let h = Harness::build(
        |policies| {
            Arc::new(StaleFirstListing {
                inner: policies,
                delay: Duration::from_millis(200),
                delayed: AtomicBool::new(false),
            }) as Arc<dyn PolicyRepository>
        },
        |membership| membership as Arc<dyn CollectionMembership>,
    )
    .team();
    h.save(engineering(true)).await;

    let runner = h.runner.clone();
    let stale = tokio::spawn(async move {
        runner.run_sync(SyncTrigger::PolicySaved("eng".into())).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.save(
        Policy::from_expression("eng", r#"Dept == "Sales""#)
            .with_collection("c")
            .with_auto_sync(true),
    )
    .await;
    let fresh = h
        .runner
        .run_sync(SyncTrigger::PolicySaved("eng".into()))
        .await
        .expect("history");
    let stale = stale.await.expect("join").expect("history");

    assert!(fresh.finished_at <= stale.finished_at);
    assert_eq!(stale.pairs[0].revision, Revision::new(2));
    assert_eq!(h.members(), set(&["bob"]));
    assert_eq!(h.membership.mutation_count(), 1);
}

#[tokio::test]
async fn passes_over_the_same_pair_never_overlap() {
    let mut tracked = None;
    let h = Harness::build(
        |policies| policies as Arc<dyn PolicyRepository>,
        |membership| {
            let slow = Arc::new(SlowMembership::new(membership, Duration::from_millis(100)));
            tracked = Some(Arc::clone(&slow));
            slow as Arc<dyn CollectionMembership>
        },
    )
    .team();
    let tracked = tracked.expect("wrapped");
    h.save(engineering(true)).await;

    let runner = h.runner.clone();
    let first = tokio::spawn(async move { runner.run_sync(SyncTrigger::Manual).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.save(
        Policy::from_expression("eng", r#"Dept == "Sales""#)
            .with_collection("c")
            .with_auto_sync(true),
    )
    .await;
    let second = h
        .runner
        .run_sync(SyncTrigger::PolicySaved("eng".into()))
        .await
        .expect("history");
    let first = first.await.expect("join").expect("history");

    assert_eq!(tracked.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(first.pairs[0].revision, Revision::new(1));
    assert_eq!(second.pairs[0].revision, Revision::new(2));
    assert_eq!(first.total_added(), 1);
    assert_eq!(second.total_removed(), 1);
    assert_eq!(h.members(), set(&["bob"]));
}

// ============================================================================
// Save to sync
// ============================================================================

#[tokio::test]
async fn saving_a_policy_schedules_its_sync() {
    let h = Harness::with_team();
    let (queue, worker) = sync_queue(16, h.runner.clone());
    let service = PolicyService::new(h.policies.clone(), queue);

    let saved = service.save(engineering(true)).await.expect("save");
    assert!(saved.sync_scheduled);

    drop(service);
    let runs = worker.run().await;

    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].trigger, SyncTrigger::PolicySaved("eng".into()));
    assert_eq!(h.members(), set(&["alice"]));
    assert_eq!(h.runner.history().list().expect("history").len(), 1);
}
