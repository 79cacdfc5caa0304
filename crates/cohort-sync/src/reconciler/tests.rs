use super::*;
use crate::memory::InMemoryMembership;
use cohort_types::{Origin, Revision};
use proptest::prelude::*;

const C: &str = "town-square";

fn uid(id: &str) -> UserId {
    UserId::from(id)
}

fn pid(id: &str) -> PolicyId {
    PolicyId::from(id)
}

fn set(ids: &[&str]) -> BTreeSet<UserId> {
    ids.iter().map(|id| uid(id)).collect()
}

fn resolution(policy: &str, satisfying: &[&str]) -> Resolution {
    let mut r = Resolution::empty(pid(policy), Revision::new(1));
    r.satisfying = set(satisfying);
    r.evaluated = satisfying.len();
    r
}

fn policy_row(user: &str, policies: &[&str]) -> MembershipRecord {
    let mut record = MembershipRecord::from_policy(C.into(), uid(user), pid(policies[0]));
    for p in &policies[1..] {
        record.policies.insert(pid(p));
    }
    record
}

fn manual_row(user: &str) -> MembershipRecord {
    MembershipRecord::manual(C.into(), uid(user))
}

fn snapshot(records: Vec<MembershipRecord>) -> MembershipSnapshot {
    MembershipSnapshot::new(C.into(), records)
}

// ============================================================================
// Planning
// ============================================================================

#[test]
fn test_adds_satisfying_non_members() {
    let snap = snapshot(vec![policy_row("alice", &["p1"])]);
    let delta = reconcile(&snap, &resolution("p1", &["alice", "bob"]), &[]);

    assert_eq!(delta.to_add, set(&["bob"]));
    assert!(delta.to_remove.is_empty());
    assert_eq!(delta.mutation_count(), 1);
}

#[test]
fn test_removes_members_that_stopped_satisfying() {
    let snap = snapshot(vec![policy_row("alice", &["p1"]), policy_row("bob", &["p1"])]);
    let delta = reconcile(&snap, &resolution("p1", &["bob"]), &[]);

    assert_eq!(delta.to_remove, set(&["alice"]));
    assert!(delta.to_add.is_empty());
}

#[test]
fn test_manual_rows_are_never_touched() {
    let snap = snapshot(vec![manual_row("alice"), manual_row("bob")]);
    let delta = reconcile(&snap, &resolution("p1", &["alice"]), &[]);

    assert!(delta.is_empty(), "{delta:?}");
}

#[test]
fn test_rows_of_other_policies_are_left_alone() {
    let snap = snapshot(vec![policy_row("alice", &["p2"])]);
    let delta = reconcile(&snap, &resolution("p1", &[]), &[]);

    assert!(delta.is_empty());
}

#[test]
fn test_satisfying_member_of_another_policy_is_attributed() {
    let snap = snapshot(vec![policy_row("alice", &["p2"])]);
    let delta = reconcile(&snap, &resolution("p1", &["alice"]), &[]);

    assert_eq!(delta.to_attribute, set(&["alice"]));
    assert!(delta.to_add.is_empty());
}

#[test]
fn test_shared_row_is_detached_not_removed() {
    let snap = snapshot(vec![policy_row("alice", &["p1", "p2"])]);
    let delta = reconcile(&snap, &resolution("p1", &[]), &[]);

    assert_eq!(delta.to_detach, set(&["alice"]));
    assert!(delta.to_remove.is_empty());
}

#[test]
fn test_sole_row_is_handed_to_lowest_satisfied_sibling() {
    let snap = snapshot(vec![policy_row("alice", &["p2"])]);
    let siblings = [
        Sibling::synced(resolution("p9", &["alice"])),
        Sibling::synced(resolution("p3", &["alice"])),
        Sibling::synced(resolution("p4", &[])),
    ];
    let delta = reconcile(&snap, &resolution("p2", &[]), &siblings);

    assert_eq!(delta.handoffs.get(&uid("alice")), Some(&pid("p3")));
    assert!(delta.to_remove.is_empty());
    assert_eq!(delta.mutation_count(), 2);
}

#[test]
fn test_failed_lookup_never_removes() {
    let snap = snapshot(vec![policy_row("alice", &["p1"]), policy_row("bob", &["p1", "p2"])]);
    let mut res = resolution("p1", &[]);
    res.failures
        .insert(uid("alice"), crate::AttributeLookupError::Unavailable("down".into()));
    res.failures
        .insert(uid("bob"), crate::AttributeLookupError::Unavailable("down".into()));

    let delta = reconcile(&snap, &res, &[]);

    assert!(delta.is_empty());
    assert_eq!(delta.undetermined, set(&["alice", "bob"]));
}

#[test]
fn test_failed_sibling_lookup_keeps_member() {
    let snap = snapshot(vec![policy_row("alice", &["p1"])]);
    let mut sibling = resolution("p2", &[]);
    sibling
        .failures
        .insert(uid("alice"), crate::AttributeLookupError::Timeout(Duration::from_secs(1)));

    let delta = reconcile(&snap, &resolution("p1", &[]), &[Sibling::synced(sibling)]);

    assert!(delta.to_remove.is_empty());
    assert_eq!(delta.undetermined, set(&["alice"]));
}

#[test]
fn test_own_resolution_in_sibling_list_is_ignored() {
    let snap = snapshot(vec![policy_row("alice", &["p1"])]);
    let own = Sibling::synced(resolution("p1", &["alice"]));
    let delta = reconcile(&snap, &resolution("p1", &[]), &[own]);

    assert_eq!(delta.to_remove, set(&["alice"]));
}

#[test]
fn test_report_only_sibling_keeps_row_without_taking_it() {
    let snap = snapshot(vec![policy_row("alice", &["p1"]), policy_row("bob", &["p1"])]);
    let siblings = [Sibling::report_only(resolution("p2", &["alice"]))];
    let delta = reconcile(&snap, &resolution("p1", &[]), &siblings);

    assert!(delta.handoffs.is_empty());
    assert_eq!(delta.retained, set(&["alice"]));
    assert_eq!(delta.to_remove, set(&["bob"]));
    assert_eq!(delta.mutation_count(), 1);
}

#[test]
fn test_synced_sibling_is_preferred_over_report_only() {
    let snap = snapshot(vec![policy_row("alice", &["p2"])]);
    let siblings = [
        Sibling::report_only(resolution("p1", &["alice"])),
        Sibling::synced(resolution("p3", &["alice"])),
    ];
    let delta = reconcile(&snap, &resolution("p2", &[]), &siblings);

    assert_eq!(delta.handoffs.get(&uid("alice")), Some(&pid("p3")));
    assert!(delta.retained.is_empty());
}

#[test]
fn test_snapshot_ignores_other_collections() {
    let mut foreign = policy_row("alice", &["p1"]);
    foreign.collection_id = "other".into();
    let snap = snapshot(vec![foreign]);

    assert!(snap.is_empty());
}

// ============================================================================
// Apply
// ============================================================================

fn reconciler(store: &Arc<InMemoryMembership>) -> MembershipReconciler {
    let config = SyncConfig {
        mutation_timeout_ms: 200,
        ..SyncConfig::default()
    };
    MembershipReconciler::new(Arc::clone(store) as Arc<dyn CollectionMembership>, &config)
}

fn synced_policy(id: &str, auto_sync: bool) -> Policy {
    Policy::from_expression(id, "Dept is set")
        .with_collection(C)
        .with_auto_sync(auto_sync)
}

#[tokio::test]
async fn test_apply_is_skipped_without_auto_sync() {
    let store = Arc::new(InMemoryMembership::new());
    let reconciler = reconciler(&store);
    let snap = reconciler.snapshot(&C.into()).await.expect("snapshot");
    let delta = reconcile(&snap, &resolution("p1", &["alice"]), &[]);

    let outcome = reconciler.apply(&synced_policy("p1", false), &delta).await;

    assert!(!outcome.applied);
    assert_eq!(delta.to_add, set(&["alice"]));
    assert!(store.members(&C.into()).is_empty());
    assert_eq!(store.mutation_count(), 0);
}

#[tokio::test]
async fn test_apply_records_origin_and_attribution() {
    let store = Arc::new(InMemoryMembership::new());
    store.add_manual(C, "carol");
    store.insert(policy_row("bob", &["p1"]));
    let reconciler = reconciler(&store);

    let snap = reconciler.snapshot(&C.into()).await.expect("snapshot");
    let delta = reconcile(&snap, &resolution("p1", &["alice", "carol"]), &[]);
    let outcome = reconciler.apply(&synced_policy("p1", true), &delta).await;

    assert!(outcome.applied);
    assert_eq!(outcome.added, 1);
    assert_eq!(outcome.removed, 1);

    let alice = store.record(&C.into(), &uid("alice")).expect("alice row");
    assert_eq!(alice.origin, Origin::Policy);
    assert!(alice.attributed_solely_to(&pid("p1")));
    assert!(store.record(&C.into(), &uid("bob")).is_none());
    assert!(store.record(&C.into(), &uid("carol")).expect("carol").is_manual());
}

#[tokio::test]
async fn test_mutation_failure_is_isolated_per_user() {
    let store = Arc::new(InMemoryMembership::new());
    store.fail_mutations_for("bob");
    let reconciler = reconciler(&store);

    let snap = reconciler.snapshot(&C.into()).await.expect("snapshot");
    let delta = reconcile(&snap, &resolution("p1", &["alice", "bob", "carol"]), &[]);
    let outcome = reconciler.apply(&synced_policy("p1", true), &delta).await;

    assert_eq!(outcome.added, 2);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].user_id(), Some(&uid("bob")));
    assert_eq!(store.members(&C.into()), set(&["alice", "carol"]));
}

#[tokio::test]
async fn test_handoff_keeps_membership() {
    let store = Arc::new(InMemoryMembership::new());
    store.insert(policy_row("alice", &["p1"]));
    let reconciler = reconciler(&store);

    let snap = reconciler.snapshot(&C.into()).await.expect("snapshot");
    let siblings = [Sibling::synced(resolution("p2", &["alice"]))];
    let delta = reconcile(&snap, &resolution("p1", &[]), &siblings);
    let outcome = reconciler.apply(&synced_policy("p1", true), &delta).await;

    assert_eq!(outcome.handed_off, 1);
    let row = store.record(&C.into(), &uid("alice")).expect("still a member");
    assert!(row.attributed_solely_to(&pid("p2")));
}

#[tokio::test]
async fn test_failed_handoff_leaves_row_untouched() {
    let store = Arc::new(InMemoryMembership::new());
    store.insert(policy_row("alice", &["p1"]));
    store.fail_mutations_for("alice");
    let reconciler = reconciler(&store);

    let snap = reconciler.snapshot(&C.into()).await.expect("snapshot");
    let siblings = [Sibling::synced(resolution("p2", &["alice"]))];
    let delta = reconcile(&snap, &resolution("p1", &[]), &siblings);
    let outcome = reconciler.execute(&delta).await;

    assert_eq!(outcome.handed_off, 0);
    assert_eq!(outcome.errors.len(), 1);
    let row = store.record(&C.into(), &uid("alice")).expect("still a member");
    assert!(row.attributed_solely_to(&pid("p1")));
}

// ============================================================================
// Properties
// ============================================================================

/// Applies a delta to a snapshot the way the membership store would.
fn apply_to_snapshot(snap: &MembershipSnapshot, delta: &MembershipDelta) -> MembershipSnapshot {
    let policy = &delta.policy_id;
    let mut records: BTreeMap<UserId, MembershipRecord> = snap
        .records()
        .map(|r| (r.user_id.clone(), r.clone()))
        .collect();

    for user in &delta.to_add {
        records.insert(
            user.clone(),
            MembershipRecord::from_policy(C.into(), user.clone(), policy.clone()),
        );
    }
    for user in &delta.to_attribute {
        if let Some(r) = records.get_mut(user) {
            r.policies.insert(policy.clone());
        }
    }
    for (user, heir) in &delta.handoffs {
        if let Some(r) = records.get_mut(user) {
            r.policies.insert(heir.clone());
            r.policies.remove(policy);
        }
    }
    for user in &delta.to_detach {
        if let Some(r) = records.get_mut(user) {
            r.policies.remove(policy);
        }
    }
    for user in &delta.to_remove {
        records.remove(user);
    }

    MembershipSnapshot::new(C.into(), records.into_values())
}

const USERS: [&str; 6] = ["u0", "u1", "u2", "u3", "u4", "u5"];
const POLICIES: [&str; 3] = ["p1", "p2", "p3"];

#[derive(Debug, Clone)]
enum Row {
    None,
    Manual,
    Policy(Vec<usize>),
}

fn arb_row() -> impl Strategy<Value = Row> {
    prop_oneof![
        Just(Row::None),
        Just(Row::Manual),
        prop::collection::btree_set(0..POLICIES.len(), 1..=3)
            .prop_map(|s| Row::Policy(s.into_iter().collect())),
    ]
}

fn build_snapshot(rows: &[Row]) -> MembershipSnapshot {
    let records = rows.iter().zip(USERS).filter_map(|(row, user)| match row {
        Row::None => None,
        Row::Manual => Some(manual_row(user)),
        Row::Policy(ps) => {
            let names: Vec<&str> = ps.iter().map(|i| POLICIES[*i]).collect();
            Some(policy_row(user, &names))
        }
    });
    snapshot(records.collect())
}

fn build_resolution(policy: &str, mask: &[bool]) -> Resolution {
    let satisfying: Vec<&str> = USERS
        .iter()
        .zip(mask)
        .filter(|(_, yes)| **yes)
        .map(|(u, _)| *u)
        .collect();
    resolution(policy, &satisfying)
}

fn arb_mask() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), USERS.len())
}

proptest! {
    #[test]
    fn manual_members_are_never_planned(
        rows in prop::collection::vec(arb_row(), USERS.len()),
        own in arb_mask(),
        sibling in arb_mask(),
    ) {
        let snap = build_snapshot(&rows);
        let siblings = [Sibling::synced(build_resolution("p2", &sibling))];
        let delta = reconcile(&snap, &build_resolution("p1", &own), &siblings);

        for record in snap.records().filter(|r| r.is_manual()) {
            let user = &record.user_id;
            prop_assert!(!delta.to_add.contains(user));
            prop_assert!(!delta.to_attribute.contains(user));
            prop_assert!(!delta.to_remove.contains(user));
            prop_assert!(!delta.to_detach.contains(user));
            prop_assert!(!delta.handoffs.contains_key(user));
        }
    }

    #[test]
    fn applying_a_delta_twice_changes_nothing(
        rows in prop::collection::vec(arb_row(), USERS.len()),
        own in arb_mask(),
        sibling in arb_mask(),
    ) {
        let snap = build_snapshot(&rows);
        let own = build_resolution("p1", &own);
        let siblings = [Sibling::synced(build_resolution("p2", &sibling))];

        let first = reconcile(&snap, &own, &siblings);
        let after = apply_to_snapshot(&snap, &first);
        let second = reconcile(&after, &own, &siblings);

        prop_assert!(second.is_empty(), "second pass planned {:?}", second);
    }

    #[test]
    fn relaxing_a_policy_only_adds(
        strict in arb_mask(),
        extra in arb_mask(),
        manual in arb_mask(),
    ) {
        // The relaxed policy satisfies everyone the strict one did, and more.
        let relaxed: Vec<bool> = strict.iter().zip(&extra).map(|(a, b)| *a || *b).collect();

        let rows: Vec<Row> = strict
            .iter()
            .zip(&manual)
            .map(|(member, manual)| match (*member, *manual) {
                (_, true) => Row::Manual,
                (true, false) => Row::Policy(vec![0]),
                (false, false) => Row::None,
            })
            .collect();
        let snap = build_snapshot(&rows);

        let delta = reconcile(&snap, &build_resolution("p1", &relaxed), &[]);

        prop_assert!(delta.to_remove.is_empty());
        prop_assert!(delta.to_detach.is_empty());
        prop_assert!(delta.handoffs.is_empty());
    }
}
