//! JSON fixtures: a self-contained world of users, policies and collections
//! loaded into the in-memory stores.
//!
//! ```json
//! {
//!   "users": { "alice": { "Dept": "Engineering", "Programs": ["A", "B"] } },
//!   "unreachable_users": ["mallory"],
//!   "policies": [
//!     { "id": "eng", "name": "Engineering", "definition": { "expression": "Dept == \"Engineering\"" },
//!       "collections": ["eng-chat"], "auto_sync": true }
//!   ],
//!   "collections": {
//!     "eng-chat": { "population": ["alice", "bob"], "members": [{ "user": "bob" }] }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use cohort_abac::Policy;
use cohort_config::CohortConfig;
use cohort_sync::memory::{
    InMemoryAttributes, InMemoryMembership, InMemoryPolicies, InMemoryPopulation,
};
use cohort_sync::{AccessTester, Collaborators, SyncRunner};
use cohort_types::{AttributeSet, CollectionId, MembershipRecord, Origin, PolicyId, UserId};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fixture {
    #[serde(default)]
    pub users: BTreeMap<UserId, AttributeSet>,
    /// Users whose attribute lookups fail.
    #[serde(default)]
    pub unreachable_users: BTreeSet<UserId>,
    #[serde(default)]
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub collections: BTreeMap<CollectionId, FixtureCollection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureCollection {
    /// Eligible users. Defaults to every user in the fixture.
    pub population: Option<Vec<UserId>>,
    #[serde(default)]
    pub members: Vec<FixtureMember>,
}

/// A current member. Without `policies` the membership is manual.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureMember {
    pub user: UserId,
    #[serde(default)]
    pub policies: BTreeSet<PolicyId>,
}

/// Engine wired to the fixture's stores.
pub struct World {
    pub runner: SyncRunner,
    pub membership: Arc<InMemoryMembership>,
    pub collections: Vec<CollectionId>,
    pub users: Vec<UserId>,
}

impl World {
    pub fn tester(&self) -> AccessTester {
        AccessTester::new(self.runner.clone())
    }
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid fixture {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn policy(&self, id: &PolicyId) -> Option<&Policy> {
        self.policies.iter().find(|p| &p.id == id)
    }

    pub fn into_world(self, config: &CohortConfig) -> World {
        let attributes = Arc::new(InMemoryAttributes::new());
        let policies = Arc::new(InMemoryPolicies::new());
        let membership = Arc::new(InMemoryMembership::new());
        let population = Arc::new(InMemoryPopulation::new());

        let users: Vec<UserId> = self.users.keys().cloned().collect();
        for (user_id, attrs) in self.users {
            attributes.set(user_id, attrs);
        }
        for user_id in self.unreachable_users {
            attributes.fail_lookups_for(user_id);
        }
        for policy in self.policies {
            policies.insert(policy);
        }

        let collections: Vec<CollectionId> = self.collections.keys().cloned().collect();
        for (collection_id, collection) in self.collections {
            let eligible = collection.population.unwrap_or_else(|| users.clone());
            population.set(collection_id.clone(), eligible);

            for member in collection.members {
                let record = if member.policies.is_empty() {
                    MembershipRecord::manual(collection_id.clone(), member.user)
                } else {
                    MembershipRecord {
                        user_id: member.user,
                        collection_id: collection_id.clone(),
                        origin: Origin::Policy,
                        policies: member.policies,
                    }
                };
                membership.insert(record);
            }
        }

        let runner = SyncRunner::new(
            Collaborators {
                repository: policies,
                attributes,
                membership: membership.clone(),
                population,
            },
            config,
        );

        World {
            runner,
            membership,
            collections,
            users,
        }
    }
}
