//! Sync command - run one pass over a fixture and show the run record.

use std::path::Path;

use anyhow::{Context, Result, bail};
use cohort_sync::{SyncItemError, SyncRun, SyncStatus, SyncTrigger};
use cohort_types::PolicyId;

use super::{block_on, load_config};
use crate::fixture::{Fixture, World};
use crate::style::colors::SemanticStyle;
use crate::style::{
    print_data_table, print_error, print_heading, print_info_table, print_spacer, print_success,
    print_warn,
};

pub fn run(
    project: &Path,
    fixture: &Path,
    policy: Option<&str>,
    sweep: Option<&str>,
    json: bool,
) -> Result<()> {
    let config = load_config(project)?;
    let world = Fixture::load(fixture)?.into_world(&config);

    let trigger = match (policy, sweep) {
        (_, Some(id)) => SyncTrigger::OrphanSweep(PolicyId::from(id)),
        (Some(id), None) => SyncTrigger::PolicySaved(PolicyId::from(id)),
        (None, None) => SyncTrigger::Manual,
    };

    let run = block_on(world.runner.run_sync(trigger))?.context("Failed to record sync run")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
        print_spacer();
        print_membership(&world);
    }

    if run.status == SyncStatus::Failed {
        bail!("Sync run {} failed", run.id);
    }
    Ok(())
}

fn print_run(run: &SyncRun) {
    let status = match run.status {
        SyncStatus::Succeeded => run.status.to_string().success(),
        SyncStatus::PartiallyFailed => run.status.to_string().warning(),
        SyncStatus::Failed | SyncStatus::Running => run.status.to_string().error(),
    };
    let finished = run
        .finished_at
        .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());

    print_heading(&format!("Sync {}", run.id));
    print_info_table(&[
        ("Trigger", run.trigger.to_string()),
        ("Status", status),
        ("Started", run.started_at.to_rfc3339()),
        ("Finished", finished),
        ("Added", run.total_added().to_string()),
        ("Removed", run.total_removed().to_string()),
        ("Skipped users", run.skipped_users().to_string()),
    ]);

    let rows: Vec<Vec<String>> = run
        .pairs
        .iter()
        .map(|p| {
            vec![
                p.policy_id.to_string(),
                p.revision.to_string(),
                p.collection_id.to_string(),
                p.satisfying.to_string(),
                p.added.to_string(),
                p.attributed.to_string(),
                (p.removed + p.detached).to_string(),
                p.handed_off.to_string(),
                p.skipped_users.to_string(),
            ]
        })
        .collect();
    print_data_table(
        &[
            "Policy", "Rev", "Collection", "Satisfying", "Added", "Attributed", "Withdrawn",
            "Handed off", "Skipped",
        ],
        &rows,
        "pair",
    );

    match run.status {
        SyncStatus::Succeeded => print_success("All pairs reconciled"),
        _ => {
            for error in &run.errors {
                print_warn(&describe(error));
            }
            if run.errors.is_empty() {
                print_warn("Some users were skipped; their memberships were left unchanged");
            }
            if run.status == SyncStatus::Failed {
                print_error("No pair could be reconciled");
            }
        }
    }
}

fn print_membership(world: &World) {
    print_heading("Membership");
    let mut rows = Vec::new();
    for collection_id in &world.collections {
        for record in world.membership.records(collection_id) {
            let policies: Vec<String> = record.policies.iter().map(ToString::to_string).collect();
            rows.push(vec![
                collection_id.to_string(),
                record.user_id.to_string(),
                record.origin.to_string(),
                policies.join(", "),
            ]);
        }
    }
    print_data_table(&["Collection", "User", "Origin", "Policies"], &rows, "membership");
}

fn describe(error: &SyncItemError) -> String {
    let scope: Vec<String> = [
        error.policy_id.as_ref().map(|p| format!("policy {p}")),
        error.collection_id.as_ref().map(|c| format!("collection {c}")),
        error.user_id.as_ref().map(|u| format!("user {u}")),
    ]
    .into_iter()
    .flatten()
    .collect();

    if scope.is_empty() {
        error.message.clone()
    } else {
        format!("[{}] {}", scope.join(", "), error.message)
    }
}
