//! Test-access command - dry-run a draft or stored policy against a fixture.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use cohort_abac::Policy;
use cohort_sync::{AccessReport, MembershipDelta};
use cohort_types::{CollectionId, PolicyId, UserId};

use super::{block_on, load_config};
use crate::fixture::Fixture;
use crate::style::colors::SemanticStyle;
use crate::style::{
    print_data_table, print_heading, print_hint, print_labeled, print_spacer, print_warn,
};

pub struct Args {
    pub fixture: PathBuf,
    pub expr: Option<String>,
    pub policy: Option<String>,
    pub collection: Option<String>,
    pub after: Option<String>,
    pub limit: usize,
    pub json: bool,
}

pub fn run(project: &Path, args: &Args) -> Result<()> {
    let config = load_config(project)?;
    let fixture = Fixture::load(&args.fixture)?;

    let draft = match (&args.expr, &args.policy) {
        (Some(expr), _) => Policy::from_expression("draft", expr.as_str()),
        (None, Some(id)) => fixture
            .policy(&PolicyId::from(id.as_str()))
            .cloned()
            .ok_or_else(|| anyhow!("Policy '{id}' is not in the fixture"))?,
        (None, None) => return Err(anyhow!("Either --expr or --policy is required")),
    };

    let world = fixture.into_world(&config);
    let tester = world.tester();

    let (report, delta) = match &args.collection {
        Some(collection) => {
            let collection_id = CollectionId::from(collection.as_str());
            let preview = block_on(tester.preview(&draft, &collection_id))?
                .with_context(|| format!("Failed to preview {collection_id}"))?;
            (preview.report, Some(preview.delta))
        }
        None => {
            let report = block_on(tester.test_access(&draft, &world.users))?
                .context("Policy does not compile")?;
            (report, None)
        }
    };

    if args.json {
        let value = serde_json::json!({ "report": report, "delta": delta });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    print_report(&report, args.after.as_deref(), args.limit);
    if let Some(delta) = &delta {
        print_spacer();
        print_delta(delta);
    }
    Ok(())
}

fn print_report(report: &AccessReport, after: Option<&str>, limit: usize) {
    print_heading(&format!("Access test for {}", report.policy_id));
    print_labeled("Evaluated", &report.evaluated.to_string());
    print_labeled("Satisfying", &report.satisfying.len().to_string().success());
    if !report.is_complete() {
        print_labeled("Skipped", &report.skipped.len().to_string().warning());
    }
    print_spacer();

    let cursor = after.map(UserId::from);
    let page = report.page(cursor.as_ref(), limit);
    let rows: Vec<Vec<String>> = page.users.iter().map(|u| vec![u.to_string()]).collect();
    print_data_table(&["User"], &rows, "user");
    if let Some(next) = &page.next {
        print_hint(&format!("More users follow; continue with --after {next}"));
    }

    for (user, reason) in &report.skipped {
        print_warn(&format!("{user} skipped: {reason}"));
    }
}

fn print_delta(delta: &MembershipDelta) {
    print_heading(&format!("Planned changes to {}", delta.collection_id));

    let mut rows: Vec<Vec<String>> = Vec::new();
    for (users, action) in [
        (&delta.to_add, "add"),
        (&delta.to_attribute, "attribute"),
        (&delta.to_detach, "detach"),
        (&delta.to_remove, "remove"),
    ] {
        rows.extend(users.iter().map(|u| vec![u.to_string(), action.to_string()]));
    }
    for (user, heir) in &delta.handoffs {
        rows.push(vec![user.to_string(), format!("hand off to {heir}")]);
    }
    for user in &delta.retained {
        rows.push(vec![user.to_string(), "kept (report-only policy matches)".muted()]);
    }
    for user in &delta.undetermined {
        rows.push(vec![user.to_string(), "unchanged (lookup failed)".muted()]);
    }

    print_data_table(&["User", "Action"], &rows, "change");
    print_hint("Nothing was applied; save the policy with auto-sync to apply.");
}
