use crate::output::{local_time, or_dash, print_json, print_table};
use anyhow::Context;
use std::path::Path;
use upkeep_core::{
    orchestrator::{CycleJournal, CycleRecord, CycleStatus},
    paths,
};

pub fn run(root: &Path, limit: usize, json: bool) -> anyhow::Result<()> {
    let path = paths::journal_path(root);
    let records: Vec<CycleRecord> = if path.exists() {
        CycleJournal::open(&path)
            .and_then(|j| j.list_recent(limit))
            .context("failed to read cycle journal (is a cycle running?)")?
    } else {
        Vec::new()
    };

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No update cycles recorded.");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            let detail = match &r.status {
                CycleStatus::Completed { outcome } => outcome.clone(),
                CycleStatus::Failed { reason } => reason.clone(),
                CycleStatus::Running | CycleStatus::Interrupted => format!("at {}", r.phase),
            };
            vec![
                r.id.simple().to_string()[..8].to_string(),
                local_time(r.created_at),
                r.trigger.to_string(),
                r.status.label().to_string(),
                format!(
                    "{} -> {}",
                    or_dash(r.from.as_ref().map(|m| m.short())),
                    or_dash(r.to.as_ref().map(|m| m.short()))
                ),
                detail,
            ]
        })
        .collect();
    print_table(&["ID", "STARTED", "TRIGGER", "STATUS", "REVISION", "DETAIL"], &rows);
    Ok(())
}
