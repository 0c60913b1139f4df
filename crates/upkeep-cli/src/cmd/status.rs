use crate::output::{local_time, or_dash, print_json};
use anyhow::Context;
use serde::Serialize;
use std::path::Path;
use tracing::warn;
use upkeep_core::{
    assets::AssetVersionComparator,
    config::Config,
    lock,
    orchestrator::{CycleJournal, CycleRecord},
    paths,
    service::{supervisor_from_config, ServiceLifecycleController, ServiceState, Timeouts},
};

#[derive(Serialize)]
struct StatusReport {
    service: String,
    state: Option<ServiceState>,
    installed_assets: Option<String>,
    /// Pid of the upkeep process holding the instance lock.
    lock_holder: Option<u32>,
    last_cycle: Option<CycleRecord>,
}

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;

    let (service, state) = match supervisor_from_config(&config.service.supervisor) {
        Ok(supervisor) => {
            let ctl = ServiceLifecycleController::new(supervisor, Timeouts::from(&config.service));
            (ctl.name(), Some(ctl.status()))
        }
        Err(e) => {
            warn!(error = %e, "cannot query service");
            ("-".to_string(), None)
        }
    };

    let installed_assets = match &config.assets {
        Some(a) => AssetVersionComparator::new(a.marker_file.clone(), paths::installed_assets_path(root))
            .last_installed_version()
            .context("failed to read installed asset record")?
            .map(|v| v.to_string()),
        None => None,
    };

    let lock_holder = lock::holder(&paths::lock_path(root));

    let last_cycle = last_cycle(root);

    let report = StatusReport {
        service,
        state,
        installed_assets,
        lock_holder,
        last_cycle,
    };

    if json {
        return print_json(&report);
    }

    println!("service:     {} ({})", report.service, or_dash(report.state));
    println!("assets:      {}", or_dash(report.installed_assets.as_deref()));
    match report.lock_holder {
        Some(pid) => println!("updater:     running (pid {pid})"),
        None => println!("updater:     idle"),
    }
    match &report.last_cycle {
        Some(c) => println!(
            "last cycle:  {} {} at {} ({})",
            c.status.label(),
            c.phase,
            local_time(c.updated_at),
            c.trigger
        ),
        None => println!("last cycle:  -"),
    }
    Ok(())
}

/// Newest journaled cycle. The journal is exclusively locked while a cycle
/// is being written, in which case nothing is reported.
fn last_cycle(root: &Path) -> Option<CycleRecord> {
    let path = paths::journal_path(root);
    if !path.exists() {
        return None;
    }
    match CycleJournal::open(&path).and_then(|j| j.list_recent(1)) {
        Ok(mut records) => records.pop(),
        Err(e) => {
            warn!(error = %e, "journal unavailable");
            None
        }
    }
}
