use crate::output::{or_dash, print_json};
use crate::signals;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;
use upkeep_core::{
    config::Config,
    lock::InstanceLock,
    orchestrator::{CycleReport, NoOpReason, Orchestrator, Trigger},
    paths, UpkeepError,
};

/// Run one manual cycle. Returns the process exit code.
pub fn run(root: &Path, json: bool) -> anyhow::Result<i32> {
    let config = Config::load(root).context("failed to load config")?;

    let _lock = match InstanceLock::acquire(&paths::lock_path(root)) {
        Ok(lock) => lock,
        Err(e @ UpkeepError::Locked(_)) => {
            eprintln!("{e}; trigger dropped");
            return Ok(0);
        }
        Err(e) => return Err(e).context("failed to acquire instance lock"),
    };

    // Built and dropped outside the runtime, like in `watch`.
    let orch = Arc::new(Orchestrator::from_config(root, &config).context("failed to set up updater")?);
    recover(&orch);

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(guarded_cycle(orch.clone()));
    drop(rt);

    let report = outcome?.context("a cycle is already in progress")?;
    print_report(&report, json)?;
    Ok(report.exit_code())
}

/// Run the cycle on the blocking pool with SIGINT/SIGTERM caught. A signal
/// cancels a cycle that has not stopped the service yet; past that point the
/// cycle runs through its restart and the process exits afterwards.
async fn guarded_cycle(orch: Arc<Orchestrator>) -> anyhow::Result<Option<CycleReport>> {
    let mut interrupt = signals::Listener::interrupt()?;
    let mut terminate = signals::Listener::terminate()?;
    let cycle = {
        let orch = orch.clone();
        tokio::task::spawn_blocking(move || orch.trigger(Trigger::Manual))
    };
    tokio::pin!(cycle);

    loop {
        tokio::select! {
            joined = &mut cycle => return joined.context("update cycle task failed"),
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        warn!("shutdown requested; finishing the active cycle first");
        orch.cancel_token().cancel();
    }
}

/// Finish cycles a crashed process left behind before starting a new one.
pub fn recover(orch: &Orchestrator) {
    match orch.recover() {
        Ok(0) => {}
        Ok(n) => warn!(recovered = n, "recovered interrupted cycles"),
        Err(e) => warn!(error = %e, "journal recovery failed"),
    }
}

pub fn print_report(report: &CycleReport, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(report);
    }
    match report.noop {
        Some(NoOpReason::UpToDate) => println!("Up to date."),
        Some(NoOpReason::Offline) => println!("Network unreachable; skipped."),
        Some(NoOpReason::Cancelled) => println!("Cancelled before any change."),
        None => {
            if let Some(to) = &report.to {
                println!(
                    "code:    {} -> {}",
                    or_dash(report.from.as_ref().map(|m| m.short())),
                    to.short()
                );
            }
            if let Some(declared) = &report.declared_assets {
                let note = if report.assets_installed {
                    "installed"
                } else {
                    "unchanged"
                };
                println!("assets:  {declared} ({note})");
            }
            for hook in &report.hooks {
                let mark = if hook.success { "ok" } else { "FAILED" };
                println!("hook:    {} {mark}", hook.name);
            }
            if let Some(m) = &report.migrations {
                println!(
                    "sql:     {} applied, {} failed",
                    m.applied.len(),
                    m.failed.len()
                );
            }
            if let Some(state) = report.service {
                println!("service: {state}");
            }
            for f in &report.failures {
                println!("failed:  [{}] {}", f.stage.as_str(), f.message);
            }
            if report.succeeded() {
                println!("\nUpdate complete.");
            }
        }
    }
    Ok(())
}
