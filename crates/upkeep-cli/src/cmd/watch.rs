use crate::cmd::run::{print_report, recover};
use crate::signals;
use anyhow::{bail, Context};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use upkeep_core::{
    config::Config,
    lock::InstanceLock,
    orchestrator::{Orchestrator, Trigger},
    paths, UpkeepError,
};

pub fn run(root: &Path, interval_secs: Option<u64>, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let interval = interval_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.interval());
    if interval.is_zero() {
        bail!("watch interval must be greater than zero");
    }

    let _lock = match InstanceLock::acquire(&paths::lock_path(root)) {
        Ok(lock) => lock,
        Err(e @ UpkeepError::Locked(_)) => {
            bail!("{e}; not watching {}", root.display())
        }
        Err(e) => return Err(e).context("failed to acquire instance lock"),
    };

    // Built outside the runtime: the blocking HTTP client must not be created
    // or dropped on an async worker.
    let orch = Arc::new(Orchestrator::from_config(root, &config).context("failed to set up updater")?);
    recover(&orch);

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(watch(orch.clone(), interval, json));
    drop(rt);
    result
}

async fn watch(orch: Arc<Orchestrator>, interval: Duration, json: bool) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut hangup = signals::Listener::hangup()?;
    let mut interrupt = signals::Listener::interrupt()?;
    let mut terminate = signals::Listener::terminate()?;
    let mut cycles = JoinSet::new();

    info!(interval_secs = interval.as_secs(), "watching for updates");

    loop {
        let trigger = tokio::select! {
            _ = ticker.tick() => Trigger::Timer,
            _ = hangup.recv() => Trigger::Signal,
            _ = interrupt.recv() => break,
            _ = terminate.recv() => break,
            Some(joined) = cycles.join_next() => {
                if let Err(e) = joined {
                    error!(error = %e, "update cycle task failed");
                }
                continue;
            }
        };

        if orch.is_busy() {
            info!(%trigger, "cycle already in progress; trigger dropped");
            continue;
        }
        let orch = orch.clone();
        cycles.spawn_blocking(move || {
            if let Some(report) = orch.trigger(trigger) {
                if let Err(e) = print_report(&report, json) {
                    error!(error = %e, "failed to print cycle report");
                }
            }
        });
    }

    // A cycle that already stopped the service runs on to its restart.
    orch.cancel_token().cancel();
    if !cycles.is_empty() {
        info!("shutdown requested; waiting for the active cycle to finish");
    }
    while let Some(joined) = cycles.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "update cycle task failed");
        }
    }
    info!("stopped watching");
    Ok(())
}
