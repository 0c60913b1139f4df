//! The update cycle state machine.
//!
//! [`Orchestrator`] is the only component that branches on outcomes. Every
//! collaborator it drives is a single-purpose capability:
//!
//! ```text
//! trigger ─► probe ─► is_behind ─► preflight ─► stop ─► pull ─► hooks/migrations
//!                                                        │
//!                        start ◄─ install ◄─ fetch ◄─ declared != installed
//! ```
//!
//! Once `stop()` has been requested, `start()` is attempted exactly once on
//! every path except a failed stop and an unconfigured restart after a pull
//! conflict. A cycle is journaled from the moment it decides to update; a
//! cycle the journal still lists as running at startup is recovered by
//! [`Orchestrator::recover`].

mod cycle;
pub mod journal;
pub mod record;


use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::assets::{AssetVersion, AssetVersionComparator};
use crate::config::{Config, WarnLevel};
use crate::error::{Result, UpkeepError};
use crate::fetch::{AssetFetcher, RoutingStore};
use crate::hooks::{HookOutcome, HookRunner};
use crate::install::AtomicAssetInstaller;
use crate::migrations::{MigrationPlan, MigrationReport};
use crate::network::ConnectivityProbe;
use crate::paths;
use crate::service::{supervisor_from_config, ServiceLifecycleController, ServiceState, Timeouts};
use crate::vcs::{GitCli, VersionMarker, VersionOracle};

pub use journal::CycleJournal;
pub use record::{CyclePhase, CycleRecord, CycleStatus, Trigger};

// ---------------------------------------------------------------------------
// CycleReport
// ---------------------------------------------------------------------------

/// Why a cycle ended without touching anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoOpReason {
    UpToDate,
    Offline,
    Cancelled,
}

/// Step a failure was recorded at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Check,
    Preflight,
    Stop,
    Pull,
    Assets,
    Start,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Preflight => "preflight",
            Self::Stop => "stop",
            Self::Pull => "pull",
            Self::Assets => "assets",
            Self::Start => "start",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleFailure {
    pub stage: FailureStage,
    pub message: String,
}

/// Everything a caller needs to know about one finished cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub id: Uuid,
    pub trigger: Trigger,
    /// `Idle` or `Failed`.
    pub phase: CyclePhase,
    pub noop: Option<NoOpReason>,
    pub from: Option<VersionMarker>,
    pub to: Option<VersionMarker>,
    pub declared_assets: Option<AssetVersion>,
    pub assets_installed: bool,
    pub failures: Vec<CycleFailure>,
    /// Whether a stop request was issued.
    pub service_touched: bool,
    /// Service state observed at the end of a cycle that touched it.
    pub service: Option<ServiceState>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrations: Option<MigrationReport>,
}

impl CycleReport {
    fn new(id: Uuid, trigger: Trigger) -> Self {
        Self {
            id,
            trigger,
            phase: CyclePhase::Checking,
            noop: None,
            from: None,
            to: None,
            declared_assets: None,
            assets_installed: false,
            failures: Vec::new(),
            service_touched: false,
            service: None,
            hooks: Vec::new(),
            migrations: None,
        }
    }

    fn fail(&mut self, stage: FailureStage, err: &UpkeepError) {
        self.failures.push(CycleFailure {
            stage,
            message: err.to_string(),
        });
    }

    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    /// The source tree moved to a new revision during this cycle.
    pub fn updated(&self) -> bool {
        self.to.is_some()
    }

    pub fn failed_at(&self, stage: FailureStage) -> bool {
        self.failures.iter().any(|f| f.stage == stage)
    }

    /// `0` no-op or updated, `2` failed with the service up, `3` failed with
    /// the service down.
    pub fn exit_code(&self) -> i32 {
        if self.failures.is_empty() {
            0
        } else if self.service_touched && self.service != Some(ServiceState::Running) {
            3
        } else {
            2
        }
    }

    /// One-line summary for logs and the journal.
    pub fn summary(&self) -> String {
        if let Some(reason) = self.noop {
            return match reason {
                NoOpReason::UpToDate => "up to date".into(),
                NoOpReason::Offline => "offline".into(),
                NoOpReason::Cancelled => "cancelled".into(),
            };
        }
        let mut parts = Vec::new();
        match (&self.from, &self.to) {
            (Some(from), Some(to)) => parts.push(format!("{} -> {}", from.short(), to.short())),
            (None, Some(to)) => parts.push(format!("-> {}", to.short())),
            _ => {}
        }
        if self.assets_installed {
            if let Some(v) = &self.declared_assets {
                parts.push(format!("assets {v}"));
            }
        }
        for f in &self.failures {
            parts.push(format!("{}: {}", f.stage.as_str(), f.message));
        }
        if parts.is_empty() {
            "no changes".into()
        } else {
            parts.join("; ")
        }
    }
}

// ---------------------------------------------------------------------------
// CancelToken
// ---------------------------------------------------------------------------

/// Shared shutdown request. Honoured only before the service is stopped; a
/// cycle past that point always runs to its restart.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The asset half of a cycle, present only when assets are configured.
pub struct AssetPipeline {
    pub comparator: AssetVersionComparator,
    pub fetcher: AssetFetcher,
    pub installer: AtomicAssetInstaller,
    /// Locator template with a `{version}` placeholder.
    pub url_template: String,
}

pub struct Orchestrator {
    source_tree: PathBuf,
    oracle: VersionOracle,
    service: ServiceLifecycleController,
    assets: Option<AssetPipeline>,
    probe: Option<ConnectivityProbe>,
    hooks: Option<HookRunner>,
    migrations: Option<MigrationPlan>,
    journal_path: Option<PathBuf>,
    restart_after_pull_conflict: bool,
    cancel: CancelToken,
    busy: AtomicBool,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Orchestrator {
    pub fn new(
        source_tree: impl Into<PathBuf>,
        oracle: VersionOracle,
        service: ServiceLifecycleController,
    ) -> Self {
        Self {
            source_tree: source_tree.into(),
            oracle,
            service,
            assets: None,
            probe: None,
            hooks: None,
            migrations: None,
            journal_path: None,
            restart_after_pull_conflict: false,
            cancel: CancelToken::new(),
            busy: AtomicBool::new(false),
        }
    }

    pub fn with_assets(mut self, pipeline: AssetPipeline) -> Self {
        self.assets = Some(pipeline);
        self
    }

    pub fn with_probe(mut self, probe: ConnectivityProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_hooks(mut self, hooks: HookRunner) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_migrations(mut self, plan: MigrationPlan) -> Self {
        self.migrations = Some(plan);
        self
    }

    pub fn with_journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = Some(path.into());
        self
    }

    pub fn restart_after_pull_conflict(mut self, restart: bool) -> Self {
        self.restart_after_pull_conflict = restart;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Wire up the real adapters described by `cfg` for the tree at `root`.
    pub fn from_config(root: &Path, cfg: &Config) -> Result<Self> {
        if let Some(w) = cfg
            .validate(root)
            .into_iter()
            .find(|w| w.level == WarnLevel::Error)
        {
            return Err(UpkeepError::Config(w.message));
        }

        let vcs = GitCli::new(root, cfg.source.remote.clone(), cfg.source.branch.clone())?;
        let supervisor = supervisor_from_config(&cfg.service.supervisor)?;
        let service = ServiceLifecycleController::new(supervisor, Timeouts::from(&cfg.service));

        let mut orch = Self::new(root, VersionOracle::new(Box::new(vcs)), service)
            .with_journal(paths::journal_path(root))
            .restart_after_pull_conflict(cfg.source.restart_after_pull_conflict);

        if let Some(assets) = &cfg.assets {
            let store = RoutingStore::new(Duration::from_secs(assets.fetch_timeout_secs))?;
            orch = orch.with_assets(AssetPipeline {
                comparator: AssetVersionComparator::new(
                    assets.marker_file.clone(),
                    paths::installed_assets_path(root),
                ),
                fetcher: AssetFetcher::new(Box::new(store), paths::downloads_dir(root)),
                installer: AtomicAssetInstaller::new(paths::resolve(root, &assets.live_dir)),
                url_template: assets.url_template.clone(),
            });
        }
        if let Some(network) = &cfg.network {
            orch = orch.with_probe(ConnectivityProbe::from(network));
        }
        if !cfg.hooks.post_pull.is_empty() {
            orch = orch.with_hooks(HookRunner::new(cfg.hooks.post_pull.clone(), root));
        }
        if let Some(db) = &cfg.database {
            orch = orch.with_migrations(MigrationPlan::new(
                paths::resolve(root, &db.path),
                paths::resolve(root, &db.migrations_dir),
            ));
        }
        Ok(orch)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn service(&self) -> &ServiceLifecycleController {
        &self.service
    }

    /// Run one cycle, or return `None` if a cycle is already active. Dropped
    /// triggers are not queued.
    pub fn trigger(&self, trigger: Trigger) -> Option<CycleReport> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(%trigger, "cycle already in progress; trigger dropped");
            return None;
        }
        let _guard = BusyGuard(&self.busy);
        Some(self.run_cycle(trigger))
    }

    /// Recover cycles the journal still lists as running after a crash: if
    /// such a cycle stopped the service and never restarted it, start it now.
    /// Returns the number of cycles recovered.
    pub fn recover(&self) -> Result<usize> {
        let Some(path) = &self.journal_path else {
            return Ok(0);
        };
        let journal = CycleJournal::open(path)?;
        let stuck = journal.in_progress()?;
        for record in &stuck {
            warn!(cycle = %record.id, phase = %record.phase, "recovering interrupted cycle");
            if record.left_service_down() {
                match self.service.start() {
                    Ok(()) => info!(cycle = %record.id, "service restarted after interrupted cycle"),
                    Err(e) => error!(
                        cycle = %record.id,
                        error = %e,
                        state = %self.service.status(),
                        "could not restart service after interrupted cycle"
                    ),
                }
            }
            journal.mark_interrupted(record.id)?;
        }
        Ok(stuck.len())
    }
}
