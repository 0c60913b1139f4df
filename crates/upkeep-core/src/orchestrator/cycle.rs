use chrono::Utc;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::assets::{locator_for, AssetVersion, AssetVersionComparator};
use crate::error::UpkeepError;
use crate::service::ServiceState;

use super::journal::CycleJournal;
use super::record::{CyclePhase, CycleRecord, CycleStatus, Trigger};
use super::{CycleReport, FailureStage, NoOpReason, Orchestrator};

/// Finished cycles kept in the journal.
const JOURNAL_RETENTION: usize = 200;

/// Journal handle for one update attempt. Journal failures are logged and
/// never change the outcome of the cycle.
struct CycleLog {
    journal: Option<CycleJournal>,
    record: CycleRecord,
}

impl CycleLog {
    fn begin(orch: &Orchestrator, report: &CycleReport) -> Self {
        let journal = orch
            .journal_path
            .as_deref()
            .and_then(|path| match CycleJournal::open(path) {
                Ok(j) => Some(j),
                Err(e) => {
                    warn!(error = %e, "cycle journal unavailable; continuing without it");
                    None
                }
            });
        let mut record = CycleRecord::new(report.id, report.trigger);
        record.from = report.from.clone();
        let log = Self { journal, record };
        log.save();
        log
    }

    fn save(&self) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.put(&self.record) {
                warn!(error = %e, "failed to journal cycle");
            }
        }
    }

    fn advance(&mut self, phase: CyclePhase) {
        self.record.phase = phase;
        self.record.updated_at = Utc::now();
        self.save();
    }

    fn finish(mut self, report: &CycleReport) {
        self.record.phase = report.phase;
        self.record.to = report.to.clone();
        self.record.status = if report.succeeded() {
            CycleStatus::Completed {
                outcome: report.summary(),
            }
        } else {
            CycleStatus::Failed {
                reason: report.summary(),
            }
        };
        self.record.updated_at = Utc::now();
        self.save();
        if let Some(journal) = &self.journal {
            match journal.prune(JOURNAL_RETENTION) {
                Ok(0) => {}
                Ok(n) => debug!(pruned = n, "old cycles removed from journal"),
                Err(e) => warn!(error = %e, "failed to prune cycle journal"),
            }
        }
    }
}

impl Orchestrator {
    pub(super) fn run_cycle(&self, trigger: Trigger) -> CycleReport {
        let id = Uuid::new_v4();
        let short = id.simple().to_string()[..8].to_string();
        let span = info_span!("cycle", cycle = %short, %trigger);
        let _enter = span.enter();

        let mut report = CycleReport::new(id, trigger);
        debug!(phase = %CyclePhase::Checking, "cycle started");

        if let Some(probe) = &self.probe {
            if !probe.is_online() {
                info!("network unreachable; skipping update check");
                return noop(report, NoOpReason::Offline);
            }
        }

        match self.oracle.is_behind() {
            Ok(true) => {}
            Ok(false) => {
                debug!("source tree is up to date");
                return noop(report, NoOpReason::UpToDate);
            }
            Err(e) => {
                warn!(error = %e, "update check failed; will retry on next trigger");
                report.fail(FailureStage::Check, &e);
                report.phase = CyclePhase::Idle;
                return report;
            }
        }

        match self.oracle.head() {
            Ok(head) => report.from = Some(head),
            Err(e) => warn!(error = %e, "could not read current revision"),
        }

        if let Err(e) = self.oracle.preflight() {
            warn!(error = %e, "source tree cannot be fast-forwarded; service left running");
            report.fail(FailureStage::Preflight, &e);
            report.phase = CyclePhase::Failed;
            return report;
        }

        if self.cancel.is_cancelled() {
            info!("shutdown requested; update abandoned before stopping the service");
            return noop(report, NoOpReason::Cancelled);
        }

        info!(from = ?report.from.as_ref().map(|m| m.short()), "upstream is ahead; updating");
        let mut log = CycleLog::begin(self, &report);

        // ApplyingCode
        log.record.service_stopped = true;
        log.advance(CyclePhase::ApplyingCode);
        report.service_touched = true;
        if let Err(e) = self.service.stop() {
            let state = self.service.status();
            error!(error = %e, state = %state, "service did not stop; nothing was changed");
            report.fail(FailureStage::Stop, &e);
            report.service = Some(state);
            report.phase = CyclePhase::Failed;
            log.finish(&report);
            return report;
        }

        match self.oracle.pull() {
            Ok(to) => {
                info!(to = %to.short(), "source tree fast-forwarded");
                report.to = Some(to);
            }
            Err(e) => {
                report.fail(FailureStage::Pull, &e);
                if self.restart_after_pull_conflict {
                    error!(error = %e, "fast-forward failed; restarting on the old revision");
                    log.advance(CyclePhase::Restarting);
                    self.restart(&mut report, &mut log, None);
                } else {
                    let state = self.service.status();
                    error!(error = %e, state = %state, "fast-forward failed; service left stopped");
                    report.service = Some(state);
                    report.phase = CyclePhase::Failed;
                }
                log.finish(&report);
                return report;
            }
        }

        if let Some(hooks) = &self.hooks {
            report.hooks = hooks.run_all();
        }
        if let Some(plan) = &self.migrations {
            match plan.apply() {
                Ok(migrations) => report.migrations = Some(migrations),
                Err(e) => warn!(error = %e, "could not run migrations; continuing"),
            }
        }

        // ApplyingAssets
        log.advance(CyclePhase::ApplyingAssets);
        let installed = self.apply_assets(&mut report);

        // Restarting
        log.advance(CyclePhase::Restarting);
        self.restart(&mut report, &mut log, installed);

        if report.succeeded() {
            info!(summary = %report.summary(), "update complete");
        }
        log.finish(&report);
        report
    }

    /// Fetch and install the declared bundle if it differs from the installed
    /// one. Returns the version to record once the service is back up.
    fn apply_assets(&self, report: &mut CycleReport) -> Option<AssetVersion> {
        let pipeline = self.assets.as_ref()?;

        let declared = match pipeline
            .comparator
            .current_declared_version(&self.source_tree)
        {
            Ok(v) => v,
            Err(UpkeepError::MarkerMissing(path)) => {
                info!(marker = %path.display(), "no asset version declared; skipping assets");
                return None;
            }
            Err(e) => {
                error!(error = %e, "cannot read declared asset version; keeping current bundle");
                report.fail(FailureStage::Assets, &e);
                return None;
            }
        };
        report.declared_assets = Some(declared.clone());

        let installed = pipeline
            .comparator
            .last_installed_version()
            .unwrap_or_else(|e| {
                warn!(error = %e, "installed asset record unreadable; treating as absent");
                None
            });
        if !AssetVersionComparator::has_changed(&declared, installed.as_ref()) {
            debug!(version = %declared, "asset bundle unchanged");
            return None;
        }

        let locator = locator_for(&pipeline.url_template, &declared);
        info!(
            from = ?installed.as_ref().map(AssetVersion::as_str),
            to = %declared,
            "asset version changed"
        );
        let bundle = match pipeline.fetcher.fetch(&locator) {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, "asset fetch failed; previous bundle stays live");
                report.fail(FailureStage::Assets, &e);
                return None;
            }
        };

        let result = pipeline.installer.install(&bundle);
        pipeline.fetcher.discard(&bundle);
        match result {
            Ok(()) => {
                report.assets_installed = true;
                Some(declared)
            }
            Err(e) => {
                error!(error = %e, "asset install failed; previous bundle stays live");
                report.fail(FailureStage::Assets, &e);
                None
            }
        }
    }

    /// The single start attempt of a cycle that stopped the service. The
    /// installed-asset record is only written once the service is running.
    fn restart(&self, report: &mut CycleReport, log: &mut CycleLog, installed: Option<AssetVersion>) {
        match self.service.start() {
            Ok(()) => {
                log.record.service_started = true;
                if let (Some(version), Some(pipeline)) = (installed, &self.assets) {
                    if let Err(e) = pipeline.comparator.record_installed(&version) {
                        error!(error = %e, version = %version, "failed to record installed asset version");
                        report.fail(FailureStage::Assets, &e);
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "service failed to start after update");
                report.fail(FailureStage::Start, &e);
            }
        }
        let state = self.service.status();
        if state != ServiceState::Running {
            error!(state = %state, "service is not running at end of cycle");
        }
        report.service = Some(state);
        report.phase = if report.succeeded() {
            CyclePhase::Idle
        } else {
            CyclePhase::Failed
        };
    }
}

fn noop(mut report: CycleReport, reason: NoOpReason) -> CycleReport {
    report.noop = Some(reason);
    report.phase = CyclePhase::Idle;
    report
}
