//! Stop/start of the served process.
//!
//! A [`Supervisor`] only *requests* state changes; [`ServiceLifecycleController`]
//! turns those requests into blocking, timeout-guarded operations by polling
//! the reported state.

use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ServiceConfig, SupervisorBackend};
use crate::error::{Result, UpkeepError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Failed,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-supervisor capability.
pub trait Supervisor: Send + Sync {
    /// Request a stop. Returning does not mean the service has stopped.
    fn stop(&self) -> Result<()>;
    /// Request a start. Returning does not mean the service is running.
    fn start(&self) -> Result<()>;
    fn query_status(&self) -> Result<ServiceState>;
    /// Human-readable service name for logs.
    fn name(&self) -> String;
}

/// Build the supervisor configured in `service.supervisor`.
pub fn supervisor_from_config(backend: &SupervisorBackend) -> Result<Box<dyn Supervisor>> {
    match backend {
        SupervisorBackend::Systemd { unit, user } => {
            Ok(Box::new(Systemd::new(unit.clone(), *user)?))
        }
        SupervisorBackend::Command {
            start,
            stop,
            status,
        } => Ok(Box::new(CommandSupervisor::new(
            start.clone(),
            stop.clone(),
            status.clone(),
        )?)),
    }
}

// ---------------------------------------------------------------------------
// Systemd
// ---------------------------------------------------------------------------

pub struct Systemd {
    systemctl: PathBuf,
    unit: String,
    user: bool,
}

impl Systemd {
    pub fn new(unit: String, user: bool) -> Result<Self> {
        let systemctl = which::which("systemctl")
            .map_err(|_| UpkeepError::CommandNotFound("systemctl".into()))?;
        Ok(Self {
            systemctl,
            unit,
            user,
        })
    }

    fn systemctl(&self, verb: &str) -> std::io::Result<Output> {
        let mut cmd = Command::new(&self.systemctl);
        if self.user {
            cmd.arg("--user");
        }
        cmd.args([verb, &self.unit])
            .stdin(Stdio::null())
            .output()
    }
}

impl Supervisor for Systemd {
    fn stop(&self) -> Result<()> {
        let out = self
            .systemctl("stop")
            .map_err(|e| UpkeepError::StopFailed(e.to_string()))?;
        if out.status.success() {
            Ok(())
        } else {
            Err(UpkeepError::StopFailed(stderr_of(&out)))
        }
    }

    fn start(&self) -> Result<()> {
        let out = self
            .systemctl("start")
            .map_err(|e| UpkeepError::StartFailed(e.to_string()))?;
        if out.status.success() {
            Ok(())
        } else {
            Err(UpkeepError::StartFailed(stderr_of(&out)))
        }
    }

    fn query_status(&self) -> Result<ServiceState> {
        // is-active exits non-zero for every state but "active"; only stdout matters.
        let out = self
            .systemctl("is-active")
            .map_err(|e| UpkeepError::Status(e.to_string()))?;
        Ok(parse_active_state(&String::from_utf8_lossy(&out.stdout)))
    }

    fn name(&self) -> String {
        self.unit.clone()
    }
}

/// Map `systemctl is-active` output to a [`ServiceState`].
pub fn parse_active_state(out: &str) -> ServiceState {
    match out.trim() {
        "active" => ServiceState::Running,
        "activating" | "reloading" | "refreshing" => ServiceState::Starting,
        "failed" => ServiceState::Failed,
        _ => ServiceState::Stopped,
    }
}

// ---------------------------------------------------------------------------
// CommandSupervisor
// ---------------------------------------------------------------------------

/// Supervisor driven by operator-provided commands. `status` exiting 0 means
/// the service is running, any other exit means stopped.
pub struct CommandSupervisor {
    start: Vec<String>,
    stop: Vec<String>,
    status: Vec<String>,
}

impl CommandSupervisor {
    pub fn new(start: Vec<String>, stop: Vec<String>, status: Vec<String>) -> Result<Self> {
        for (what, argv) in [("start", &start), ("stop", &stop), ("status", &status)] {
            if argv.is_empty() {
                return Err(UpkeepError::Config(format!(
                    "service.supervisor.{what} has no command"
                )));
            }
        }
        Ok(Self {
            start,
            stop,
            status,
        })
    }

    fn run(argv: &[String]) -> std::io::Result<Output> {
        Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .output()
    }
}

impl Supervisor for CommandSupervisor {
    fn stop(&self) -> Result<()> {
        let out = Self::run(&self.stop).map_err(|e| UpkeepError::StopFailed(e.to_string()))?;
        if out.status.success() {
            Ok(())
        } else {
            Err(UpkeepError::StopFailed(stderr_of(&out)))
        }
    }

    fn start(&self) -> Result<()> {
        let out = Self::run(&self.start).map_err(|e| UpkeepError::StartFailed(e.to_string()))?;
        if out.status.success() {
            Ok(())
        } else {
            Err(UpkeepError::StartFailed(stderr_of(&out)))
        }
    }

    fn query_status(&self) -> Result<ServiceState> {
        let out = Self::run(&self.status).map_err(|e| UpkeepError::Status(e.to_string()))?;
        Ok(if out.status.success() {
            ServiceState::Running
        } else {
            ServiceState::Stopped
        })
    }

    fn name(&self) -> String {
        self.start.join(" ")
    }
}

fn stderr_of(out: &Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exited with {}", out.status)
    } else {
        stderr
    }
}

// ---------------------------------------------------------------------------
// ServiceLifecycleController
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub stop: Duration,
    pub start: Duration,
    pub poll: Duration,
}

impl From<&ServiceConfig> for Timeouts {
    fn from(cfg: &ServiceConfig) -> Self {
        Self {
            stop: cfg.stop_timeout(),
            start: cfg.start_timeout(),
            poll: cfg.poll_interval(),
        }
    }
}

pub struct ServiceLifecycleController {
    supervisor: Box<dyn Supervisor>,
    timeouts: Timeouts,
}

impl ServiceLifecycleController {
    pub fn new(supervisor: Box<dyn Supervisor>, timeouts: Timeouts) -> Self {
        Self {
            supervisor,
            timeouts,
        }
    }

    pub fn name(&self) -> String {
        self.supervisor.name()
    }

    /// Current state. A supervisor that cannot be queried reports `Failed`.
    pub fn status(&self) -> ServiceState {
        match self.supervisor.query_status() {
            Ok(state) => state,
            Err(e) => {
                warn!(service = %self.supervisor.name(), error = %e, "service status query failed");
                ServiceState::Failed
            }
        }
    }

    /// Stop the service and block until it reports `Stopped`, or `Failed`
    /// (systemd's state for a unit whose process exited non-zero on SIGTERM).
    pub fn stop(&self) -> Result<()> {
        info!(service = %self.supervisor.name(), "stopping service");
        self.supervisor.stop().map_err(|e| match e {
            UpkeepError::StopFailed(_) => e,
            other => UpkeepError::StopFailed(other.to_string()),
        })?;
        let settled = self.wait_for(self.timeouts.stop, |s| {
            matches!(s, ServiceState::Stopped | ServiceState::Failed)
        });
        match settled {
            Some(_) => Ok(()),
            None => Err(UpkeepError::StopTimeout(self.timeouts.stop)),
        }
    }

    /// Start the service and block until it reports `Running`. No retries.
    pub fn start(&self) -> Result<()> {
        info!(service = %self.supervisor.name(), "starting service");
        self.supervisor.start().map_err(|e| match e {
            UpkeepError::StartFailed(_) => e,
            other => UpkeepError::StartFailed(other.to_string()),
        })?;
        let settled = self.wait_for(self.timeouts.start, |s| {
            matches!(s, ServiceState::Running | ServiceState::Failed)
        });
        match settled {
            Some(ServiceState::Running) => Ok(()),
            Some(_) => Err(UpkeepError::StartFailed(
                "service entered the failed state".into(),
            )),
            None => Err(UpkeepError::StartFailed(format!(
                "service did not report running within {}s",
                self.timeouts.start.as_secs_f64()
            ))),
        }
    }

    /// Poll until `done` accepts an observed state or `timeout` elapses. A
    /// failed status query is never accepted. Always polls at least once.
    fn wait_for(&self, timeout: Duration, done: impl Fn(ServiceState) -> bool) -> Option<ServiceState> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.supervisor.query_status() {
                Ok(state) if done(state) => return Some(state),
                Ok(_) => {}
                Err(e) => {
                    debug!(service = %self.supervisor.name(), error = %e, "status query failed while waiting")
                }
            }
            if Instant::now() >= deadline {
                debug!("gave up waiting for service state");
                return None;
            }
            thread::sleep(self.timeouts.poll);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Reports `Running` for the first `stop_lag` polls, then `after_stop`.
    struct Scripted {
        state: Mutex<ServiceState>,
        after_start: ServiceState,
        stop_lag: Mutex<u32>,
        /// State reported once the stop lag runs out.
        after_stop: ServiceState,
        refuse_start: bool,
    }

    impl Scripted {
        fn new(after_start: ServiceState, stop_lag: u32) -> Self {
            Self {
                state: Mutex::new(ServiceState::Running),
                after_start,
                stop_lag: Mutex::new(stop_lag),
                after_stop: ServiceState::Stopped,
                refuse_start: false,
            }
        }
    }

    impl Supervisor for Scripted {
        fn stop(&self) -> Result<()> {
            Ok(())
        }
        fn start(&self) -> Result<()> {
            if self.refuse_start {
                return Err(UpkeepError::StartFailed("unit not found".into()));
            }
            *self.state.lock().unwrap() = self.after_start;
            Ok(())
        }
        fn query_status(&self) -> Result<ServiceState> {
            let mut state = self.state.lock().unwrap();
            if *state == ServiceState::Running {
                let mut lag = self.stop_lag.lock().unwrap();
                if *lag == 0 {
                    *state = self.after_stop;
                } else if *lag != u32::MAX {
                    *lag -= 1;
                }
            }
            Ok(*state)
        }
        fn name(&self) -> String {
            "scripted".into()
        }
    }

    fn fast() -> Timeouts {
        Timeouts {
            stop: Duration::from_millis(50),
            start: Duration::from_millis(50),
            poll: Duration::from_millis(1),
        }
    }

    #[test]
    fn parse_active_state_maps_systemd_states() {
        assert_eq!(parse_active_state("active\n"), ServiceState::Running);
        assert_eq!(parse_active_state("activating"), ServiceState::Starting);
        assert_eq!(parse_active_state("failed"), ServiceState::Failed);
        assert_eq!(parse_active_state("inactive"), ServiceState::Stopped);
        assert_eq!(parse_active_state("unknown"), ServiceState::Stopped);
    }

    #[test]
    fn stop_waits_for_stopped() {
        let ctl = ServiceLifecycleController::new(
            Box::new(Scripted::new(ServiceState::Running, 3)),
            fast(),
        );
        ctl.stop().unwrap();
        assert_eq!(ctl.status(), ServiceState::Stopped);
    }

    #[test]
    fn stop_times_out_when_service_never_stops() {
        let ctl = ServiceLifecycleController::new(
            Box::new(Scripted::new(ServiceState::Running, u32::MAX)),
            fast(),
        );
        assert!(matches!(ctl.stop(), Err(UpkeepError::StopTimeout(_))));
    }

    #[test]
    fn stop_accepts_unit_that_died_failed() {
        let mut scripted = Scripted::new(ServiceState::Running, 2);
        scripted.after_stop = ServiceState::Failed;
        let ctl = ServiceLifecycleController::new(Box::new(scripted), fast());
        ctl.stop().unwrap();
    }

    struct Unqueryable;

    impl Supervisor for Unqueryable {
        fn stop(&self) -> Result<()> {
            Ok(())
        }
        fn start(&self) -> Result<()> {
            Ok(())
        }
        fn query_status(&self) -> Result<ServiceState> {
            Err(UpkeepError::Status("dbus unavailable".into()))
        }
        fn name(&self) -> String {
            "unqueryable".into()
        }
    }

    #[test]
    fn status_query_errors_never_count_as_stopped() {
        let ctl = ServiceLifecycleController::new(Box::new(Unqueryable), fast());
        assert_eq!(ctl.status(), ServiceState::Failed);
        assert!(matches!(ctl.stop(), Err(UpkeepError::StopTimeout(_))));
        assert!(matches!(ctl.start(), Err(UpkeepError::StartFailed(_))));
    }

    #[test]
    fn start_reports_failed_state() {
        let ctl = ServiceLifecycleController::new(
            Box::new(Scripted::new(ServiceState::Failed, 0)),
            fast(),
        );
        ctl.stop().unwrap();
        let err = ctl.start().unwrap_err();
        assert!(matches!(err, UpkeepError::StartFailed(_)));
    }

    #[test]
    fn start_refusal_is_start_failed() {
        let mut scripted = Scripted::new(ServiceState::Running, 0);
        scripted.refuse_start = true;
        let ctl = ServiceLifecycleController::new(Box::new(scripted), fast());
        assert!(matches!(ctl.start(), Err(UpkeepError::StartFailed(_))));
    }

    #[cfg(unix)]
    #[test]
    fn command_supervisor_uses_status_exit_code() {
        let dir = tempfile::TempDir::new().unwrap();
        let flag = dir.path().join("running");
        let flag_str = flag.to_str().unwrap().to_string();
        let sup = CommandSupervisor::new(
            vec!["touch".into(), flag_str.clone()],
            vec!["rm".into(), "-f".into(), flag_str.clone()],
            vec!["test".into(), "-f".into(), flag_str],
        )
        .unwrap();
        let ctl = ServiceLifecycleController::new(Box::new(sup), fast());

        assert_eq!(ctl.status(), ServiceState::Stopped);
        ctl.start().unwrap();
        assert!(flag.exists());
        ctl.stop().unwrap();
        assert!(!flag.exists());
    }

    #[test]
    fn command_supervisor_rejects_empty_argv() {
        assert!(CommandSupervisor::new(vec![], vec!["x".into()], vec!["y".into()]).is_err());
    }
}
