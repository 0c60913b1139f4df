//! Post-pull hook commands.
//!
//! Hooks run in the source tree after a successful pull while the service is
//! still stopped, typically to refresh dependencies declared by the new code.
//! A failing hook is reported but never aborts the cycle: the service is
//! brought back up regardless.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::HookCommand;
use crate::error::{Result, UpkeepError};

/// Result of one hook invocation.
#[derive(Debug, Clone, Serialize)]
pub struct HookOutcome {
    pub name: String,
    pub success: bool,
    /// Last lines of combined output, or the spawn error.
    pub detail: String,
}

pub struct HookRunner {
    hooks: Vec<HookCommand>,
    cwd: PathBuf,
}

impl HookRunner {
    pub fn new(hooks: Vec<HookCommand>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            hooks,
            cwd: cwd.into(),
        }
    }

    /// Run every hook in order, continuing past failures.
    pub fn run_all(&self) -> Vec<HookOutcome> {
        self.hooks
            .iter()
            .map(|hook| match run_hook(hook, &self.cwd) {
                Ok(detail) => {
                    info!(hook = %hook.name, "hook succeeded");
                    HookOutcome {
                        name: hook.name.clone(),
                        success: true,
                        detail,
                    }
                }
                Err(e) => {
                    warn!(hook = %hook.name, error = %e, "hook failed; continuing");
                    HookOutcome {
                        name: hook.name.clone(),
                        success: false,
                        detail: e.to_string(),
                    }
                }
            })
            .collect()
    }
}

const POLL: Duration = Duration::from_millis(50);

/// Run a single hook in `cwd`. Returns the tail of its output. A hook still
/// running after its timeout is killed along with its process group.
pub fn run_hook(hook: &HookCommand, cwd: &Path) -> Result<String> {
    let failed = |detail: String| UpkeepError::HookFailed {
        name: hook.name.clone(),
        detail,
    };
    let program = hook
        .argv
        .first()
        .ok_or_else(|| failed("empty command".into()))?;
    let program = which::which(program)
        .map_err(|_| UpkeepError::CommandNotFound(program.clone()))?;

    // A file rather than pipes: a chatty hook can never block on a full pipe
    // while we poll for its exit.
    let mut log = tempfile::tempfile()?;
    let mut cmd = Command::new(program);
    cmd.args(&hook.argv[1..])
        .current_dir(cwd)
        .env("UPKEEP_ROOT", cwd)
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log.try_clone()?);
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
    let mut child = cmd.spawn().map_err(|e| failed(e.to_string()))?;

    let status = wait_until(&mut child, Instant::now() + hook.timeout())?;

    let mut raw = Vec::new();
    log.seek(SeekFrom::Start(0))?;
    log.read_to_end(&mut raw)?;
    let detail = tail(&String::from_utf8_lossy(&raw), 20);

    match status {
        Some(status) if status.success() => Ok(detail),
        Some(status) => Err(failed(format!("exited with {status}: {detail}"))),
        None => Err(failed(format!(
            "timed out after {}s: {detail}",
            hook.timeout_secs
        ))),
    }
}

/// Wait for `child` to exit. Past `deadline` it is killed and `None` returned.
fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            kill_tree(child);
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL);
    }
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        warn!(pid = child.id(), error = %e, "failed to kill hook process group");
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hook(name: &str, argv: &[&str]) -> HookCommand {
        HookCommand::new(name, argv.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn hooks_run_in_source_tree_and_continue_past_failures() {
        let dir = TempDir::new().unwrap();
        let runner = HookRunner::new(
            vec![
                hook("fails", &["sh", "-c", "echo broken >&2; exit 3"]),
                hook("deps", &["sh", "-c", "echo installed > deps.txt"]),
            ],
            dir.path(),
        );

        let outcomes = runner.run_all();

        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].success);
        assert!(outcomes[0].detail.contains("broken"));
        assert!(outcomes[1].success);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("deps.txt")).unwrap(),
            "installed\n"
        );
    }

    #[test]
    fn missing_program_is_command_not_found() {
        let dir = TempDir::new().unwrap();
        let err = run_hook(&hook("x", &["definitely-not-a-real-binary-42"]), dir.path())
            .unwrap_err();
        assert!(matches!(err, UpkeepError::CommandNotFound(_)));
    }

    #[test]
    fn hung_hook_is_killed_at_its_timeout() {
        let dir = TempDir::new().unwrap();
        let mut stuck = hook("stuck", &["sh", "-c", "echo fetching; sleep 30"]);
        stuck.timeout_secs = 1;
        let runner = HookRunner::new(vec![stuck, hook("after", &["touch", "after.txt"])], dir.path());

        let started = Instant::now();
        let outcomes = runner.run_all();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!outcomes[0].success);
        assert!(outcomes[0].detail.contains("timed out after 1s"), "{}", outcomes[0].detail);
        assert!(outcomes[0].detail.contains("fetching"));
        assert!(outcomes[1].success);
        assert!(dir.path().join("after.txt").exists());
    }

    #[test]
    fn large_output_does_not_stall_the_hook() {
        let dir = TempDir::new().unwrap();
        let mut noisy = hook("noisy", &["sh", "-c", "seq 1 200000; echo done"]);
        noisy.timeout_secs = 30;
        let detail = run_hook(&noisy, dir.path()).unwrap();
        assert!(detail.ends_with("done"));
        assert_eq!(detail.lines().count(), 20);
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail("", 5), "");
    }
}
