//! Source-revision checks.
//!
//! [`Vcs`] is the opaque version-control capability; [`GitCli`] implements it
//! by shelling out to `git`. [`VersionOracle`] is what the orchestrator talks
//! to: it turns a structured [`Divergence`] into the single "should we update"
//! decision and never parses human-readable status text.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, UpkeepError};

/// Identifies a source revision (a commit id for git).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionMarker(pub String);

impl VersionMarker {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for VersionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relationship between the local checkout and its remote-tracking ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Divergence {
    Even,
    Ahead,
    Behind,
    Diverged,
}

impl Divergence {
    pub fn from_counts(ahead: u64, behind: u64) -> Self {
        match (ahead, behind) {
            (0, 0) => Self::Even,
            (_, 0) => Self::Ahead,
            (0, _) => Self::Behind,
            _ => Self::Diverged,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Even => "even",
            Self::Ahead => "ahead",
            Self::Behind => "behind",
            Self::Diverged => "diverged",
        }
    }
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The version-control capability the orchestrator depends on.
pub trait Vcs: Send + Sync {
    /// Refresh remote-tracking refs without touching the working tree.
    fn fetch_remote(&self) -> Result<()>;
    /// Compare local HEAD with the remote-tracking ref.
    fn divergence(&self) -> Result<Divergence>;
    /// Fast-forward the working tree to the remote-tracking ref.
    /// Fails with [`UpkeepError::PullConflict`] when that is not possible.
    fn fast_forward(&self) -> Result<VersionMarker>;
    fn head(&self) -> Result<VersionMarker>;
    /// True when tracked files have no local modifications.
    fn is_clean(&self) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// GitCli
// ---------------------------------------------------------------------------

/// [`Vcs`] backed by the `git` executable.
pub struct GitCli {
    git: PathBuf,
    repo: PathBuf,
    remote: String,
    branch: Option<String>,
}

impl GitCli {
    pub fn new(repo: &Path, remote: impl Into<String>, branch: Option<String>) -> Result<Self> {
        let git = which::which("git").map_err(|_| UpkeepError::CommandNotFound("git".into()))?;
        Ok(Self {
            git,
            repo: repo.to_path_buf(),
            remote: remote.into(),
            branch,
        })
    }

    fn upstream(&self) -> String {
        match &self.branch {
            Some(branch) => format!("{}/{}", self.remote, branch),
            None => "@{u}".to_string(),
        }
    }

    /// Run git in the repository. Returns trimmed stdout, or trimmed stderr
    /// as the error message.
    fn git(&self, args: &[&str]) -> std::result::Result<String, String> {
        debug!(repo = %self.repo.display(), ?args, "git");
        let output = Command::new(&self.git)
            .arg("-C")
            .arg(&self.repo)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| format!("failed to run git: {e}"))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(if stderr.is_empty() {
                format!("git {} exited with {}", args.join(" "), output.status)
            } else {
                stderr
            })
        }
    }
}

impl Vcs for GitCli {
    fn fetch_remote(&self) -> Result<()> {
        self.git(&["fetch", "--quiet", &self.remote])
            .map(|_| ())
            .map_err(UpkeepError::Check)
    }

    fn divergence(&self) -> Result<Divergence> {
        let range = format!("HEAD...{}", self.upstream());
        let out = self
            .git(&["rev-list", "--left-right", "--count", &range])
            .map_err(UpkeepError::Check)?;
        let (ahead, behind) = parse_counts(&out)
            .ok_or_else(|| UpkeepError::Check(format!("unexpected rev-list output: {out:?}")))?;
        Ok(Divergence::from_counts(ahead, behind))
    }

    fn fast_forward(&self) -> Result<VersionMarker> {
        self.git(&["merge", "--ff-only", "--quiet", &self.upstream()])
            .map_err(UpkeepError::PullConflict)?;
        self.head()
    }

    fn head(&self) -> Result<VersionMarker> {
        self.git(&["rev-parse", "HEAD"])
            .map(VersionMarker)
            .map_err(UpkeepError::Check)
    }

    fn is_clean(&self) -> Result<bool> {
        self.git(&["status", "--porcelain", "--untracked-files=no"])
            .map(|out| out.is_empty())
            .map_err(UpkeepError::Check)
    }
}

/// Parse `git rev-list --left-right --count` output: `"<ahead>\t<behind>"`.
pub fn parse_counts(out: &str) -> Option<(u64, u64)> {
    let mut parts = out.split_whitespace();
    let ahead = parts.next()?.parse().ok()?;
    let behind = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((ahead, behind))
}

// ---------------------------------------------------------------------------
// VersionOracle
// ---------------------------------------------------------------------------

pub struct VersionOracle {
    vcs: Box<dyn Vcs>,
}

impl VersionOracle {
    pub fn new(vcs: Box<dyn Vcs>) -> Self {
        Self { vcs }
    }

    /// Refresh remote refs and report the divergence. Any failure is a
    /// [`UpkeepError::Check`].
    pub fn divergence(&self) -> Result<Divergence> {
        self.vcs.fetch_remote().map_err(as_check)?;
        self.vcs.divergence().map_err(as_check)
    }

    /// Only a strictly-behind checkout triggers an update. Ahead and diverged
    /// checkouts have local history we must not clobber.
    pub fn is_behind(&self) -> Result<bool> {
        match self.divergence()? {
            Divergence::Behind => Ok(true),
            Divergence::Even => Ok(false),
            other => {
                warn!(divergence = %other, "local checkout is not strictly behind upstream; skipping update");
                Ok(false)
            }
        }
    }

    /// Cheap check run before the service is stopped: a dirty working tree
    /// would make the fast-forward fail after the service is already down.
    pub fn preflight(&self) -> Result<()> {
        if self.vcs.is_clean().map_err(as_check)? {
            Ok(())
        } else {
            Err(UpkeepError::PullConflict(
                "working tree has local modifications".into(),
            ))
        }
    }

    pub fn pull(&self) -> Result<VersionMarker> {
        self.vcs.fast_forward().map_err(|e| match e {
            UpkeepError::PullConflict(_) => e,
            other => UpkeepError::PullConflict(other.to_string()),
        })
    }

    pub fn head(&self) -> Result<VersionMarker> {
        self.vcs.head()
    }
}

fn as_check(e: UpkeepError) -> UpkeepError {
    match e {
        UpkeepError::Check(_) => e,
        other => UpkeepError::Check(other.to_string()),
    }
}
