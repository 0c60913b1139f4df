use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpkeepError {
    #[error("not initialized: run 'upkeep init'")]
    NotInitialized,

    #[error("invalid config: {0}")]
    Config(String),

    #[error("version check failed: {0}")]
    Check(String),

    #[error("fast-forward pull not possible: {0}")]
    PullConflict(String),

    #[error("asset version marker missing: {}", .0.display())]
    MarkerMissing(PathBuf),

    #[error("invalid asset version '{0}': must be alphanumeric with '.', '_', '+' or '-'")]
    InvalidAssetVersion(String),

    #[error("failed to fetch '{locator}': {cause}")]
    Fetch { locator: String, cause: String },

    #[error("failed to stage asset bundle: {0}")]
    Install(String),

    #[error("failed to swap asset bundle into place: {0}")]
    Swap(String),

    #[error("service did not stop within {}s", .0.as_secs_f64())]
    StopTimeout(Duration),

    #[error("service stop failed: {0}")]
    StopFailed(String),

    #[error("service start failed: {0}")]
    StartFailed(String),

    #[error("service status unavailable: {0}")]
    Status(String),

    #[error("required command not found on PATH: {0}")]
    CommandNotFound(String),

    #[error("hook '{name}' failed: {detail}")]
    HookFailed { name: String, detail: String },

    #[error("another upkeep process holds the lock{}", pid_suffix(.0))]
    Locked(Option<u32>),

    #[error("journal error: {0}")]
    Journal(String),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, UpkeepError>;

fn pid_suffix(pid: &Option<u32>) -> String {
    pid.map(|pid| format!(" (pid {pid})")).unwrap_or_default()
}
