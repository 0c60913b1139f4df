use crate::error::{Result, UpkeepError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// SupervisorBackend
// ---------------------------------------------------------------------------

/// How the served process is stopped, started and queried.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorBackend {
    /// A systemd unit driven through `systemctl`.
    Systemd {
        unit: String,
        /// Use `systemctl --user`.
        #[serde(default)]
        user: bool,
    },
    /// Arbitrary commands. `status` exiting 0 means the service is running.
    Command {
        start: Vec<String>,
        stop: Vec<String>,
        status: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// ServiceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub supervisor: SupervisorBackend,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_start_timeout() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    500
}

impl ServiceConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// SourceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Remote branch to track. Defaults to the checked-out branch's upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Start the service on the untouched old code when the pull fails.
    #[serde(default)]
    pub restart_after_pull_conflict: bool,
}

fn default_remote() -> String {
    "origin".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            branch: None,
            restart_after_pull_conflict: false,
        }
    }
}

// ---------------------------------------------------------------------------
// AssetsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetsConfig {
    /// Marker file in the source tree holding the declared asset version.
    #[serde(default = "default_marker_file")]
    pub marker_file: PathBuf,
    /// Bundle locator; `{version}` is replaced with the declared version.
    pub url_template: String,
    /// Path the service serves assets from. Owned by upkeep (a symlink).
    pub live_dir: PathBuf,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

fn default_marker_file() -> PathBuf {
    PathBuf::from(paths::DEFAULT_ASSET_MARKER)
}

fn default_fetch_timeout() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// ScheduleConfig / NetworkConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval")]
    pub interval_minutes: u64,
}

fn default_interval() -> u64 {
    10
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// `host:port` that must accept a TCP connection before checking upstream.
    #[serde(default = "default_probe")]
    pub probe: String,
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
}

fn default_probe() -> String {
    "8.8.8.8:53".to_string()
}

fn default_probe_timeout() -> u64 {
    3000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe: default_probe(),
            timeout_ms: default_probe_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// HooksConfig / DatabaseConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HookCommand {
    pub name: String,
    pub argv: Vec<String>,
    /// The hook is killed and reported failed after this long; the service
    /// stays down while it runs.
    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,
}

fn default_hook_timeout() -> u64 {
    600
}

impl HookCommand {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
            timeout_secs: default_hook_timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HooksConfig {
    /// Run in the source tree after a successful pull, before assets and restart.
    #[serde(default)]
    pub post_pull: Vec<HookCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Directory in the source tree whose `*.sql` files run after each pull.
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("storage.db")
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("sql")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            migrations_dir: default_migrations_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub service: ServiceConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<AssetsConfig>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkConfig>,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,
}

fn default_version() -> u32 {
    1
}

impl Config {
    pub fn new(supervisor: SupervisorBackend) -> Self {
        Self {
            version: 1,
            service: ServiceConfig {
                supervisor,
                stop_timeout_secs: default_stop_timeout(),
                start_timeout_secs: default_start_timeout(),
                poll_interval_ms: default_poll_interval(),
            },
            source: SourceConfig::default(),
            assets: None,
            schedule: ScheduleConfig::default(),
            network: None,
            hooks: HooksConfig::default(),
            database: None,
        }
    }

    pub fn with_assets(mut self, url_template: impl Into<String>, live_dir: PathBuf) -> Self {
        self.assets = Some(AssetsConfig {
            marker_file: default_marker_file(),
            url_template: url_template.into(),
            live_dir,
            fetch_timeout_secs: default_fetch_timeout(),
        });
        self
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(UpkeepError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.schedule.interval_minutes.saturating_mul(60))
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self, root: &Path) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        match &self.service.supervisor {
            SupervisorBackend::Systemd { unit, .. } if unit.trim().is_empty() => {
                error("service.supervisor.unit is empty".to_string());
            }
            SupervisorBackend::Command {
                start,
                stop,
                status,
            } => {
                for (name, argv) in [("start", start), ("stop", stop), ("status", status)] {
                    if argv.is_empty() {
                        error(format!("service.supervisor.{name} has no command"));
                    }
                }
            }
            _ => {}
        }

        if self.service.stop_timeout_secs == 0 {
            error("service.stop_timeout_secs must be greater than zero".to_string());
        }
        if self.service.start_timeout_secs == 0 {
            error("service.start_timeout_secs must be greater than zero".to_string());
        }
        if self.schedule.interval_minutes == 0 {
            error("schedule.interval_minutes must be greater than zero".to_string());
        }

        for hook in &self.hooks.post_pull {
            if hook.argv.is_empty() {
                error(format!("hook '{}' has no command", hook.name));
            }
            if hook.timeout_secs == 0 {
                error(format!("hook '{}' timeout_secs must be greater than zero", hook.name));
            }
        }

        if let Some(assets) = &self.assets {
            if !assets.url_template.contains("{version}") {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "assets.url_template '{}' has no {{version}} placeholder; every update fetches the same bundle",
                        assets.url_template
                    ),
                });
            }

            let live = paths::resolve(root, &assets.live_dir);
            if paths::is_within(&live, &paths::upkeep_dir(root)) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: "assets.live_dir must not be inside .upkeep/".to_string(),
                });
            }

            // The asset swap replaces everything under live_dir.
            if let Some(db) = &self.database {
                if paths::is_within(&paths::resolve(root, &db.path), &live) {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!(
                            "database.path '{}' is inside assets.live_dir and would be lost on the next asset swap",
                            db.path.display()
                        ),
                    });
                }
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
