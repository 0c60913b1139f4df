use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const UPKEEP_DIR: &str = ".upkeep";
pub const DOWNLOADS_DIR: &str = ".upkeep/downloads";

pub const CONFIG_FILE: &str = ".upkeep/config.yaml";
pub const INSTALLED_ASSETS_FILE: &str = ".upkeep/installed-assets";
pub const JOURNAL_FILE: &str = ".upkeep/journal.redb";
pub const LOCK_FILE: &str = ".upkeep/upkeep.lock";

/// Marker file in the source tree declaring the required asset version.
pub const DEFAULT_ASSET_MARKER: &str = "assets.version";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn upkeep_dir(root: &Path) -> PathBuf {
    root.join(UPKEEP_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn installed_assets_path(root: &Path) -> PathBuf {
    root.join(INSTALLED_ASSETS_FILE)
}

pub fn journal_path(root: &Path) -> PathBuf {
    root.join(JOURNAL_FILE)
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

pub fn downloads_dir(root: &Path) -> PathBuf {
    root.join(DOWNLOADS_DIR)
}

/// Resolve a configured path: absolute paths pass through, relative paths
/// are taken relative to the source tree root.
pub fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Lexical containment check used by config validation. Does not touch the
/// filesystem, so it works for paths that do not exist yet.
pub fn is_within(path: &Path, dir: &Path) -> bool {
    normalize(path).starts_with(normalize(dir))
}

fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
