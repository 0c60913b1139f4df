use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpkeepError};
use crate::io;

/// Identifies an asset bundle. Opaque to upkeep apart from its character set,
/// which is restricted so it can be embedded in locators and file names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetVersion(String);

static VERSION_RE: OnceLock<Regex> = OnceLock::new();

fn version_re() -> &'static Regex {
    VERSION_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._+-]*$").unwrap())
}

impl AssetVersion {
    pub fn parse(raw: &str) -> Result<Self> {
        let token = raw.trim();
        if version_re().is_match(token) {
            Ok(Self(token.to_string()))
        } else {
            Err(UpkeepError::InvalidAssetVersion(token.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Substitute `{version}` in a locator template.
pub fn locator_for(template: &str, version: &AssetVersion) -> String {
    template.replace("{version}", version.as_str())
}

/// Compares the asset version declared by the source tree with the one
/// last installed on this host.
#[derive(Debug, Clone)]
pub struct AssetVersionComparator {
    marker_file: PathBuf,
    record_path: PathBuf,
}

impl AssetVersionComparator {
    /// `marker_file` is relative to the source tree; `record_path` is the
    /// locally persisted last-installed record.
    pub fn new(marker_file: impl Into<PathBuf>, record_path: impl Into<PathBuf>) -> Self {
        Self {
            marker_file: marker_file.into(),
            record_path: record_path.into(),
        }
    }

    pub fn current_declared_version(&self, source_tree: &Path) -> Result<AssetVersion> {
        let path = source_tree.join(&self.marker_file);
        match io::read_marker(&path)? {
            Some(raw) => AssetVersion::parse(&raw),
            None => Err(UpkeepError::MarkerMissing(path)),
        }
    }

    /// `None` means nothing was ever recorded, which forces an install.
    pub fn last_installed_version(&self) -> Result<Option<AssetVersion>> {
        io::read_marker(&self.record_path)?
            .map(|raw| AssetVersion::parse(&raw))
            .transpose()
    }

    pub fn has_changed(declared: &AssetVersion, installed: Option<&AssetVersion>) -> bool {
        installed != Some(declared)
    }

    pub fn record_installed(&self, version: &AssetVersion) -> Result<()> {
        io::atomic_write(&self.record_path, format!("{version}\n").as_bytes())
    }

    pub fn record_path(&self) -> &Path {
        &self.record_path
    }
}
