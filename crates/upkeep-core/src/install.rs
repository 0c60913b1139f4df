//! Atomic replacement of the live asset directory.
//!
//! # Layout
//!
//! For a live path `web/build` everything lives next to it in `web/`:
//!
//! ```text
//! web/build                      -> .build.bundle-<id>   (symlink, the live path)
//! web/.build.bundle-<id>/        extracted, sealed bundle currently served
//! web/.build.staging-<id>/       extraction in progress (never served)
//! web/.build.link-<id>           new symlink about to be renamed over `build`
//! ```
//!
//! A bundle is extracted into a staging directory, sealed by renaming it to a
//! bundle directory, and published by renaming a freshly created symlink over
//! the live path. `rename(2)` replaces the symlink in one step, so readers
//! resolve either the old bundle or the new one. The previous bundle is
//! deleted only after the swap succeeded; anything left over from an
//! interrupted install is removed by the next install's cleanup pass.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{Result, UpkeepError};

pub struct AtomicAssetInstaller {
    live: PathBuf,
}

impl AtomicAssetInstaller {
    pub fn new(live: impl Into<PathBuf>) -> Self {
        Self { live: live.into() }
    }

    pub fn live_dir(&self) -> &Path {
        &self.live
    }

    /// Extract the zip archive at `bundle` and make it the live asset directory.
    pub fn install(&self, bundle: &Path) -> Result<()> {
        self.install_with(bundle, |link, live| std::fs::rename(link, live))
    }

    /// `install` with the final publishing rename supplied by the caller.
    fn install_with(
        &self,
        bundle: &Path,
        publish: impl FnOnce(&Path, &Path) -> std::io::Result<()>,
    ) -> Result<()> {
        let (parent, name) = self.layout().map_err(UpkeepError::Install)?;
        std::fs::create_dir_all(&parent).map_err(|e| UpkeepError::Install(e.to_string()))?;

        match self.cleanup() {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "removed leftovers from an earlier install"),
            Err(e) => warn!(error = %e, "staging cleanup failed; continuing"),
        }

        let id = Uuid::new_v4().simple().to_string();
        let staging = parent.join(format!(".{name}.staging-{id}"));
        let files = match extract_bundle(bundle, &staging) {
            Ok(n) => n,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(UpkeepError::Install(e));
            }
        };
        debug!(files, staging = %staging.display(), "bundle staged");

        let sealed_name = format!(".{name}.bundle-{id}");
        let sealed = parent.join(&sealed_name);
        if let Err(e) = std::fs::rename(&staging, &sealed) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(UpkeepError::Install(format!("failed to seal staged bundle: {e}")));
        }

        let previous = self.swap(&parent, &name, &sealed_name, &id, publish)?;
        info!(live = %self.live.display(), files, "asset bundle swapped in");

        if let Some(previous) = previous {
            if let Err(e) = std::fs::remove_dir_all(&previous) {
                warn!(path = %previous.display(), error = %e, "failed to remove previous bundle");
            }
        }
        Ok(())
    }

    /// Publish `sealed_name` at the live path. Returns the directory that was
    /// live before, if any. On failure the previous live directory is back in
    /// place and the sealed bundle is left for the next cleanup.
    fn swap(
        &self,
        parent: &Path,
        name: &str,
        sealed_name: &str,
        id: &str,
        publish: impl FnOnce(&Path, &Path) -> std::io::Result<()>,
    ) -> Result<Option<PathBuf>> {
        let mut previous = self.active_bundle();
        let mut moved_legacy: Option<PathBuf> = None;

        let is_plain_dir = std::fs::symlink_metadata(&self.live)
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if is_plain_dir {
            // A real directory cannot be replaced by rename; move it aside
            // once, after which the live path is always a symlink.
            let aside = parent.join(format!(".{name}.bundle-legacy-{id}"));
            warn!(live = %self.live.display(), "live asset path is a plain directory; converting to symlink layout");
            std::fs::rename(&self.live, &aside).map_err(|e| {
                UpkeepError::Swap(format!("failed to move legacy directory aside: {e}"))
            })?;
            previous = Some(aside.clone());
            moved_legacy = Some(aside);
        }

        let link = parent.join(format!(".{name}.link-{id}"));
        let result = make_dir_link(Path::new(sealed_name), &link)
            .and_then(|()| publish(&link, &self.live));
        if let Err(e) = result {
            let _ = std::fs::remove_file(&link);
            if let Some(aside) = &moved_legacy {
                if let Err(restore) = std::fs::rename(aside, &self.live) {
                    warn!(error = %restore, "failed to restore legacy asset directory");
                }
            }
            return Err(UpkeepError::Swap(e.to_string()));
        }
        Ok(previous)
    }

    /// The bundle directory the live symlink currently points at.
    pub fn active_bundle(&self) -> Option<PathBuf> {
        let target = std::fs::read_link(&self.live).ok()?;
        if target.is_absolute() {
            Some(target)
        } else {
            Some(self.live.parent()?.join(target))
        }
    }

    /// Remove staging directories, stray links and bundles that are not live.
    /// Returns the number of entries removed.
    pub fn cleanup(&self) -> Result<usize> {
        let (parent, name) = self.layout().map_err(UpkeepError::Install)?;
        let active = self.active_bundle();
        let prefixes = [
            format!(".{name}.staging-"),
            format!(".{name}.link-"),
            format!(".{name}.bundle-"),
        ];

        let mut removed = 0;
        let entries = match std::fs::read_dir(&parent) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !prefixes.iter().any(|p| file_name.starts_with(p.as_str())) {
                continue;
            }
            let path = entry.path();
            if active.as_deref() == Some(path.as_path()) {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
            debug!(path = %path.display(), "removed stale install entry");
            removed += 1;
        }
        Ok(removed)
    }

    fn layout(&self) -> std::result::Result<(PathBuf, String), String> {
        let name = self
            .live
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| format!("live asset path has no file name: {}", self.live.display()))?;
        let parent = match self.live.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok((parent, name))
    }
}

#[cfg(unix)]
fn make_dir_link(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_dir_link(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Extract a zip archive into `dest`, which must not exist yet. Entries whose
/// names would escape `dest` abort the extraction. Returns the file count.
fn extract_bundle(archive: &Path, dest: &Path) -> std::result::Result<usize, String> {
    let file = File::open(archive).map_err(|e| format!("failed to open bundle: {e}"))?;
    let mut zip =
        zip::ZipArchive::new(file).map_err(|e| format!("failed to read bundle archive: {e}"))?;
    std::fs::create_dir(dest).map_err(|e| format!("failed to create staging dir: {e}"))?;

    let mut files = 0;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| format!("failed to read archive entry {i}: {e}"))?;
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| format!("archive entry has an unsafe path: {}", entry.name()))?;
        let out = dest.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&out).map_err(|e| e.to_string())?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let mut target = File::create(&out).map_err(|e| e.to_string())?;
        std::io::copy(&mut entry, &mut target)
            .map_err(|e| format!("failed to extract {}: {e}", out.display()))?;
        files += 1;
    }
    Ok(files)
}

/// SHA-256 over every file under `dir` (relative path and content), in path
/// order. Follows the live symlink, so it describes what readers see.
pub fn bundle_digest(dir: &Path) -> Result<String> {
    let root = std::fs::canonicalize(dir)?;
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(&root).sort_by_file_name() {
        let entry = entry.map_err(|e| UpkeepError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let mut file = File::open(entry.path())?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        hasher.update(&buf);
        hasher.update([0u8]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
