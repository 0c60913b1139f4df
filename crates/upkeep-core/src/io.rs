use crate::error::Result;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Atomically write `data` to `path` using a tempfile in the same directory.
/// Readers see either the previous content or the new content, never a prefix.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Create a directory and all parents, idempotent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Read a one-line marker file.
///
/// Returns the first line with surrounding whitespace removed, or `None` when
/// the file does not exist or holds only whitespace.
pub fn read_marker(path: &Path) -> Result<Option<String>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let token = content.lines().next().unwrap_or("").trim();
    if token.is_empty() {
        Ok(None)
    } else {
        Ok(Some(token.to_string()))
    }
}

/// Append `entry` as its own line in `root/.gitignore`. Returns false when an
/// identical line is already there.
pub fn ignore_in_git(root: &Path, entry: &str) -> Result<bool> {
    let path = root.join(".gitignore");
    let current = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    if current.lines().any(|line| line.trim_end() == entry) {
        return Ok(false);
    }

    let mut updated = current;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(entry);
    updated.push('\n');
    atomic_write(&path, updated.as_bytes())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_replaces_existing_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("installed-assets");
        atomic_write(&path, b"v3\n").unwrap();
        atomic_write(&path, b"v4\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "v4\n");
    }

    #[test]
    fn atomic_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/marker");
        atomic_write(&path, b"data").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn read_marker_takes_first_trimmed_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("assets.version");
        std::fs::write(&path, "  v4  \nsecond line\n").unwrap();
        assert_eq!(read_marker(&path).unwrap().as_deref(), Some("v4"));
    }

    #[test]
    fn read_marker_missing_or_blank_is_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("assets.version");
        assert_eq!(read_marker(&path).unwrap(), None);
        std::fs::write(&path, "\n   \n").unwrap();
        assert_eq!(read_marker(&path).unwrap(), None);
    }

    #[test]
    fn ignore_in_git_appends_once() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "node_modules").unwrap();
        assert!(ignore_in_git(dir.path(), ".upkeep/").unwrap());
        assert!(!ignore_in_git(dir.path(), ".upkeep/").unwrap());
        let content = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(content, "node_modules\n.upkeep/\n");
    }

    #[test]
    fn ignore_in_git_creates_file() {
        let dir = TempDir::new().unwrap();
        assert!(ignore_in_git(dir.path(), "/web/build/").unwrap());
        let content = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(content, "/web/build/\n");
    }
}
