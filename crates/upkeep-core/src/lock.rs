//! Host-wide instance lock.
//!
//! An exclusive `flock(2)` on `.upkeep/upkeep.lock`. The kernel releases it
//! when the holder exits, however it exits, so a lock file left behind by a
//! crash or a power cut never blocks later runs. The file is never removed
//! and its content (the holder's pid) is informational only.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, UpkeepError};

pub struct InstanceLock {
    path: PathBuf,
    _file: imp::Locked,
}

impl InstanceLock {
    /// Acquire the lock at `path` without waiting, or fail with
    /// [`UpkeepError::Locked`].
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = open(path)?;
        let locked = match imp::try_exclusive(file)? {
            Some(locked) => locked,
            None => return Err(UpkeepError::Locked(read_pid(path))),
        };

        let mut handle: &File = &locked;
        handle.set_len(0)?;
        writeln!(handle, "{}", std::process::id())?;
        handle.sync_all()?;
        debug!(path = %path.display(), "instance lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            _file: locked,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceLock").field("path", &self.path).finish()
    }
}

/// Pid of the process currently holding the lock at `path`, or `None` when
/// nobody holds it. A stale pid left in the file is not reported.
pub fn holder(path: &Path) -> Option<u32> {
    let file = File::open(path).ok()?;
    match imp::is_held(file) {
        Ok(true) => read_pid(path),
        Ok(false) => None,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "cannot inspect instance lock");
            None
        }
    }
}

fn open(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
mod imp {
    use std::fs::File;

    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    pub type Locked = Flock<File>;

    /// `None` when another open file description holds the lock.
    pub fn try_exclusive(file: File) -> std::io::Result<Option<Locked>> {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => Ok(Some(locked)),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(errno.into()),
        }
    }

    /// A shared lock conflicts only with an exclusive holder. The shared lock
    /// is released as soon as it is dropped.
    pub fn is_held(file: File) -> std::io::Result<bool> {
        match Flock::lock(file, FlockArg::LockSharedNonblock) {
            Ok(_shared) => Ok(false),
            Err((_, Errno::EWOULDBLOCK)) => Ok(true),
            Err((_, errno)) => Err(errno.into()),
        }
    }
}

/// Advisory locking is only enforced on unix hosts.
#[cfg(not(unix))]
mod imp {
    use std::fs::File;

    pub type Locked = File;

    pub fn try_exclusive(file: File) -> std::io::Result<Option<Locked>> {
        Ok(Some(file))
    }

    pub fn is_held(_file: File) -> std::io::Result<bool> {
        Ok(false)
    }
}
