//! Host-level run lock
//!
//! The idempotency guard is not transactional, so two bootstraps on the same
//! host must not overlap. The lock file is created exclusively and holds the
//! owner's pid; it is removed when the [`RunLock`] is dropped. A file left by
//! a run that was killed before it could clean up is taken over once its pid
//! no longer names a live process.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Exclusive lock held for the duration of a run
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the lock, failing if a live run holds it
    pub fn acquire(path: &Path) -> Result<Self> {
        match Self::create(path) {
            Err(Error::Locked { holder, .. }) if !holder_alive(&holder) => {
                warn!(path = %path.display(), pid = %holder, "Taking over run lock from dead process");
                std::fs::remove_file(path)?;
                Self::create(path)
            }
            other => other,
        }
    }

    fn create(path: &Path) -> Result<Self> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                debug!(path = %path.display(), "Acquired run lock");
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                Err(Error::Locked {
                    path: path.to_path_buf(),
                    holder,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether the pid recorded in a lock file still names a process.
///
/// An unreadable pid counts as alive: the holder may not have written it yet.
fn holder_alive(holder: &str) -> bool {
    let Ok(pid) = holder.parse::<i32>() else {
        return true;
    };
    if pid <= 0 {
        return true;
    }
    // EPERM: the process exists under another user
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove run lock");
        }
    }
}
