//! Cross-process lock serializing writes to a file-based store.
//!
//! Writers hold an exclusive lock for the whole write-and-flush; readers
//! take a shared lock so they never observe a half-written record. Both
//! block until the lock is available: there is no timeout.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use rcache_error::{RcacheError, Result};
use tracing::{debug, warn};

/// Handle to the lock file guarding one store root.
#[derive(Debug, Clone)]
pub struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until exclusive (writer) access is granted.
    pub fn exclusive(&self) -> Result<LockGuard> {
        self.acquire(LockMode::Exclusive)
    }

    /// Block until shared (reader) access is granted.
    pub fn shared(&self) -> Result<LockGuard> {
        self.acquire(LockMode::Shared)
    }

    fn open(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|err| {
                RcacheError::storage(format!(
                    "cannot open lock file {}: {err}",
                    self.path.display()
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

#[cfg(unix)]
mod imp {
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    use super::{File, LockMode, RcacheError, Result, StoreLock, debug, warn};

    /// Held lock; released on drop.
    pub struct LockGuard {
        _flock: Flock<File>,
    }

    impl std::fmt::Debug for LockGuard {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("LockGuard(flock)")
        }
    }

    impl StoreLock {
        pub(super) fn acquire(&self, mode: LockMode) -> Result<LockGuard> {
            let (try_arg, wait_arg) = match mode {
                LockMode::Shared => (FlockArg::LockSharedNonblock, FlockArg::LockShared),
                LockMode::Exclusive => (FlockArg::LockExclusiveNonblock, FlockArg::LockExclusive),
            };
            let file = self.open()?;
            let file = match Flock::lock(file, try_arg) {
                Ok(flock) => return Ok(LockGuard { _flock: flock }),
                Err((file, errno)) if errno == Errno::EWOULDBLOCK => file,
                Err((_, errno)) => return Err(self.lock_error(errno)),
            };
            warn!(lock = %self.path.display(), ?mode, "waiting on store lock");
            let flock = Flock::lock(file, wait_arg).map_err(|(_, errno)| self.lock_error(errno))?;
            debug!(lock = %self.path.display(), ?mode, "store lock acquired after wait");
            Ok(LockGuard { _flock: flock })
        }

        fn lock_error(&self, errno: Errno) -> RcacheError {
            RcacheError::storage(format!("flock on {} failed: {errno}", self.path.display()))
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::{File, LockMode, RcacheError, Result, StoreLock, debug, warn};

    /// Held lock; released on drop.
    ///
    /// Without advisory locks the guard is a sentinel file created
    /// exclusively next to the lock file; readers and writers both take it.
    #[derive(Debug)]
    pub struct LockGuard {
        sentinel: PathBuf,
        _file: File,
    }

    impl Drop for LockGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.sentinel);
        }
    }

    impl StoreLock {
        pub(super) fn acquire(&self, mode: LockMode) -> Result<LockGuard> {
            let _ = self.open()?;
            let sentinel = self.path.with_extension("held");
            let mut waited = false;
            loop {
                match OpenOptions::new().write(true).create_new(true).open(&sentinel) {
                    Ok(file) => {
                        if waited {
                            debug!(lock = %self.path.display(), ?mode, "store lock acquired after wait");
                        }
                        return Ok(LockGuard { sentinel, _file: file });
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                        if !waited {
                            warn!(lock = %self.path.display(), ?mode, "waiting on store lock");
                            waited = true;
                        }
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(err) => {
                        return Err(RcacheError::storage(format!(
                            "cannot create lock sentinel {}: {err}",
                            sentinel.display()
                        )));
                    }
                }
            }
        }
    }
}

pub use imp::LockGuard;
