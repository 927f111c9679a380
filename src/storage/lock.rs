//! # Cooperative File Locks and the Open Registry
//!
//! Cross-process access is coordinated with advisory byte-range locks on
//! two bytes inside the header's reserved area:
//!
//! ```text
//!              byte A (52)      byte E (53)
//! Read         —                shared
//! Append       exclusive        shared
//! Exclusive    exclusive        exclusive
//! ```
//!
//! Readers coexist with one appender (appending only adds or modifies,
//! never deletes, so reader state stays valid); Exclusive — required by
//! anything that frees or truncates — excludes everyone. Byte A is always
//! taken before byte E, so lock upgrades cannot deadlock against each
//! other.
//!
//! On unix the locks are `fcntl(F_SETLK/F_SETLKW)` ranges. `fcntl` locks
//! are process-granular: a second descriptor in the same process would
//! silently pass, and closing *any* descriptor for the file drops them.
//! Both hazards are closed by (a) keeping exactly one descriptor per
//! store instance and (b) the `OpenRegistry`, which allows one live
//! instance per canonical path per process. On non-unix targets the
//! fallback is a whole-file `fs4` lock, which degrades Read+Append
//! coexistence to mutual exclusion but stays safe.
//!
//! Open-time acquisition is non-blocking — a held lock is a fatal
//! `ConcurrencyViolation` — while transaction-time escalation blocks, as
//! does the recovery path waiting out another process's rollback.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use eyre::Result;
use parking_lot::Mutex;

use crate::error::StoreError;

/// Cooperative lock levels, ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    /// Shared read access.
    Read,
    /// Exclusive write access that only adds or modifies, never deletes.
    Append,
    /// Required for free/truncate, which can invalidate reader state.
    Exclusive,
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub const BYTE_A: i64 = 52;
    pub const BYTE_E: i64 = 53;

    fn fcntl_lock(file: &File, byte: i64, kind: libc::c_short, wait: bool) -> io::Result<()> {
        let lock = libc::flock {
            l_type: kind,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: byte as libc::off_t,
            l_len: 1,
            l_pid: 0,
        };
        let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
        // SAFETY: plain fcntl locking call; `lock` is a valid flock struct
        // and the fd is owned by `file` for the duration of the call.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &lock) };
        if rc == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn lock_shared(file: &File, byte: i64, wait: bool) -> io::Result<()> {
        fcntl_lock(file, byte, libc::F_RDLCK as libc::c_short, wait)
    }

    pub fn lock_exclusive(file: &File, byte: i64, wait: bool) -> io::Result<()> {
        fcntl_lock(file, byte, libc::F_WRLCK as libc::c_short, wait)
    }

    pub fn unlock(file: &File, byte: i64) -> io::Result<()> {
        fcntl_lock(file, byte, libc::F_UNLCK as libc::c_short, true)
    }
}

#[cfg(unix)]
fn apply_mode(file: &File, mode: LockMode, wait: bool) -> std::io::Result<()> {
    use sys::{BYTE_A, BYTE_E};
    match mode {
        LockMode::Read => {
            sys::unlock(file, BYTE_A)?;
            sys::lock_shared(file, BYTE_E, wait)
        }
        LockMode::Append => {
            sys::lock_exclusive(file, BYTE_A, wait)?;
            sys::lock_shared(file, BYTE_E, wait)
        }
        LockMode::Exclusive => {
            sys::lock_exclusive(file, BYTE_A, wait)?;
            sys::lock_exclusive(file, BYTE_E, wait)
        }
    }
}

#[cfg(unix)]
fn release_all(file: &File) -> std::io::Result<()> {
    sys::unlock(file, sys::BYTE_A)?;
    sys::unlock(file, sys::BYTE_E)
}

#[cfg(not(unix))]
fn apply_mode(file: &File, mode: LockMode, wait: bool) -> std::io::Result<()> {
    use fs4::FileExt;
    // Whole-file fallback: stricter than the byte-range scheme (Read and
    // Append exclude each other) but never weaker.
    file.unlock()?;
    match (mode, wait) {
        (LockMode::Read, true) => file.lock_shared(),
        (LockMode::Read, false) => file.try_lock_shared(),
        (_, true) => file.lock_exclusive(),
        (_, false) => file.try_lock_exclusive(),
    }
}

#[cfg(not(unix))]
fn release_all(file: &File) -> std::io::Result<()> {
    use fs4::FileExt;
    file.unlock()
}

/// The lock state a store instance holds on its backing file.
#[derive(Debug)]
pub(crate) struct StoreLock {
    held: LockMode,
}

impl StoreLock {
    /// Non-blocking acquisition for open time: a conflict is a fatal
    /// `ConcurrencyViolation`.
    pub fn acquire(file: &File, path: &Path, mode: LockMode) -> Result<Self> {
        apply_mode(file, mode, false).map_err(|e| {
            StoreError::concurrency(path, format!("{:?} lock already held elsewhere ({})", mode, e))
        })?;
        Ok(Self { held: mode })
    }

    pub fn held(&self) -> LockMode {
        self.held
    }

    /// Blocking escalation to `mode`; a no-op when the held mode is
    /// already at least as strong.
    pub fn escalate(&mut self, file: &File, path: &Path, mode: LockMode) -> Result<()> {
        if mode <= self.held {
            return Ok(());
        }
        apply_mode(file, mode, true).map_err(|e| {
            eyre::Report::new(e).wrap_err(format!(
                "failed to escalate lock on '{}' to {:?}",
                path.display(),
                mode
            ))
        })?;
        self.held = mode;
        Ok(())
    }

    /// Blocking downgrade back to `mode` after a transaction ends.
    pub fn downgrade(&mut self, file: &File, path: &Path, mode: LockMode) -> Result<()> {
        if mode >= self.held {
            return Ok(());
        }
        apply_mode(file, mode, true).map_err(|e| {
            eyre::Report::new(e).wrap_err(format!(
                "failed to downgrade lock on '{}' to {:?}",
                path.display(),
                mode
            ))
        })?;
        self.held = mode;
        Ok(())
    }

    pub fn release(&mut self, file: &File) {
        let _ = release_all(file);
    }
}

/// Process-wide set of open store paths. The lock primitive is
/// process-granular, not thread-granular, so a second in-process instance
/// could corrupt state despite "holding a lock" — one live instance per
/// path is the rule. Injected through the builder to stay testable; the
/// default is one registry for the whole process.
#[derive(Debug, Default)]
pub struct OpenRegistry {
    paths: Mutex<HashSet<PathBuf>>,
}

impl OpenRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-global registry used when none is injected.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<OpenRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(OpenRegistry::new).clone()
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        canonical: PathBuf,
    ) -> std::result::Result<RegistryGuard, StoreError> {
        let mut paths = self.paths.lock();
        if !paths.insert(canonical.clone()) {
            return Err(StoreError::concurrency(
                canonical,
                "another instance in this process already has the store open",
            ));
        }
        Ok(RegistryGuard {
            registry: Arc::clone(self),
            canonical,
        })
    }

    pub fn is_open(&self, canonical: &Path) -> bool {
        self.paths.lock().contains(canonical)
    }
}

/// Releases the path slot when the owning store closes or is dropped.
#[derive(Debug)]
pub(crate) struct RegistryGuard {
    registry: Arc<OpenRegistry>,
    canonical: PathBuf,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.paths.lock().remove(&self.canonical);
    }
}
