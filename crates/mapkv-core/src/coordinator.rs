//! Process coordinator: two-tier locking around every store operation
//!
//! Layer 1: a `parking_lot::Mutex` serializes threads sharing one handle.
//! Layer 2 (multi-process mode): an advisory `fs2` lock on `<map>.lock`
//! serializes processes sharing one container file. Mutations take it
//! exclusive, reads take it shared.
//!
//! Acquisition order is always mutex, then file lock; release is the reverse.

use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::error::{KvError, KvResult};

/// Whether other processes may open the same container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    SingleProcess,
    MultiProcess,
}

/// Kind of access an operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Suffix appended to a map id to form its lock file name.
pub const LOCK_SUFFIX: &str = ".lock";

/// Inter-process advisory lock backed by a dedicated lock file.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn open(path: &Path) -> KvResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| KvError::io(path, e, "Failed to open lock file"))?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    /// Block until the lock is held in the mode `access` needs.
    pub fn acquire(&self, access: Access) -> KvResult<FileLockGuard<'_>> {
        let result = match access {
            Access::Read => FileExt::lock_shared(&self.file),
            Access::Write => FileExt::lock_exclusive(&self.file),
        };
        result.map_err(|e| KvError::Lock {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        Ok(FileLockGuard { lock: self })
    }

}

/// Releases the file lock on drop.
pub struct FileLockGuard<'a> {
    lock: &'a FileLock,
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock.file) {
            warn!(path = %self.lock.path.display(), "failed to release file lock: {}", e);
        }
    }
}

/// Guards state `T` with the in-process mutex and, optionally, the file lock.
pub struct ProcessCoordinator<T> {
    state: Mutex<T>,
    file_lock: Option<FileLock>,
}

impl<T> ProcessCoordinator<T> {
    pub fn new(state: T, file_lock: Option<FileLock>) -> Self {
        Self { state: Mutex::new(state), file_lock }
    }

    pub fn mode(&self) -> ProcessMode {
        if self.file_lock.is_some() {
            ProcessMode::MultiProcess
        } else {
            ProcessMode::SingleProcess
        }
    }

    /// Lock the state for an operation needing `access`.
    pub fn acquire(&self, access: Access) -> KvResult<CoordinatorGuard<'_, T>> {
        let state = self.state.lock();
        let file_guard = match &self.file_lock {
            Some(lock) => Some(lock.acquire(access)?),
            None => None,
        };
        Ok(CoordinatorGuard { file_guard, state })
    }

    /// Lock the state for handle-local settings that never touch the file.
    pub fn local(&self) -> MutexGuard<'_, T> {
        self.state.lock()
    }

    pub fn into_inner(self) -> T {
        self.state.into_inner()
    }
}

/// Both lock layers, held for the duration of one operation.
pub struct CoordinatorGuard<'a, T> {
    // Fields drop in declaration order: file lock first, then the mutex.
    file_guard: Option<FileLockGuard<'a>>,
    state: MutexGuard<'a, T>,
}

impl<T> CoordinatorGuard<'_, T> {
    #[cfg(test)]
    fn holds_file_lock(&self) -> bool {
        self.file_guard.is_some()
    }
}

impl<T> Deref for CoordinatorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.state
    }
}

impl<T> DerefMut for CoordinatorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.state
    }
}
