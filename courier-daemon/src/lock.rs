//! Exclusive single-instance lock.
//!
//! A pid file created with `O_EXCL` guards against two daemons sharing
//! one store and socket. A leftover file from a dead process is detected
//! by probing `/proc/<pid>` and recovered automatically.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Lock acquisition errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another live daemon instance holds the lock.
    #[error("another instance is already running (pid {pid})")]
    AlreadyRunning {
        /// Pid recorded in the lock file.
        pid: u32,
    },

    /// The lock file could not be created or inspected.
    #[error("lock i/o error: {0}")]
    Io(String),
}

/// Held exclusive instance lock; released (and the pid file removed) on
/// drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock at `path`, recovering a stale pid file if its
    /// owner is gone.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        match Self::try_create(path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match Self::holder_pid(path) {
                    Some(pid) if process_alive(pid) => Err(LockError::AlreadyRunning { pid }),
                    _ => {
                        tracing::info!(?path, "removing stale lock file");
                        std::fs::remove_file(path).map_err(|e| LockError::Io(e.to_string()))?;
                        Self::try_create(path).map_err(|e| LockError::Io(e.to_string()))
                    }
                }
            }
            Err(e) => Err(LockError::Io(e.to_string())),
        }
    }

    fn try_create(path: &Path) -> Result<Self, std::io::Error> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        write!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn holder_pid(path: &Path) -> Option<u32> {
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to remove lock file: {e}");
        }
    }
}

fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");

        let lock = InstanceLock::acquire(&path).unwrap();
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");

        let _held = InstanceLock::acquire(&path).unwrap();
        match InstanceLock::acquire(&path) {
            Err(LockError::AlreadyRunning { pid }) => {
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn stale_lock_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");

        // A pid that cannot be a live process on Linux.
        std::fs::write(&path, "4194399").unwrap();
        let lock = InstanceLock::acquire(&path).unwrap();
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn garbage_lock_file_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");

        std::fs::write(&path, "not a pid").unwrap();
        let _lock = InstanceLock::acquire(&path).unwrap();
    }
}
