use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Advisory file lock guarding one instance's lifecycle operations.
///
/// The lock is an OS-level exclusive lock on `<temp-dir>/<instance-name>.lock`,
/// so a holder that dies releases it automatically and a leftover lock file on
/// disk carries no state of its own.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquires the lock without blocking. Returns `Error::LockUnavailable`
    /// when another holder has it.
    pub fn try_acquire(&self) -> Result<LockGuard> {
        let file = self.open()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(LockGuard {
                file,
                path: self.path.clone(),
            }),
            Err(err) if is_contended(&err) => Err(Error::LockUnavailable {
                path: self.path.clone(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Acquires the lock, polling until `timeout` elapses. Returns
    /// `Error::LockUnavailable` if the holder never released it in time.
    pub fn acquire(&self, timeout: Duration) -> Result<LockGuard> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_acquire() {
                Ok(guard) => return Ok(guard),
                Err(Error::LockUnavailable { .. }) if Instant::now() < deadline => {
                    debug!(
                        target: "avdctl",
                        "lock {} is busy, waiting",
                        self.path.display()
                    );
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        Ok(file)
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Holds the lock for its lifetime; dropping it releases the lock even when
/// the owning operation bails out early.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            warn!(
                target: "avdctl",
                "failed to release lock {}: {}",
                self.path.display(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn exclusive_between_handles() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("local-instance-1.lock");
        let first = InstanceLock::new(&path);
        let second = InstanceLock::new(&path);

        let guard = first.try_acquire().unwrap();
        match second.try_acquire() {
            Err(Error::LockUnavailable { path: busy }) => assert_eq!(busy, path),
            other => panic!("expected LockUnavailable, got {other:?}"),
        }

        drop(guard);
        second.try_acquire().unwrap();
    }

    #[test]
    fn different_instances_do_not_interfere() {
        let temp = TempDir::new().unwrap();
        let one = InstanceLock::new(temp.path().join("local-instance-1.lock"));
        let two = InstanceLock::new(temp.path().join("local-instance-2.lock"));

        let _guard = one.try_acquire().unwrap();
        two.try_acquire().unwrap();
    }

    #[test]
    fn acquire_times_out_while_held() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("local-instance-3.lock");
        let holder = InstanceLock::new(&path);
        let _guard = holder.try_acquire().unwrap();

        let waiter = InstanceLock::new(&path);
        let started = Instant::now();
        match waiter.acquire(Duration::from_millis(300)) {
            Err(Error::LockUnavailable { .. }) => {}
            other => panic!("expected LockUnavailable, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn acquire_succeeds_after_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("local-instance-4.lock");
        let holder = InstanceLock::new(&path);
        let guard = holder.try_acquire().unwrap();
        drop(guard);

        let waiter = InstanceLock::new(&path);
        waiter.acquire(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn creates_missing_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("deep/nested/local-instance-5.lock");
        let lock = InstanceLock::new(&path);
        let _guard = lock.try_acquire().unwrap();
        assert!(path.is_file());
    }
}
