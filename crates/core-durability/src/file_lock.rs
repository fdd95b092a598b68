//! File-based locking for shared resources
//!
//! Database locks are awkward across processes (especially SQLite) and
//! distributed locks need infrastructure. Advisory lock files are simple,
//! portable, and sufficient for a single-host deployment, including the
//! out-of-band recovery job.
//!
//! A lock is a file under `.locks/` held via an OS-advisory exclusive lock.
//! The holder's PID is written into the file for diagnostics. Acquisition
//! polls every 100 ms until the timeout expires.
//!
//! # Example
//!
//! ```no_run
//! use lumen_core_durability::FileLock;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), lumen_core_durability::LockError> {
//! let mut lock = FileLock::new("jobs", ".locks")?;
//! lock.acquire(Duration::from_secs(30))?;
//! // ... critical section ...
//! lock.release();
//! # Ok(())
//! # }
//! ```

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Polling interval between acquisition attempts
const CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("could not acquire lock '{name}' within {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("lock file error for '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Cross-process exclusive lock backed by a file under the lock directory.
///
/// The lock is released on [`FileLock::release`] or on drop. Holding the
/// struct holds the open file descriptor, which is what keeps the OS lock.
pub struct FileLock {
    name: String,
    lock_path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    /// Prepare a lock named `<name>.lock` inside `lock_dir` (created if missing)
    pub fn new(name: impl Into<String>, lock_dir: impl AsRef<Path>) -> Result<Self, LockError> {
        let name = name.into();
        let dir = lock_dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|source| LockError::Io {
            name: name.clone(),
            source,
        })?;

        Ok(Self {
            lock_path: dir.join(format!("{}.lock", name)),
            name,
            file: None,
        })
    }

    /// Acquire the lock, polling until `timeout` expires.
    pub fn acquire(&mut self, timeout: Duration) -> Result<(), LockError> {
        if self.file.is_some() {
            warn!(lock = %self.name, "lock already acquired by this handle");
            return Ok(());
        }

        let started = Instant::now();
        debug!(lock = %self.name, timeout_ms = timeout.as_millis() as u64, "attempting to acquire lock");

        loop {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&self.lock_path)
                .map_err(|source| LockError::Io {
                    name: self.name.clone(),
                    source,
                })?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    // Holder PID inside the file is purely diagnostic
                    let mut file = file;
                    let _ = file.set_len(0);
                    let _ = writeln!(file, "{}", std::process::id());
                    let _ = file.flush();

                    info!(
                        lock = %self.name,
                        pid = std::process::id(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "lock acquired"
                    );
                    self.file = Some(file);
                    return Ok(());
                }
                Err(_) => {
                    // Held by another process
                    if started.elapsed() >= timeout {
                        warn!(lock = %self.name, timeout_ms = timeout.as_millis() as u64, "lock acquisition timed out");
                        return Err(LockError::Timeout {
                            name: self.name.clone(),
                            timeout,
                        });
                    }
                    std::thread::sleep(CHECK_INTERVAL);
                }
            }
        }
    }

    /// Release the lock. Returns false when this handle wasn't holding it.
    pub fn release(&mut self) -> bool {
        match self.file.take() {
            Some(file) => {
                if let Err(e) = fs2::FileExt::unlock(&file) {
                    warn!(lock = %self.name, error = %e, "error releasing lock");
                }
                info!(lock = %self.name, pid = std::process::id(), "lock released");
                true
            }
            None => {
                debug!(lock = %self.name, "lock not held, nothing to release");
                false
            }
        }
    }

    /// Does this handle currently hold the lock?
    pub fn is_locked(&self) -> bool {
        self.file.is_some()
    }

    /// Lock name (without the `.lock` suffix)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a closure while holding the lock
    pub fn with_lock<T>(
        &mut self,
        timeout: Duration,
        f: impl FnOnce() -> T,
    ) -> Result<T, LockError> {
        self.acquire(timeout)?;
        let result = f();
        self.release();
        Ok(result)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.file.is_some() {
            self.release();
        }
    }
}

/// Lock guarding job claiming; only one worker claims pending rows at a time
pub struct JobLock(FileLock);

impl JobLock {
    pub fn new(lock_dir: impl AsRef<Path>) -> Result<Self, LockError> {
        Ok(Self(FileLock::new("jobs", lock_dir)?))
    }

    pub fn acquire(&mut self, timeout: Duration) -> Result<(), LockError> {
        self.0.acquire(timeout)
    }

    pub fn release(&mut self) -> bool {
        self.0.release()
    }
}

/// Lock guarding a single pipeline's state transitions
pub struct PipelineLock(FileLock);

impl PipelineLock {
    pub fn new(pipeline_id: i64, lock_dir: impl AsRef<Path>) -> Result<Self, LockError> {
        Ok(Self(FileLock::new(
            format!("pipeline_{}", pipeline_id),
            lock_dir,
        )?))
    }

    pub fn acquire(&mut self, timeout: Duration) -> Result<(), LockError> {
        self.0.acquire(timeout)
    }

    pub fn release(&mut self) -> bool {
        self.0.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = FileLock::new("test", dir.path()).unwrap();

        assert!(!lock.is_locked());
        lock.acquire(Duration::from_secs(1)).unwrap();
        assert!(lock.is_locked());
        assert!(lock.release());
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_lock_file_created_with_pid() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = FileLock::new("pid_check", dir.path()).unwrap();
        lock.acquire(Duration::from_secs(1)).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("pid_check.lock")).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_second_handle_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = FileLock::new("contended", dir.path()).unwrap();
        first.acquire(Duration::from_secs(1)).unwrap();

        let mut second = FileLock::new("contended", dir.path()).unwrap();
        let err = second.acquire(Duration::from_millis(250)).unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[test]
    fn test_release_unblocks_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = FileLock::new("handoff", dir.path()).unwrap();
        first.acquire(Duration::from_secs(1)).unwrap();
        first.release();

        let mut second = FileLock::new("handoff", dir.path()).unwrap();
        second.acquire(Duration::from_millis(250)).unwrap();
        assert!(second.is_locked());
    }

    #[test]
    fn test_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut lock = FileLock::new("dropped", dir.path()).unwrap();
            lock.acquire(Duration::from_secs(1)).unwrap();
        }

        let mut again = FileLock::new("dropped", dir.path()).unwrap();
        again.acquire(Duration::from_millis(250)).unwrap();
    }

    #[test]
    fn test_release_without_acquire_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = FileLock::new("noop", dir.path()).unwrap();
        assert!(!lock.release());
    }

    #[test]
    fn test_with_lock_runs_closure() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = FileLock::new("closure", dir.path()).unwrap();
        let value = lock.with_lock(Duration::from_secs(1), || 41 + 1).unwrap();
        assert_eq!(value, 42);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_specialized_lock_names() {
        let dir = tempfile::tempdir().unwrap();

        let mut job_lock = JobLock::new(dir.path()).unwrap();
        job_lock.acquire(Duration::from_secs(1)).unwrap();
        assert!(dir.path().join("jobs.lock").exists());
        job_lock.release();

        let mut pipe_lock = PipelineLock::new(7, dir.path()).unwrap();
        pipe_lock.acquire(Duration::from_secs(1)).unwrap();
        assert!(dir.path().join("pipeline_7.lock").exists());
    }
}
