//! Run Lock
//!
//! One lock file per mode with exclusive-create semantics, so two
//! scheduler ticks firing together cannot both believe they own the
//! run. A lock older than its mode's timeout is stale and reclaimed
//! transparently. The guard releases on drop, which covers every exit
//! path: normal return, kill-switch abort, or a cancelled future.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::Mode;

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    mode: Mode,
    holder_id: Uuid,
    acquired_at: DateTime<Utc>,
}

/// Factory for per-mode lock guards.
#[derive(Debug, Clone)]
pub struct RunLock {
    dir: PathBuf,
}

impl RunLock {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn lock_path(&self, mode: Mode) -> PathBuf {
        self.dir.join(format!("{}.lock", mode.as_str()))
    }

    /// Try to take the lock for `mode`. `Ok(None)` means a live holder
    /// exists, the normal "another run in progress" outcome, not an
    /// error. A stale lock is reclaimed before acquiring; a lock file
    /// that cannot be parsed and is not old enough to be stale is a
    /// fatal corruption error.
    pub fn acquire(&self, mode: Mode, timeout: Duration) -> Result<Option<LockGuard>> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create lock dir {}", self.dir.display()))?;
        let path = self.lock_path(mode);

        // Two attempts: the second runs only after a stale reclaim, and
        // losing that race to another acquirer is a clean None.
        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let record = LockRecord {
                        mode,
                        holder_id: Uuid::new_v4(),
                        acquired_at: Utc::now(),
                    };
                    file.write_all(serde_json::to_string(&record)?.as_bytes())?;
                    file.flush()?;
                    debug!("Acquired {} lock as {}", mode, record.holder_id);
                    return Ok(Some(LockGuard {
                        path,
                        holder_id: record.holder_id,
                        released: false,
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt > 0 {
                        return Ok(None);
                    }
                    if !self.try_reclaim_stale(&path, timeout)? {
                        return Ok(None);
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to create lock file {}", path.display())
                    });
                }
            }
        }
        Ok(None)
    }

    /// Returns true if the existing lock was stale and removed.
    fn try_reclaim_stale(&self, path: &PathBuf, timeout: Duration) -> Result<bool> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            // Holder released between our create attempt and this read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e).context("failed to read existing lock file"),
        };

        match serde_json::from_str::<LockRecord>(&raw) {
            Ok(record) => {
                let age = Utc::now().signed_duration_since(record.acquired_at);
                if age.to_std().unwrap_or(Duration::ZERO) > timeout {
                    warn!(
                        "Reclaiming stale {} lock held by {} for {}s",
                        record.mode,
                        record.holder_id,
                        age.num_seconds()
                    );
                    remove_if_exists(path)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Err(parse_err) => {
                // Unparseable lock: only reclaim once it is old enough
                // that no live holder can still own it.
                let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
                let old_enough = modified
                    .and_then(|m| m.elapsed().ok())
                    .map(|age| age > timeout)
                    .unwrap_or(false);
                if old_enough {
                    warn!("Removing corrupt, expired lock file {}", path.display());
                    remove_if_exists(path)?;
                    Ok(true)
                } else {
                    bail!(
                        "lock file {} is corrupt and not yet stale: {parse_err}",
                        path.display()
                    );
                }
            }
        }
    }
}

fn remove_if_exists(path: &PathBuf) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context("failed to remove lock file"),
    }
}

/// Held lock. Dropping it releases; `release` is idempotent.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    holder_id: Uuid,
    released: bool,
}

impl LockGuard {
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // Only delete a lock we still own: a reclaimer may have
        // replaced the file after declaring ours stale.
        let ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str::<LockRecord>(&raw).ok())
            .map(|record| record.holder_id == self.holder_id)
            .unwrap_or(false);
        if !ours {
            warn!("Lock at {} no longer ours; leaving it in place", self.path.display());
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {e}", self.path.display());
        } else {
            debug!("Released lock {}", self.path.display());
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(60);

    #[test]
    fn second_acquire_returns_none() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::new(dir.path());

        let guard = lock.acquire(Mode::Observe, TIMEOUT).unwrap();
        assert!(guard.is_some());
        assert!(lock.acquire(Mode::Observe, TIMEOUT).unwrap().is_none());
    }

    #[test]
    fn modes_lock_independently() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::new(dir.path());

        let _observe = lock.acquire(Mode::Observe, TIMEOUT).unwrap().unwrap();
        assert!(lock.acquire(Mode::Guarded, TIMEOUT).unwrap().is_some());
    }

    #[test]
    fn release_allows_reacquire() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::new(dir.path());

        let mut guard = lock.acquire(Mode::Observe, TIMEOUT).unwrap().unwrap();
        guard.release();
        guard.release(); // idempotent
        assert!(lock.acquire(Mode::Observe, TIMEOUT).unwrap().is_some());
    }

    #[test]
    fn drop_releases() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::new(dir.path());

        {
            let _guard = lock.acquire(Mode::Observe, TIMEOUT).unwrap().unwrap();
        }
        assert!(lock.acquire(Mode::Observe, TIMEOUT).unwrap().is_some());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::new(dir.path());
        let path = dir.path().join("observe.lock");

        let stale = LockRecord {
            mode: Mode::Observe,
            holder_id: Uuid::new_v4(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let guard = lock.acquire(Mode::Observe, TIMEOUT).unwrap();
        assert!(guard.is_some());
    }

    #[test]
    fn fresh_corrupt_lock_is_fatal() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::new(dir.path());
        std::fs::write(dir.path().join("observe.lock"), "not json").unwrap();

        assert!(lock.acquire(Mode::Observe, TIMEOUT).is_err());
    }

    #[test]
    fn release_leaves_a_reclaimed_lock_alone() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::new(dir.path());
        let path = dir.path().join("observe.lock");

        let mut guard = lock.acquire(Mode::Observe, TIMEOUT).unwrap().unwrap();
        // Simulate another process reclaiming and re-acquiring.
        let other = LockRecord {
            mode: Mode::Observe,
            holder_id: Uuid::new_v4(),
            acquired_at: Utc::now(),
        };
        std::fs::write(&path, serde_json::to_string(&other).unwrap()).unwrap();

        guard.release();
        assert!(path.exists());
    }
}
