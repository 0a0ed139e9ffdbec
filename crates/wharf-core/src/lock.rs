//! Operator lock preventing two rollouts from running against the same
//! fleet concurrently (SPEC_FULL.md §4.12). The lock file lives at
//! `<state_dir>/lock` and holds JSON metadata about the holder (PID,
//! hostname, timestamp, rollout plan ID). Grounded closely on the
//! teacher's `lock.rs`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = "lock";

/// Information stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub plan_id: Option<String>,
}

/// Lock file handle that releases automatically on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquire a lock in `state_dir`. Fails if a lock already exists and
    /// is not stale; use [`LockFile::acquire_with_timeout`] for automatic
    /// stale-lock handling.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        let lock_path = state_dir.join(LOCK_FILE);

        fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

        if lock_path.exists() {
            let existing = Self::read_lock_info(state_dir)?;
            bail!(
                "rollout lock already held by pid {} on {} since {} (plan_id: {:?})",
                existing.pid,
                existing.hostname,
                existing.acquired_at,
                existing.plan_id
            );
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            plan_id: None,
        };

        write_lock_info(&lock_path, &info)?;

        Ok(Self { path: lock_path })
    }

    /// Acquire a lock, removing any existing lock older than `timeout`
    /// (or unreadable) before retrying.
    pub fn acquire_with_timeout(state_dir: &Path, timeout: Duration) -> Result<Self> {
        let lock_path = state_dir.join(LOCK_FILE);

        if lock_path.exists() {
            match Self::read_lock_info(state_dir) {
                Ok(info) => {
                    let age = Utc::now() - info.acquired_at;
                    if age.num_seconds().unsigned_abs() > timeout.as_secs() {
                        fs::remove_file(&lock_path).with_context(|| {
                            format!("failed to remove stale lock file {}", lock_path.display())
                        })?;
                    } else {
                        bail!(
                            "rollout lock already held by pid {} on {} since {} (age: {:?})",
                            info.pid,
                            info.hostname,
                            info.acquired_at,
                            age
                        );
                    }
                }
                Err(_) => {
                    fs::remove_file(&lock_path).with_context(|| {
                        format!("failed to remove corrupt lock file {}", lock_path.display())
                    })?;
                }
            }
        }

        Self::acquire(state_dir)
    }

    /// Release the lock.
    pub fn release(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock file {}", self.path.display()))?;
        }
        Ok(())
    }

    /// Record the rollout plan ID in the lock file, once it is known.
    pub fn set_plan_id(&self, plan_id: &str) -> Result<()> {
        if !self.path.exists() {
            bail!("lock file does not exist at {}", self.path.display());
        }

        let mut info = read_lock_info_from_path(&self.path)?;
        info.plan_id = Some(plan_id.to_string());
        write_lock_info(&self.path, &info)
    }

    /// Whether a lock file exists in `state_dir`.
    pub fn is_locked(state_dir: &Path) -> Result<bool> {
        Ok(state_dir.join(LOCK_FILE).exists())
    }

    /// Read the lock file's metadata.
    pub fn read_lock_info(state_dir: &Path) -> Result<LockInfo> {
        read_lock_info_from_path(&state_dir.join(LOCK_FILE))
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn write_lock_info(path: &Path, info: &LockInfo) -> Result<()> {
    let json = serde_json::to_string_pretty(info).context("failed to serialize lock info")?;
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create lock tmp file {}", tmp_path.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write lock tmp file {}", tmp_path.display()))?;
        file.sync_all().context("failed to sync lock file")?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename lock file to {}", path.display()))?;
    Ok(())
}

fn read_lock_info_from_path(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse lock JSON from {}", path.display()))
}

/// The lock file path for a given state directory.
pub fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join(LOCK_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_path_returns_expected_path() {
        let base = PathBuf::from("x");
        assert_eq!(lock_path(&base), PathBuf::from("x").join(LOCK_FILE));
    }

    #[test]
    fn acquire_creates_lock_file() {
        let td = tempdir().expect("tempdir");
        let mut lock = LockFile::acquire(td.path()).expect("acquire");
        assert!(lock_path(td.path()).exists());
        lock.release().expect("release");
        assert!(!lock_path(td.path()).exists());
    }

    #[test]
    fn acquire_fails_when_locked() {
        let td = tempdir().expect("tempdir");
        let _lock1 = LockFile::acquire(td.path()).expect("first acquire");

        let result = LockFile::acquire(td.path());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("rollout lock already held"));
    }

    #[test]
    fn drop_releases_lock() {
        let td = tempdir().expect("tempdir");
        {
            let _lock = LockFile::acquire(td.path()).expect("acquire");
            assert!(lock_path(td.path()).exists());
        }
        assert!(!lock_path(td.path()).exists());
    }

    #[test]
    fn read_lock_info_returns_correct_info() {
        let td = tempdir().expect("tempdir");
        let _lock = LockFile::acquire(td.path()).expect("acquire");

        let info = LockFile::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.pid, std::process::id());
        assert!(!info.hostname.is_empty());
        assert!(info.plan_id.is_none());
    }

    #[test]
    fn set_plan_id_updates_lock() {
        let td = tempdir().expect("tempdir");
        let lock = LockFile::acquire(td.path()).expect("acquire");

        lock.set_plan_id("rollout-2026-07-29-abcd").expect("set plan_id");

        let info = LockFile::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.plan_id, Some("rollout-2026-07-29-abcd".to_string()));
    }

    #[test]
    fn is_locked_returns_correct_status() {
        let td = tempdir().expect("tempdir");
        assert!(!LockFile::is_locked(td.path()).expect("is_locked"));

        let _lock = LockFile::acquire(td.path()).expect("acquire");
        assert!(LockFile::is_locked(td.path()).expect("is_locked"));
    }

    #[test]
    fn acquire_with_timeout_removes_stale_locks() {
        let td = tempdir().expect("tempdir");

        let lock_path = lock_path(td.path());
        let old_info = LockInfo {
            pid: 12345,
            hostname: "old-operator-host".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            plan_id: None,
        };
        fs::write(&lock_path, serde_json::to_string(&old_info).expect("serialize")).expect("write stale lock");

        let _lock = LockFile::acquire_with_timeout(td.path(), Duration::from_secs(3600)).expect("acquire with timeout");

        let info = LockFile::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.pid, std::process::id());
        assert_ne!(info.pid, 12345);
    }

    #[test]
    fn acquire_with_timeout_fails_on_fresh_lock() {
        let td = tempdir().expect("tempdir");
        let _lock1 = LockFile::acquire(td.path()).expect("first acquire");

        let result = LockFile::acquire_with_timeout(td.path(), Duration::from_secs(3600));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("rollout lock already held"));
    }
}
