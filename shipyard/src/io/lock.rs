//! Path-keyed advisory locks with staleness takeover.
//!
//! A lock is a sibling `<file>.lock` created with `create_new`, holding the
//! owner pid, acquisition time and a random token. Acquisition retries with a
//! bounded deadline; a lock whose owner is dead or that is older than the
//! staleness window is taken over.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::io::pid::pid_alive;

/// A lock file that cannot be parsed is treated as stale once it is this old.
/// Covers a crash between `create_new` and writing the owner record.
const UNREADABLE_LOCK_GRACE: Duration = Duration::from_secs(2);
const RETRY_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited_ms}ms waiting for lock {path} (held by pid {holder:?})")]
    Timeout {
        path: PathBuf,
        holder: Option<u32>,
        waited_ms: u128,
    },
    #[error("lock i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Owner record stored inside a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    pub stale_after: Duration,
    pub timeout: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Why an existing lock may be taken over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    OwnerDead,
    Expired,
    Unreadable,
}

impl Staleness {
    pub fn is_stale(self) -> bool {
        self != Staleness::Fresh
    }
}

/// `<path>.lock`
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
    token: String,
}

impl FileLock {
    /// Acquire the lock guarding `target`.
    pub fn acquire(target: &Path, settings: LockSettings) -> Result<FileLock, LockError> {
        let lock_path = lock_path_for(target);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let started = Instant::now();
        let token = Uuid::new_v4().to_string();
        loop {
            match try_create(&lock_path, &token) {
                Ok(()) => {
                    debug!(lock = %lock_path.display(), "lock acquired");
                    return Ok(FileLock { lock_path, token });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => {
                    return Err(LockError::Io {
                        path: lock_path,
                        source,
                    });
                }
            }

            let (staleness, seen) = inspect(&lock_path, settings.stale_after);
            let holder = seen.as_ref().map(|info| info.pid);
            if staleness.is_stale() {
                warn!(lock = %lock_path.display(), ?staleness, holder, "taking over stale lock");
                let broken = break_lock(&lock_path, seen.as_ref()).map_err(|source| {
                    LockError::Io {
                        path: lock_path.clone(),
                        source,
                    }
                })?;
                if broken {
                    continue;
                }
            }

            if started.elapsed() >= settings.timeout {
                return Err(LockError::Timeout {
                    path: lock_path,
                    holder,
                    waited_ms: started.elapsed().as_millis(),
                });
            }
            thread::sleep(RETRY_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Only remove the file if we still own it (it may have been taken over).
        match read_info(&self.lock_path) {
            Ok(info) if info.token == self.token => {
                if let Err(err) = fs::remove_file(&self.lock_path) {
                    warn!(lock = %self.lock_path.display(), err = %err, "failed to release lock");
                }
            }
            _ => debug!(lock = %self.lock_path.display(), "lock no longer ours"),
        }
    }
}

fn try_create(lock_path: &Path, token: &str) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;
    let info = LockInfo {
        pid: std::process::id(),
        acquired_at: Utc::now(),
        token: token.to_string(),
    };
    let body = serde_json::to_vec(&info).map_err(io::Error::other)?;
    file.write_all(&body)?;
    file.sync_all()
}

fn read_info(lock_path: &Path) -> io::Result<LockInfo> {
    let raw = fs::read(lock_path)?;
    serde_json::from_slice(&raw).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Classify an existing lock file. Returns the owner record when readable.
pub fn inspect(lock_path: &Path, stale_after: Duration) -> (Staleness, Option<LockInfo>) {
    match read_info(lock_path) {
        Ok(info) => {
            if !pid_alive(info.pid) {
                return (Staleness::OwnerDead, Some(info));
            }
            let age = Utc::now()
                .signed_duration_since(info.acquired_at)
                .to_std()
                .unwrap_or_default();
            if age > stale_after {
                (Staleness::Expired, Some(info))
            } else {
                (Staleness::Fresh, Some(info))
            }
        }
        // Vanished between create_new and read: let the caller retry.
        Err(err) if err.kind() == io::ErrorKind::NotFound => (Staleness::Fresh, None),
        Err(_) if file_age(lock_path) > UNREADABLE_LOCK_GRACE => (Staleness::Unreadable, None),
        Err(_) => (Staleness::Fresh, None),
    }
}

fn file_age(path: &Path) -> Duration {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default()
}

/// Remove the stale lock described by `seen`.
///
/// The file is moved aside first and compared with `seen`; a lock that
/// changed hands since it was inspected is put back and `false` returned.
fn break_lock(lock_path: &Path, seen: Option<&LockInfo>) -> io::Result<bool> {
    let mut aside = lock_path.as_os_str().to_os_string();
    aside.push(format!(".stale-{}", Uuid::new_v4()));
    let aside = PathBuf::from(aside);
    match fs::rename(lock_path, &aside) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    }

    let same = match (seen, read_info(&aside)) {
        (Some(seen), Ok(moved)) => moved.token == seen.token,
        (None, Err(_)) => file_age(&aside) > UNREADABLE_LOCK_GRACE,
        _ => false,
    };
    if same {
        fs::remove_file(&aside)?;
        return Ok(true);
    }

    // hard_link never replaces a lock created in the meantime.
    match fs::hard_link(&aside, lock_path) {
        Ok(()) => debug!(lock = %lock_path.display(), "lock changed hands; restored"),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            warn!(lock = %lock_path.display(), "lock changed hands twice; dropping the moved copy");
        }
        Err(err) => return Err(err),
    }
    fs::remove_file(&aside)?;
    Ok(false)
}

/// Remove `lock_path` if it is still stale right now. Returns whether a lock
/// was removed.
pub fn remove_stale_lock(lock_path: &Path, stale_after: Duration) -> io::Result<bool> {
    let (staleness, seen) = inspect(lock_path, stale_after);
    if !staleness.is_stale() {
        return Ok(false);
    }
    break_lock(lock_path, seen.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let pid = child.id();
        child.wait().expect("wait");
        pid
    }

    fn write_lock(path: &Path, pid: u32, acquired_at: DateTime<Utc>) -> LockInfo {
        let info = LockInfo {
            pid,
            acquired_at,
            token: Uuid::new_v4().to_string(),
        };
        fs::write(lock_path_for(path), serde_json::to_vec(&info).expect("json")).expect("write");
        info
    }

    #[test]
    fn acquire_and_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("item.json");
        {
            let lock = FileLock::acquire(&target, LockSettings::default()).expect("acquire");
            assert!(lock.path().exists());
        }
        assert!(!lock_path_for(&target).exists(), "released on drop");
    }

    #[test]
    fn live_lock_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("item.json");
        let _held = FileLock::acquire(&target, LockSettings::default()).expect("acquire");
        let settings = LockSettings {
            stale_after: Duration::from_secs(60),
            timeout: Duration::from_millis(100),
        };
        let err = FileLock::acquire(&target, settings).expect_err("should time out");
        assert!(matches!(err, LockError::Timeout { holder: Some(pid), .. } if pid == std::process::id()));
    }

    /// A lock past the staleness window whose owner is dead is taken over.
    #[test]
    fn stale_lock_with_dead_owner_is_taken_over() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("item.json");
        write_lock(&target, dead_pid(), Utc::now() - chrono::Duration::minutes(10));

        let lock = FileLock::acquire(&target, LockSettings::default()).expect("takeover");
        let info = read_info(lock.path()).expect("info");
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn expired_lock_with_live_owner_is_stale() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("x.json");
        write_lock(&target, std::process::id(), Utc::now() - chrono::Duration::minutes(5));
        let (staleness, seen) = inspect(&lock_path_for(&target), Duration::from_secs(60));
        assert_eq!(staleness, Staleness::Expired);
        assert_eq!(seen.map(|info| info.pid), Some(std::process::id()));
    }

    /// A stale lock replaced by a live writer after inspection survives the
    /// takeover attempt.
    #[test]
    fn lock_that_changed_hands_is_restored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("item.json");
        let stale = write_lock(&target, dead_pid(), Utc::now() - chrono::Duration::minutes(10));
        let (staleness, seen) = inspect(&lock_path_for(&target), Duration::from_secs(60));
        assert!(staleness.is_stale());
        assert_eq!(seen.as_ref(), Some(&stale));

        let live = write_lock(&target, std::process::id(), Utc::now());
        let broken = break_lock(&lock_path_for(&target), seen.as_ref()).expect("break");
        assert!(!broken);
        assert_eq!(read_info(&lock_path_for(&target)).expect("still held"), live);
        let leftovers = fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(leftovers, 1, "moved copy is cleaned up");
    }

    #[test]
    fn remove_stale_lock_leaves_fresh_locks_alone() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("item.json");
        let _held = FileLock::acquire(&target, LockSettings::default()).expect("acquire");
        let removed =
            remove_stale_lock(&lock_path_for(&target), Duration::from_secs(60)).expect("remove");
        assert!(!removed);
        assert!(lock_path_for(&target).exists());

        let other = temp.path().join("other.json");
        write_lock(&other, dead_pid(), Utc::now());
        let removed =
            remove_stale_lock(&lock_path_for(&other), Duration::from_secs(60)).expect("remove");
        assert!(removed);
        assert!(!lock_path_for(&other).exists());
    }
}
