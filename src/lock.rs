//! Advisory single-instance lock for polling daemons.
//!
//! The lock file is held with an exclusive non-blocking `flock` for the life
//! of the process and carries the owner's pid for operators. The kernel drops
//! the `flock` when its holder dies, so a file left behind by an unclean
//! shutdown never blocks the next starter, and two starters racing over such a
//! file cannot both win. The file is unlinked on drop while still locked; a
//! starter that opened the old inode notices the path moved on and retries.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::VaultError;

/// Open-lock-verify rounds before giving up on a path that keeps changing
const ACQUIRE_ROUNDS: usize = 3;

#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: File,
}

impl InstanceLock {
    /// Take the lock or fail with [`VaultError::Locked`] if another holder has it
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| VaultError::io(parent, e))?;
        }

        for _ in 0..ACQUIRE_ROUNDS {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| VaultError::io(&path, e))?;
            if !try_lock_exclusive(&file).map_err(|e| VaultError::io(&path, e))? {
                return Err(VaultError::Locked(path));
            }
            // The previous holder unlinked the path between our open and lock
            if !same_file(&file, &path) {
                continue;
            }

            if let Some(pid) = read_owner(&path) {
                if pid != std::process::id() && !process_alive(pid) {
                    warn!(lock = %path.display(), stale_pid = pid, "reclaiming stale lock");
                }
            }
            write_owner(&mut file).map_err(|e| VaultError::io(&path, e))?;
            info!(lock = %path.display(), pid = std::process::id(), "instance lock acquired");
            return Ok(Self { path, file });
        }
        Err(VaultError::Locked(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Unlink before the descriptor closes, and only our own inode
        if same_file(&self.file, &self.path) {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(lock = %self.path.display(), error = %e, "failed to release lock");
            }
        }
    }
}

fn write_owner(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()
}

fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor belongs to `file`, which outlives the call
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}

/// Whether `path` still names the inode behind `file`
#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), fs::metadata(path)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}

/// Liveness probe via `kill(pid, 0)`
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lockfiles/orchestrator.lock");

        let lock = InstanceLock::acquire(&path).unwrap();
        assert!(path.exists());
        assert!(matches!(
            InstanceLock::acquire(&path),
            Err(VaultError::Locked(_))
        ));

        drop(lock);
        assert!(!path.exists());
        assert!(InstanceLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watcher.lock");
        // Far above any realistic pid_max
        fs::write(&path, "999999999\n").unwrap();

        let lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_owner(lock.path()), Some(std::process::id()));
    }

    #[test]
    fn test_garbage_lock_reclaimed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watcher.lock");
        fs::write(&path, "not a pid").unwrap();
        assert!(InstanceLock::acquire(&path).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(999_999_999));
    }

    #[cfg(unix)]
    #[test]
    fn test_concurrent_takeover_of_stale_lock_has_one_winner() {
        use std::sync::{Arc, Barrier};

        let dir = tempdir().unwrap();
        let path = dir.path().join("orchestrator.lock");
        fs::write(&path, "999999999\n").unwrap();

        let starters = 8;
        let barrier = Arc::new(Barrier::new(starters));
        let handles: Vec<_> = (0..starters)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let path = path.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    InstanceLock::acquire(&path).ok()
                })
            })
            .collect();
        let held: Vec<InstanceLock> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(held.len(), 1);
        assert_eq!(read_owner(&path), Some(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_holder_keeps_lock_after_failed_takeover() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orchestrator.lock");
        fs::write(&path, "999999999\n").unwrap();

        let first = InstanceLock::acquire(&path).unwrap();
        assert!(matches!(
            InstanceLock::acquire(&path),
            Err(VaultError::Locked(_))
        ));
        assert!(path.exists());
        drop(first);
        assert!(!path.exists());
    }
}
