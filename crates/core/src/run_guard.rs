use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::logger;
use crate::platform::process::SysProcesses;

static ACTIVE: AtomicBool = AtomicBool::new(false);

/// At most one run per process and per machine. Released on drop.
#[derive(Debug)]
pub struct RunGuard {
    lock_path: PathBuf,
}

impl RunGuard {
    /// `None` when another run holds the in-process flag or a live lock file.
    pub fn try_acquire(lock_path: &Path) -> Option<RunGuard> {
        if ACTIVE.swap(true, Ordering::SeqCst) {
            logger::warn_p("runner", "a run is already active in this process, skipping");
            return None;
        }
        if let Some(parent) = lock_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                logger::error_p("runner", &format!("cannot create {}: {}", parent.display(), e));
                ACTIVE.store(false, Ordering::SeqCst);
                return None;
            }
        }
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(lock_path) {
                Ok(mut file) => {
                    if let Err(e) = write!(file, "{}", std::process::id()) {
                        logger::warn_p("runner", &format!("writing lock pid failed: {}", e));
                    }
                    return Some(RunGuard { lock_path: lock_path.to_path_buf() });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !Self::is_stale(lock_path) {
                        break;
                    }
                    logger::warn_p("runner", &format!("removing stale lock {}", lock_path.display()));
                    if fs::remove_file(lock_path).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    logger::error_p("runner", &format!("cannot create lock {}: {}", lock_path.display(), e));
                    break;
                }
            }
        }
        logger::warn_p("runner", &format!("another run holds {}, skipping", lock_path.display()));
        ACTIVE.store(false, Ordering::SeqCst);
        None
    }

    fn is_stale(lock_path: &Path) -> bool {
        let Ok(text) = fs::read_to_string(lock_path) else {
            return false;
        };
        match text.trim().parse::<u32>() {
            Ok(pid) => !SysProcesses::pid_alive(pid),
            Err(_) => true,
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            logger::warn_p("runner", &format!("removing lock {} failed: {}", self.lock_path.display(), e));
        }
        ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Cooperative cancellation: the run stops between accounts once this file exists.
#[derive(Debug, Clone)]
pub struct StopFlag {
    path: PathBuf,
}

impl StopFlag {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }

    pub fn is_set(&self) -> bool {
        self.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test so the process-wide flag is never contended.
    #[test]
    fn guard_is_exclusive_and_recovers_stale_locks() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("logs/run.lock");

        let guard = RunGuard::try_acquire(&lock).unwrap();
        assert_eq!(fs::read_to_string(&lock).unwrap(), std::process::id().to_string());
        assert!(RunGuard::try_acquire(&lock).is_none());
        drop(guard);
        assert!(!lock.exists());

        fs::write(&lock, std::process::id().to_string()).unwrap();
        assert!(RunGuard::try_acquire(&lock).is_none());
        assert!(lock.exists());

        fs::write(&lock, "not-a-pid").unwrap();
        let guard = RunGuard::try_acquire(&lock).unwrap();
        drop(guard);
        assert!(RunGuard::try_acquire(&lock).is_some());
    }

    #[test]
    fn stop_flag_tracks_file_presence() {
        let dir = tempfile::tempdir().unwrap();
        let flag = StopFlag::new(&dir.path().join("stop.flag"));
        assert!(!flag.is_set());
        fs::write(dir.path().join("stop.flag"), "").unwrap();
        assert!(flag.is_set());
    }
}
