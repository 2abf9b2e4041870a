//! Single-instance lock for the backend daemon.
//!
//! The lock is a marker file containing the owner's PID, created with
//! exclusive-create semantics. A second daemon finding the marker probes the
//! recorded PID: a live owner means acquisition fails (the caller should exit
//! cleanly, status zero); a dead or unreadable marker is reclaimed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Held instance lock. Removes its marker on [`release`](Self::release) or
/// when dropped.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    held: bool,
}

impl InstanceLock {
    /// Attempt to acquire the lock at `path`.
    ///
    /// Returns `Ok(None)` when another live process owns the marker: the
    /// designed way a second launch detects the incumbent, not an error.
    /// A marker left by a dead process (or one that cannot be parsed) is
    /// deleted and acquisition is retried once.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if Self::try_create(&path)? {
            return Ok(Some(Self { path, held: true }));
        }

        match read_owner_pid(&path) {
            Some(pid) if process_alive(pid) => {
                tracing::debug!(pid, path = %path.display(), "Instance lock held by live process");
                return Ok(None);
            }
            Some(pid) => {
                tracing::info!(pid, path = %path.display(), "Reclaiming lock from dead process");
            }
            None => {
                tracing::warn!(path = %path.display(), "Reclaiming unreadable lock marker");
            }
        }

        // Stale or corrupt: remove and retry exactly once. Losing the retry
        // race to another reclaimer is still ordinary contention.
        let _ = std::fs::remove_file(&path);
        if Self::try_create(&path)? {
            Ok(Some(Self { path, held: true }))
        } else {
            Ok(None)
        }
    }

    /// Exclusive-create the marker with our PID. `Ok(false)` means it
    /// already exists.
    fn try_create(path: &Path) -> Result<bool> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                write!(file, "{}", std::process::id())?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Release the lock and remove the marker. Idempotent.
    pub fn release(&mut self) {
        if self.held {
            self.held = false;
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(error = %e, path = %self.path.display(), "Failed to remove lock marker");
                }
            }
        }
    }

    /// Path of the marker file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Read the PID recorded in a marker file. `None` for unreadable or
/// unparseable content (treated as stale by the caller).
fn read_owner_pid(path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse().ok()
}

/// Zero-signal liveness probe.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // kill(pid, 0) delivers no signal; EPERM still proves the PID is live.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
fn process_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) };
    if handle.is_null() {
        return false;
    }
    unsafe { CloseHandle(handle) };
    true
}
