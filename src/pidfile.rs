use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{DaemonError, DaemonResult};

/// A PID file guarded by a mutual-exclusion lock.
///
/// The daemon context acquires the lock once it is fully detached and
/// releases it on close. Staleness and the on-disk format are the
/// implementation's business.
pub trait PidLock: Send {
    fn path(&self) -> &Path;
    fn acquire(&mut self) -> DaemonResult<()>;
    fn release(&mut self) -> io::Result<()>;
}

/// A PID file locked with `flock(2)` that records the daemon's pid.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: Option<File>,
}

impl PidFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        PidFile {
            path: path.into(),
            file: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.file.is_some()
    }

    /// Only `EWOULDBLOCK` means another instance holds the lock.
    fn lock_failure(&self, err: io::Error) -> DaemonError {
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            DaemonError::TargetLocked {
                path: self.path.clone(),
            }
        } else {
            DaemonError::Io(err)
        }
    }
}

/// Takes an exclusive lock without waiting for a running instance.
fn lock_exclusive(file: &File) -> io::Result<()> {
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl PidLock for PidFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn acquire(&mut self) -> DaemonResult<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        lock_exclusive(&file).map_err(|err| self.lock_failure(err))?;

        // Only truncate once the lock is ours, or a running daemon's pid
        // would be wiped by a losing contender.
        file.set_len(0)?;
        let pid = std::process::id();
        writeln!(file, "{pid}")?;
        file.sync_all()?;
        debug!(path = %self.path.display(), pid, "PID file locked");
        self.file = Some(file);
        Ok(())
    }

    fn release(&mut self) -> io::Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        // Remove before unlocking so no contender locks a file about to vanish.
        let removed = fs::remove_file(&self.path);
        drop(file);
        removed
    }
}
