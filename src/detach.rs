use std::os::unix::io::RawFd;

use tracing::{debug, error};

use crate::error::{DaemonError, DaemonResult};
use crate::sys::{Fork, Sys};

/// Which process of the double fork is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The process that asked to be daemonized.
    Original,
    /// The session leader created by the first fork.
    Intermediate,
    /// The grandchild that survives as the daemon.
    Daemon,
}

/// Outcome of [`detach_process_context`] in the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// This process is the daemon and should carry on.
    Daemon,
    /// This process has exited with status 0. Seen only when the platform's
    /// exit returns, as a test platform does.
    Exited(Role),
    /// The second fork failed after the original process had exited. The
    /// failure was reported on standard error and this process carries on as
    /// a session leader.
    Degraded,
}

/// Detaches the process from its controlling terminal with a double fork.
///
/// The first fork lets the original process return to its caller's shell;
/// `setsid()` makes the child a session leader without a terminal; the second
/// fork ensures the daemon is not a session leader and so can never acquire a
/// controlling terminal again.
pub fn detach_process_context<S: Sys + ?Sized>(sys: &S) -> DaemonResult<Detached> {
    let mut role = Role::Original;
    loop {
        let fork = sys.fork();
        match (role, fork) {
            (Role::Original, Err(e)) => {
                return Err(DaemonError::detach("Failed to fork first child", e));
            }
            (_, Err(e)) => {
                // Nobody is left to receive an error: the original process
                // has already exited.
                error!(error = %e, "second fork failed, daemon stays a session leader");
                sys.write_stderr(&format!("Failed to fork second child ({e})\n"));
                return Ok(Detached::Degraded);
            }
            (current, Ok(Fork::Parent(child))) => {
                debug!(?current, child, "exiting fork parent");
                sys.exit_immediately(0);
                return Ok(Detached::Exited(current));
            }
            (Role::Original, Ok(Fork::Child)) => {
                sys.setsid()
                    .map_err(|e| DaemonError::detach("Failed to create new session", e))?;
                role = Role::Intermediate;
            }
            (_, Ok(Fork::Child)) => return Ok(Detached::Daemon),
        }
    }
}

/// Whether the parent of this process is `init`.
pub fn is_process_started_by_init<S: Sys + ?Sized>(sys: &S) -> bool {
    sys.parent_pid() == 1
}

/// Whether the descriptor refers to a socket.
pub fn is_socket<S: Sys + ?Sized>(sys: &S, fd: RawFd) -> bool {
    sys.is_socket(fd)
}

/// Whether this process was started by a super-server such as `inetd`, which
/// hands over a connected socket as standard input.
pub fn is_process_started_by_superserver<S: Sys + ?Sized>(sys: &S) -> bool {
    is_socket(sys, libc::STDIN_FILENO)
}

/// Whether a double fork is needed to become a daemon.
///
/// A process started by `init` or by a super-server is already detached from
/// any terminal.
pub fn is_detach_process_context_required<S: Sys + ?Sized>(sys: &S) -> bool {
    !(is_process_started_by_init(sys) || is_process_started_by_superserver(sys))
}
