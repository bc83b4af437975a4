//! The platform seam.
//!
//! Every privileged call the daemon context makes goes through [`Sys`], so the
//! ordering of those calls can be observed without forking the test runner or
//! closing its descriptors. [`UnixSys`] is the real implementation.

use std::fmt;
use std::io;
use std::ops::Range;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

pub use libc::{c_int, gid_t, pid_t, uid_t};

pub(crate) mod unix;

#[cfg(test)]
pub(crate) mod fake;

pub use unix::UnixSys;

/// Outcome of a `fork()` call, seen from the calling side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    /// This is the parent; the value is the child's process id.
    Parent(pid_t),
    /// This is the newly created child.
    Child,
}

/// Resource limits the daemon context reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Core,
    OpenFiles,
}

/// A soft/hard limit pair. `None` means the platform reports no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimit {
    pub soft: Option<u64>,
    pub hard: Option<u64>,
}

impl ResourceLimit {
    pub const ZERO: ResourceLimit = ResourceLimit {
        soft: Some(0),
        hard: Some(0),
    };
}

/// A disposition as the platform signal facility understands it.
#[derive(Clone)]
pub enum SignalAction {
    Default,
    Ignore,
    /// Run the closure when the signal arrives. The closure is not run in
    /// signal context: [`UnixSys`] calls it from a dispatch thread, so it may
    /// lock, allocate and exit the process.
    Handler(Arc<dyn Fn() + Send + Sync>),
}

impl fmt::Debug for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalAction::Default => f.write_str("Default"),
            SignalAction::Ignore => f.write_str("Ignore"),
            SignalAction::Handler(_) => f.write_str("Handler(Fn)"),
        }
    }
}

/// The OS operations used to daemonize a process.
///
/// Implementations perform exactly one system call per method and report the
/// raw OS error; rewrapping into [`DaemonError`](crate::DaemonError) happens
/// in the callers.
pub trait Sys: Send + Sync + 'static {
    fn fork(&self) -> io::Result<Fork>;
    fn setsid(&self) -> io::Result<()>;
    /// Ends the process at once, skipping exit hooks. Only returns on fakes.
    fn exit_immediately(&self, status: i32);
    /// Ends the process through the normal exit path, running exit hooks.
    /// Only returns on fakes.
    fn exit(&self, status: i32);
    fn parent_pid(&self) -> pid_t;
    fn is_socket(&self, fd: RawFd) -> bool;

    fn chdir(&self, path: &Path) -> io::Result<()>;
    fn chroot(&self, path: &Path) -> io::Result<()>;
    fn umask(&self, mask: u32) -> io::Result<()>;

    fn uid(&self) -> uid_t;
    fn gid(&self) -> gid_t;
    /// Looks up the user database entry for `uid`.
    fn user_name(&self, uid: uid_t) -> Option<String>;
    fn initgroups(&self, user: &str, gid: gid_t) -> io::Result<()>;
    fn setgid(&self, gid: gid_t) -> io::Result<()>;
    fn setuid(&self, uid: uid_t) -> io::Result<()>;

    fn getrlimit(&self, resource: Resource) -> io::Result<ResourceLimit>;
    fn setrlimit(&self, resource: Resource, limit: ResourceLimit) -> io::Result<()>;

    fn close(&self, fd: RawFd) -> io::Result<()>;
    /// Closes every descriptor in `range`. Descriptors that are not open are
    /// skipped.
    fn close_range(&self, range: Range<RawFd>) -> io::Result<()>;
    /// Opens the null device for reading and writing.
    fn open_devnull(&self) -> io::Result<RawFd>;
    fn dup2(&self, src: RawFd, dst: RawFd) -> io::Result<()>;

    fn install_signal(&self, signal: c_int, action: SignalAction) -> io::Result<()>;
    /// Arranges for `hook` to run when the process exits normally.
    fn register_exit_hook(&self, hook: Box<dyn FnOnce() + Send>);
    /// Writes directly to the inherited standard error descriptor.
    fn write_stderr(&self, message: &str);
}
