use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::{DaemonError, DaemonResult};
use crate::sys::Sys;

/// Where one of the standard streams (stdin, stdout, stderr) is redirected.
#[derive(Debug, Default)]
pub enum Stdio {
    /// Redirects the stream to `/dev/null`. Default option.
    #[default]
    Devnull,
    /// Redirects the stream to the specified file.
    RedirectToFile(File),
    /// Redirects the stream to a descriptor the caller keeps open.
    RedirectToFd(RawFd),
}

impl Stdio {
    /// Creates a configuration that discards all output.
    pub fn devnull() -> Self {
        Stdio::Devnull
    }

    /// The descriptor of the redirection target, if it has one.
    pub fn fileno(&self) -> Option<RawFd> {
        match self {
            Stdio::Devnull => None,
            Stdio::RedirectToFile(f) => Some(f.as_raw_fd()),
            Stdio::RedirectToFd(fd) => Some(*fd),
        }
    }
}

impl From<File> for Stdio {
    fn from(f: File) -> Self {
        Stdio::RedirectToFile(f)
    }
}

impl From<RawFd> for Stdio {
    fn from(fd: RawFd) -> Self {
        Stdio::RedirectToFd(fd)
    }
}

/// The descriptors of the given redirection targets, skipping those that
/// have none.
pub fn get_stream_file_descriptors(stdin: &Stdio, stdout: &Stdio, stderr: &Stdio) -> Vec<RawFd> {
    let mut fds: Vec<RawFd> = [stdin, stdout, stderr]
        .into_iter()
        .filter_map(Stdio::fileno)
        .collect();
    fds.sort_unstable();
    fds.dedup();
    fds
}

/// Makes `system_fd` refer to the same open file as `target`.
///
/// With [`Stdio::Devnull`] the null device is opened for reading and writing
/// and duplicated instead.
pub fn redirect_stream<S: Sys + ?Sized>(sys: &S, system_fd: RawFd, target: &Stdio) -> DaemonResult<()> {
    let redirect_failed = |e| {
        DaemonError::environment(format!("Unable to redirect descriptor {system_fd}"), e)
    };
    match target.fileno() {
        Some(fd) => sys.dup2(fd, system_fd).map_err(redirect_failed),
        None => {
            let null = sys.open_devnull().map_err(redirect_failed)?;
            sys.dup2(null, system_fd).map_err(redirect_failed)?;
            if null != system_fd {
                sys.close(null).map_err(redirect_failed)?;
            }
            Ok(())
        }
    }
}
