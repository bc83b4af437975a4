use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while turning the process into a daemon.
///
/// None of these are retried. A failure in the middle of
/// [`DaemonContext::open`](crate::DaemonContext::open) leaves the process
/// partially configured; the caller is expected to abort.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// An OS-level call failed while changing the process environment
    /// (directory, root, mask, owner, core limit, descriptors, signals).
    #[error("{message} ({source})")]
    Environment {
        message: String,
        #[source]
        source: io::Error,
    },
    /// The process could not be detached from its session.
    #[error("{message} ({source})")]
    Detach {
        message: String,
        #[source]
        source: io::Error,
    },
    /// An entry of the exclusion set has no integer descriptor identity.
    #[error("file descriptor to preserve is not an integer: {value}")]
    Validation { value: String },
    /// The signal map names a handler the context does not provide.
    #[error("unknown signal handler name: {name:?}")]
    UnknownHandler { name: String },
    /// The PID file is locked by another instance.
    #[error("daemon is already running (PID file {} is locked)", .path.display())]
    TargetLocked { path: PathBuf },
    /// Any other I/O failure, e.g. creating the PID file.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DaemonError {
    pub(crate) fn environment(message: impl Into<String>, source: io::Error) -> Self {
        DaemonError::Environment {
            message: message.into(),
            source,
        }
    }

    pub(crate) fn detach(message: impl Into<String>, source: io::Error) -> Self {
        DaemonError::Detach {
            message: message.into(),
            source,
        }
    }
}

/// A specialized Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
