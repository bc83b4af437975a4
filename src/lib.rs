//! # daemon_context
//!
//! Turns the running process into a well-behaved Unix daemon: it detaches
//! from the controlling terminal with a double fork, drops privileges, closes
//! inherited descriptors, redirects the standard streams, installs signal
//! dispositions and holds a PID file lock until it exits.
//!
//! ```no_run
//! use daemon_context::{DaemonContext, PidFile};
//!
//! let context = DaemonContext::new()
//!     .working_directory("/var/lib/mydaemon")
//!     .umask(0o027)
//!     .pidfile(PidFile::new("/run/mydaemon.pid"))
//!     .build()?;
//! context.open()?;
//! // ... daemon work ...
//! # Ok::<(), daemon_context::DaemonError>(())
//! ```

#[cfg(not(unix))]
compile_error!("daemon_context only supports Unix platforms");

mod daemon;
mod error;
mod pidfile;
mod stdio;

pub mod detach;
pub mod files;
pub mod privilege;
pub mod signals;
pub mod sys;

// Re-export public types to keep the API flat
pub use daemon::{DaemonContext, DaemonGuard, Termination};
pub use error::{DaemonError, DaemonResult};
pub use files::{Descriptor, Preserve};
pub use pidfile::{PidFile, PidLock};
pub use signals::{HandlerRef, RawDisposition, SignalMap};
pub use stdio::{get_stream_file_descriptors, redirect_stream, Stdio};
