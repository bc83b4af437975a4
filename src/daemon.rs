use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::detach::{detach_process_context, is_detach_process_context_required, Detached};
use crate::error::DaemonResult;
use crate::files::{close_all_open_files, Preserve};
use crate::pidfile::PidLock;
use crate::privilege::{
    change_file_creation_mask, change_process_owner, change_root_directory,
    change_working_directory, prevent_core_dump,
};
use crate::signals::{
    make_default_signal_map, make_signal_handler_map, set_signal_handlers, Disposition,
    HandlerRef, Method, SignalMap,
};
use crate::stdio::{get_stream_file_descriptors, redirect_stream, Stdio};
use crate::sys::{c_int, gid_t, uid_t, SignalAction, Sys, UnixSys};

/// How the process ends when [`DaemonContext::terminate`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    signal: c_int,
}

impl Termination {
    pub const EXIT_STATUS: i32 = 1;

    pub fn new(signal: c_int) -> Self {
        Termination { signal }
    }

    pub fn signal(&self) -> c_int {
        self.signal
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Terminating on signal {}", self.signal)
    }
}

struct Lifecycle {
    is_open: bool,
    exit_hook_registered: bool,
    pidfile: Option<Box<dyn PidLock>>,
}

impl Lifecycle {
    fn close(&mut self) {
        if !self.is_open {
            return;
        }
        if let Some(pidfile) = self.pidfile.as_mut() {
            if let Err(e) = pidfile.release() {
                warn!(path = %pidfile.path().display(), error = %e, "failed to release PID file");
            }
        }
        self.is_open = false;
        info!("daemon context closed");
    }
}

fn lock(state: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

const EXIT_LOCK_ATTEMPTS: u32 = 50;
const EXIT_LOCK_BACKOFF: Duration = Duration::from_millis(10);

/// Closes the context from the process exit path.
///
/// The thread calling `exit()` may interrupt a holder of the state lock, so
/// the lock is only tried for a bounded time. If it stays busy the PID file
/// is left behind; the kernel still drops its lock with the process.
fn close_at_exit(state: &Mutex<Lifecycle>) {
    for _ in 0..EXIT_LOCK_ATTEMPTS {
        match state.try_lock() {
            Ok(mut lifecycle) => return lifecycle.close(),
            Err(TryLockError::Poisoned(poisoned)) => return poisoned.into_inner().close(),
            Err(TryLockError::WouldBlock) => thread::sleep(EXIT_LOCK_BACKOFF),
        }
    }
    warn!("daemon context busy at exit; PID file not released");
}

fn terminate<S: Sys + ?Sized>(sys: &S, signal: c_int) -> Termination {
    let termination = Termination::new(signal);
    sys.write_stderr(&format!("{termination}\n"));
    sys.exit(Termination::EXIT_STATUS);
    termination
}

/// Configuration and lifecycle of a Unix daemon process.
///
/// Build it with the builder methods, then call [`open`](Self::open) to turn
/// the current process into a daemon. Opening runs, in order: chroot, core
/// dump suppression, umask, working directory, owner change, double fork,
/// signal handlers, descriptor closing, stream redirection, PID file locking
/// and exit hook registration.
///
/// # Defaults
/// - Working directory: `/`
/// - Umask: `0`
/// - Owner: the current uid and gid
/// - Core dumps: prevented
/// - Detach: unless started by `init` or a super-server
/// - Stdio: `/dev/null`
/// - Signals: job-control signals ignored, `SIGTERM` terminates
pub struct DaemonContext<S: Sys = UnixSys> {
    sys: Arc<S>,
    chroot_directory: Option<PathBuf>,
    working_directory: PathBuf,
    umask: u32,
    uid: uid_t,
    gid: gid_t,
    initgroups: bool,
    prevent_core: bool,
    detach_process: bool,
    files_preserve: Option<Vec<Preserve>>,
    stdin: Stdio,
    stdout: Stdio,
    stderr: Stdio,
    signal_map: SignalMap,
    notify_ready: bool,
    state: Arc<Mutex<Lifecycle>>,
}

impl<S: Sys> fmt::Debug for DaemonContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonContext")
            .field("chroot_directory", &self.chroot_directory)
            .field("working_directory", &self.working_directory)
            .field("umask", &format_args!("{:#o}", self.umask))
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("initgroups", &self.initgroups)
            .field("prevent_core", &self.prevent_core)
            .field("detach_process", &self.detach_process)
            .field("files_preserve", &self.files_preserve)
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("signal_map", &self.signal_map)
            .field("pidfile", &self.pidfile_path())
            .field("notify_ready", &self.notify_ready)
            .field("is_open", &self.is_open())
            .finish()
    }
}

impl Default for DaemonContext<UnixSys> {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonContext<UnixSys> {
    /// Creates a default configuration for the running platform.
    pub fn new() -> Self {
        Self::with_system(UnixSys)
    }
}

impl<S: Sys> DaemonContext<S> {
    /// Creates a default configuration that issues its OS calls through `sys`.
    pub fn with_system(sys: S) -> Self {
        let sys = Arc::new(sys);
        DaemonContext {
            chroot_directory: None,
            working_directory: PathBuf::from("/"),
            umask: 0,
            uid: sys.uid(),
            gid: sys.gid(),
            initgroups: false,
            prevent_core: true,
            detach_process: is_detach_process_context_required(&*sys),
            files_preserve: None,
            stdin: Stdio::devnull(),
            stdout: Stdio::devnull(),
            stderr: Stdio::devnull(),
            signal_map: make_default_signal_map(),
            notify_ready: false,
            state: Arc::new(Mutex::new(Lifecycle {
                is_open: false,
                exit_hook_registered: false,
                pidfile: None,
            })),
            sys,
        }
    }

    // --- Public Getters ---

    /// Whether the context is currently open.
    pub fn is_open(&self) -> bool {
        lock(&self.state).is_open
    }

    pub fn working_directory_path(&self) -> &Path {
        &self.working_directory
    }

    pub fn chroot_directory_path(&self) -> Option<&Path> {
        self.chroot_directory.as_deref()
    }

    /// Returns the path of the configured PID file, if any.
    pub fn pidfile_path(&self) -> Option<PathBuf> {
        lock(&self.state)
            .pidfile
            .as_ref()
            .map(|pidfile| pidfile.path().to_path_buf())
    }

    pub fn detaches_process(&self) -> bool {
        self.detach_process
    }

    pub fn signal_map_ref(&self) -> &SignalMap {
        &self.signal_map
    }

    pub fn files_preserved(&self) -> Option<&[Preserve]> {
        self.files_preserve.as_deref()
    }

    // --- Builder Methods ---

    /// Sets a directory to become the process's root directory.
    pub fn chroot_directory<P: Into<PathBuf>>(mut self, path: P) -> Self { self.chroot_directory = Some(path.into()); self }

    /// Sets the working directory for the daemon.
    pub fn working_directory<P: Into<PathBuf>>(mut self, path: P) -> Self { self.working_directory = path.into(); self }

    /// Sets the file creation mask for the daemon process.
    pub fn umask(mut self, mask: u32) -> Self { self.umask = mask; self }

    /// Sets the user id the daemon runs as.
    pub fn uid(mut self, uid: uid_t) -> Self { self.uid = uid; self }

    /// Sets the group id the daemon runs as.
    pub fn gid(mut self, gid: gid_t) -> Self { self.gid = gid; self }

    /// If `true`, installs the supplementary groups of the target user.
    pub fn initgroups(mut self, initgroups: bool) -> Self { self.initgroups = initgroups; self }

    /// If `true` (the default), prevents the process from dumping core.
    pub fn prevent_core(mut self, prevent: bool) -> Self { self.prevent_core = prevent; self }

    /// Overrides whether the process double-forks into the background.
    pub fn detach_process(mut self, detach: bool) -> Self { self.detach_process = detach; self }

    /// Sets the files whose descriptors must stay open.
    pub fn files_preserve<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Preserve>,
    {
        self.files_preserve = Some(files.into_iter().map(Into::into).collect());
        self
    }

    /// Configures the standard input stream.
    pub fn stdin<T: Into<Stdio>>(mut self, stdio: T) -> Self { self.stdin = stdio.into(); self }

    /// Configures the standard output stream.
    pub fn stdout<T: Into<Stdio>>(mut self, stdio: T) -> Self { self.stdout = stdio.into(); self }

    /// Configures the standard error stream.
    pub fn stderr<T: Into<Stdio>>(mut self, stdio: T) -> Self { self.stderr = stdio.into(); self }

    /// Replaces the whole signal map.
    pub fn signal_map(mut self, map: SignalMap) -> Self { self.signal_map = map; self }

    /// Sets the handler of one signal; `None` ignores it.
    pub fn signal(mut self, signal: c_int, handler: Option<HandlerRef>) -> Self {
        self.signal_map.insert(signal, handler);
        self
    }

    /// Sets the PID file lock to hold while the context is open.
    pub fn pidfile<L: PidLock + 'static>(self, pidfile: L) -> Self {
        lock(&self.state).pidfile = Some(Box::new(pidfile));
        self
    }

    /// If `true`, tells the service manager (systemd) that the daemon is
    /// ready once the context is open.
    pub fn notify_ready(mut self, notify: bool) -> Self { self.notify_ready = notify; self }

    /// Validates configuration without opening the context.
    /// Every named signal handler must exist.
    pub fn build(self) -> DaemonResult<Self> {
        make_signal_handler_map(&self.signal_map)?;
        Ok(self)
    }

    // --- Lifecycle ---

    /// Turns the current process into a daemon. Does nothing if already open.
    ///
    /// On error the process is left partially configured and should exit.
    /// When this process is one of the fork parents it exits inside this
    /// call; only a test platform returns from that exit, in which case
    /// `open` returns without touching anything else.
    pub fn open(&self) -> DaemonResult<()> {
        if self.is_open() {
            return Ok(());
        }
        let sys = &*self.sys;

        if let Some(root) = &self.chroot_directory {
            debug!(root = %root.display(), "changing root directory");
            change_root_directory(sys, root)?;
        }
        if self.prevent_core {
            prevent_core_dump(sys)?;
        }
        change_file_creation_mask(sys, self.umask)?;
        debug!(directory = %self.working_directory.display(), "changing working directory");
        change_working_directory(sys, &self.working_directory)?;
        debug!(uid = self.uid, gid = self.gid, initgroups = self.initgroups, "changing process owner");
        change_process_owner(sys, self.uid, self.gid, self.initgroups)?;

        if self.detach_process {
            match detach_process_context(sys)? {
                Detached::Exited(_) => return Ok(()),
                Detached::Daemon | Detached::Degraded => {}
            }
        }

        let handlers = self.make_signal_handler_map()?;
        set_signal_handlers(sys, handlers)?;

        let exclude = self.exclude_file_descriptors();
        close_all_open_files(sys, &exclude)?;

        redirect_stream(sys, libc::STDIN_FILENO, &self.stdin)?;
        redirect_stream(sys, libc::STDOUT_FILENO, &self.stdout)?;
        redirect_stream(sys, libc::STDERR_FILENO, &self.stderr)?;

        if let Some(pidfile) = lock(&self.state).pidfile.as_mut() {
            pidfile.acquire()?;
        }

        let registered = std::mem::replace(&mut lock(&self.state).exit_hook_registered, true);
        if !registered {
            let state = Arc::clone(&self.state);
            sys.register_exit_hook(Box::new(move || close_at_exit(&state)));
        }

        lock(&self.state).is_open = true;
        info!(pid = std::process::id(), "daemon context open");

        if self.notify_ready {
            notify_service_manager();
        }
        Ok(())
    }

    /// Releases the PID file and marks the context closed. Does nothing if
    /// not open.
    pub fn close(&self) {
        lock(&self.state).close();
    }

    /// Opens the context and returns a guard that closes it when dropped.
    pub fn enter(&self) -> DaemonResult<DaemonGuard<'_, S>> {
        self.open()?;
        Ok(DaemonGuard { context: self })
    }

    /// Ends the process because `signal` arrived, reporting it on standard
    /// error. The normal exit path runs, so the exit hook closes the context.
    ///
    /// Only returns on a test platform.
    pub fn terminate(&self, signal: c_int) -> Termination {
        terminate(&*self.sys, signal)
    }

    /// The descriptors that survive [`open`](Self::open): the preserved files
    /// plus the redirection targets that have a descriptor.
    pub fn exclude_file_descriptors(&self) -> Vec<Preserve> {
        let mut exclude = self.files_preserve.clone().unwrap_or_default();
        exclude.extend(
            get_stream_file_descriptors(&self.stdin, &self.stdout, &self.stderr)
                .into_iter()
                .map(Preserve::from),
        );
        exclude
    }

    fn make_signal_handler_map(&self) -> DaemonResult<Vec<(c_int, SignalAction)>> {
        Ok(make_signal_handler_map(&self.signal_map)?
            .into_iter()
            .map(|(signal, disposition)| (signal, self.bind(signal, disposition)))
            .collect())
    }

    fn bind(&self, signal: c_int, disposition: Disposition) -> SignalAction {
        match disposition {
            Disposition::Ignore => SignalAction::Ignore,
            Disposition::Raw(raw) => raw.into(),
            Disposition::Invoke(Method::Terminate) => {
                let sys = Arc::clone(&self.sys);
                SignalAction::Handler(Arc::new(move || {
                    terminate(&*sys, signal);
                }))
            }
        }
    }
}

/// Keeps a [`DaemonContext`] open for its lifetime.
pub struct DaemonGuard<'a, S: Sys = UnixSys> {
    context: &'a DaemonContext<S>,
}

impl<S: Sys> DaemonGuard<'_, S> {
    pub fn context(&self) -> &DaemonContext<S> {
        self.context
    }
}

impl<S: Sys> Drop for DaemonGuard<'_, S> {
    fn drop(&mut self) {
        self.context.close();
    }
}

impl<S: Sys> fmt::Debug for DaemonGuard<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonGuard").field("context", self.context).finish()
    }
}

#[cfg(target_os = "linux")]
fn notify_service_manager() {
    use sd_notify::NotifyState;

    // 'true' unsets NOTIFY_SOCKET so it doesn't leak to children.
    if let Err(e) = sd_notify::notify(true, &[NotifyState::Ready]) {
        warn!(error = %e, "failed to notify service manager");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_service_manager() {}
