use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::ops::Range;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, Once, TryLockError};
use std::thread;

use signal_hook::iterator::{Handle, Signals};

use super::{c_int, gid_t, pid_t, uid_t, Fork, Resource, ResourceLimit, SignalAction, Sys};

/// The real platform, backed by libc and signal-hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixSys;

type ExitHook = Box<dyn FnOnce() + Send>;

static EXIT_HOOKS: Mutex<Vec<ExitHook>> = Mutex::new(Vec::new());
static INSTALL_EXIT_HOOKS: Once = Once::new();

extern "C" fn run_exit_hooks() {
    // exit() may run while another thread is registering a hook.
    let hooks = match EXIT_HOOKS.try_lock() {
        Ok(mut hooks) => mem::take(&mut *hooks),
        Err(TryLockError::Poisoned(poisoned)) => mem::take(&mut *poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => return,
    };
    for hook in hooks.into_iter().rev() {
        hook();
    }
}

type SignalHandler = Arc<dyn Fn() + Send + Sync>;
type Handlers = HashMap<c_int, SignalHandler>;

/// Runs signal handlers on a dedicated thread.
///
/// The low-level handler installed by signal-hook only wakes the thread up;
/// the closures run in normal context, where they may lock, allocate and
/// exit the process.
struct Dispatcher {
    pid: u32,
    handle: Handle,
    handlers: Arc<Mutex<Handlers>>,
}

static DISPATCHER: Mutex<Option<Dispatcher>> = Mutex::new(None);

fn table(handlers: &Mutex<Handlers>) -> MutexGuard<'_, Handlers> {
    handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Dispatcher {
    fn spawn() -> io::Result<Self> {
        let mut signals = Signals::new(std::iter::empty::<c_int>())?;
        let handle = signals.handle();
        let handlers = Arc::new(Mutex::new(Handlers::new()));
        let dispatch = Arc::clone(&handlers);
        thread::Builder::new()
            .name("signal-dispatch".to_owned())
            .spawn(move || {
                for signal in signals.forever() {
                    let handler = table(&dispatch).get(&signal).cloned();
                    if let Some(handler) = handler {
                        handler();
                    }
                }
            })?;
        Ok(Dispatcher {
            pid: std::process::id(),
            handle,
            handlers,
        })
    }

    fn register(&self, signal: c_int, handler: SignalHandler) -> io::Result<()> {
        table(&self.handlers).insert(signal, handler);
        self.handle.add_signal(signal)
    }
}

fn dispatch_signal(signal: c_int, handler: SignalHandler) -> io::Result<()> {
    let mut slot = DISPATCHER.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    // A dispatcher inherited across fork() has no thread behind it.
    let dispatcher = match slot.take() {
        Some(dispatcher) if dispatcher.pid == std::process::id() => dispatcher,
        _ => Dispatcher::spawn()?,
    };
    let registered = dispatcher.register(signal, handler);
    *slot = Some(dispatcher);
    registered
}

fn set_disposition(signal: c_int, disposition: libc::sighandler_t) -> io::Result<()> {
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = disposition;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    cvt(unsafe { libc::sigaction(signal, &action, ptr::null_mut()) }).map(drop)
}

fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn path_to_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path contains a NUL byte: {}", path.display()),
        )
    })
}

fn resource_id(resource: Resource) -> c_int {
    match resource {
        Resource::Core => libc::RLIMIT_CORE as c_int,
        Resource::OpenFiles => libc::RLIMIT_NOFILE as c_int,
    }
}

fn from_rlim(value: libc::rlim_t) -> Option<u64> {
    if value == libc::RLIM_INFINITY {
        None
    } else {
        Some(value as u64)
    }
}

fn to_rlim(value: Option<u64>) -> libc::rlim_t {
    value.map_or(libc::RLIM_INFINITY, |v| v as libc::rlim_t)
}

fn close_each(range: Range<RawFd>) -> io::Result<()> {
    for fd in range {
        if unsafe { libc::close(fd) } == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EBADF) {
                return Err(err);
            }
        }
    }
    Ok(())
}

impl Sys for UnixSys {
    fn fork(&self) -> io::Result<Fork> {
        match unsafe { libc::fork() } {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(Fork::Child),
            pid => Ok(Fork::Parent(pid)),
        }
    }

    fn setsid(&self) -> io::Result<()> {
        cvt(unsafe { libc::setsid() }).map(drop)
    }

    fn exit_immediately(&self, status: i32) {
        unsafe { libc::_exit(status) }
    }

    fn exit(&self, status: i32) {
        std::process::exit(status)
    }

    fn parent_pid(&self) -> pid_t {
        unsafe { libc::getppid() }
    }

    fn is_socket(&self, fd: RawFd) -> bool {
        let mut stat: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } == -1 {
            return false;
        }
        stat.st_mode & libc::S_IFMT == libc::S_IFSOCK
    }

    fn chdir(&self, path: &Path) -> io::Result<()> {
        let path = path_to_cstring(path)?;
        cvt(unsafe { libc::chdir(path.as_ptr()) }).map(drop)
    }

    fn chroot(&self, path: &Path) -> io::Result<()> {
        let path = path_to_cstring(path)?;
        cvt(unsafe { libc::chroot(path.as_ptr()) }).map(drop)
    }

    fn umask(&self, mask: u32) -> io::Result<()> {
        unsafe { libc::umask(mask as libc::mode_t) };
        Ok(())
    }

    fn uid(&self) -> uid_t {
        unsafe { libc::getuid() }
    }

    fn gid(&self) -> gid_t {
        unsafe { libc::getgid() }
    }

    fn user_name(&self, uid: uid_t) -> Option<String> {
        let pwd = unsafe { libc::getpwuid(uid) };
        if pwd.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr((*pwd).pw_name) };
        Some(name.to_string_lossy().into_owned())
    }

    fn initgroups(&self, user: &str, gid: gid_t) -> io::Result<()> {
        let user = CString::new(user)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "user name contains a NUL byte"))?;
        cvt(unsafe { libc::initgroups(user.as_ptr(), gid as _) }).map(drop)
    }

    fn setgid(&self, gid: gid_t) -> io::Result<()> {
        cvt(unsafe { libc::setgid(gid) }).map(drop)
    }

    fn setuid(&self, uid: uid_t) -> io::Result<()> {
        cvt(unsafe { libc::setuid(uid) }).map(drop)
    }

    fn getrlimit(&self, resource: Resource) -> io::Result<ResourceLimit> {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        cvt(unsafe { libc::getrlimit(resource_id(resource) as _, &mut limit) })?;
        Ok(ResourceLimit {
            soft: from_rlim(limit.rlim_cur),
            hard: from_rlim(limit.rlim_max),
        })
    }

    fn setrlimit(&self, resource: Resource, limit: ResourceLimit) -> io::Result<()> {
        let limit = libc::rlimit {
            rlim_cur: to_rlim(limit.soft),
            rlim_max: to_rlim(limit.hard),
        };
        cvt(unsafe { libc::setrlimit(resource_id(resource) as _, &limit) }).map(drop)
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        cvt(unsafe { libc::close(fd) }).map(drop)
    }

    fn close_range(&self, range: Range<RawFd>) -> io::Result<()> {
        if range.is_empty() {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        {
            let first = range.start as libc::c_uint;
            let last = (range.end - 1) as libc::c_uint;
            let ret = unsafe { libc::syscall(libc::SYS_close_range, first, last, 0 as libc::c_uint) };
            if ret == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            // Kernels older than 5.9 lack close_range(2).
            if err.raw_os_error() != Some(libc::ENOSYS) {
                return Err(err);
            }
        }
        close_each(range)
    }

    fn open_devnull(&self) -> io::Result<RawFd> {
        cvt(unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR) })
    }

    fn dup2(&self, src: RawFd, dst: RawFd) -> io::Result<()> {
        cvt(unsafe { libc::dup2(src, dst) }).map(drop)
    }

    fn install_signal(&self, signal: c_int, action: SignalAction) -> io::Result<()> {
        match action {
            SignalAction::Default => set_disposition(signal, libc::SIG_DFL),
            SignalAction::Ignore => set_disposition(signal, libc::SIG_IGN),
            SignalAction::Handler(handler) => {
                if signal_hook::consts::FORBIDDEN.contains(&signal) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("signal {signal} cannot have a handler installed"),
                    ));
                }
                dispatch_signal(signal, handler)
            }
        }
    }

    fn register_exit_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        INSTALL_EXIT_HOOKS.call_once(|| {
            if unsafe { libc::atexit(run_exit_hooks) } != 0 {
                tracing::warn!("atexit registration failed; exit hooks will not run");
            }
        });
        match EXIT_HOOKS.lock() {
            Ok(mut hooks) => hooks.push(hook),
            Err(poisoned) => poisoned.into_inner().push(hook),
        }
    }

    fn write_stderr(&self, message: &str) {
        let bytes = message.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            let rest = &bytes[written..];
            let ret = unsafe { libc::write(libc::STDERR_FILENO, rest.as_ptr().cast(), rest.len()) };
            if ret <= 0 {
                break;
            }
            written += ret as usize;
        }
    }
}
