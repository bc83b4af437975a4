//! A recording platform for unit tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::ops::Range;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{c_int, gid_t, pid_t, uid_t, Fork, Resource, ResourceLimit, SignalAction, Sys};

pub(crate) const FAKE_UID: uid_t = 1042;
pub(crate) const FAKE_GID: gid_t = 1043;
pub(crate) const FAKE_DEVNULL: RawFd = 77;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Fork,
    Setsid,
    ExitImmediately(i32),
    Exit(i32),
    Chdir(PathBuf),
    Chroot(PathBuf),
    Umask(u32),
    Initgroups(String, gid_t),
    Setgid(gid_t),
    Setuid(uid_t),
    GetRlimit(Resource),
    SetRlimit(Resource, ResourceLimit),
    Close(RawFd),
    CloseRange(RawFd, RawFd),
    OpenDevnull,
    Dup2(RawFd, RawFd),
    InstallSignal(c_int, &'static str),
    RegisterExitHook,
    WriteStderr(String),
}

#[derive(Default)]
pub(crate) struct FakeSys {
    calls: Mutex<Vec<Call>>,
    forks: Mutex<VecDeque<Result<Fork, i32>>>,
    failures: Mutex<HashMap<&'static str, io::ErrorKind>>,
    errnos: Mutex<HashMap<&'static str, i32>>,
    users: Mutex<HashMap<uid_t, String>>,
    limits: Mutex<HashMap<&'static str, ResourceLimit>>,
    handlers: Mutex<Vec<(c_int, SignalAction)>>,
    exit_hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    parent_pid: Mutex<Option<pid_t>>,
    stdin_is_socket: Mutex<bool>,
    devnull: Mutex<Option<RawFd>>,
}

fn limit_key(resource: Resource) -> &'static str {
    match resource {
        Resource::Core => "core",
        Resource::OpenFiles => "nofile",
    }
}

impl FakeSys {
    pub(crate) fn new() -> Self {
        let fake = FakeSys::default();
        fake.users
            .lock()
            .unwrap()
            .insert(FAKE_UID, "daemonuser".to_owned());
        fake
    }

    /// Queues the results of successive `fork()` calls; an `Err` carries an
    /// errno. Unqueued calls return `Fork::Child`.
    pub(crate) fn with_forks(self, forks: impl IntoIterator<Item = Result<Fork, i32>>) -> Self {
        self.forks.lock().unwrap().extend(forks);
        self
    }

    /// Makes the named call fail with a custom error message.
    pub(crate) fn failing(self, call: &'static str, kind: io::ErrorKind) -> Self {
        self.failures.lock().unwrap().insert(call, kind);
        self
    }

    /// Makes the named call fail with the given errno.
    pub(crate) fn failing_errno(self, call: &'static str, errno: i32) -> Self {
        self.errnos.lock().unwrap().insert(call, errno);
        self
    }

    pub(crate) fn with_limit(self, resource: Resource, limit: ResourceLimit) -> Self {
        self.limits.lock().unwrap().insert(limit_key(resource), limit);
        self
    }

    pub(crate) fn without_users(self) -> Self {
        self.users.lock().unwrap().clear();
        self
    }

    pub(crate) fn with_parent_pid(self, pid: pid_t) -> Self {
        *self.parent_pid.lock().unwrap() = Some(pid);
        self
    }

    pub(crate) fn with_socket_stdin(self) -> Self {
        *self.stdin_is_socket.lock().unwrap() = true;
        self
    }

    /// Makes `open_devnull()` return `fd` instead of [`FAKE_DEVNULL`].
    pub(crate) fn with_devnull(self, fd: RawFd) -> Self {
        *self.devnull.lock().unwrap() = Some(fd);
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub(crate) fn handler(&self, signal: c_int) -> Option<SignalAction> {
        self.handlers
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(sig, _)| *sig == signal)
            .map(|(_, action)| action.clone())
    }

    pub(crate) fn run_exit_hooks(&self) {
        let hooks = std::mem::take(&mut *self.exit_hooks.lock().unwrap());
        for hook in hooks.into_iter().rev() {
            hook();
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn outcome(&self, name: &'static str) -> io::Result<()> {
        if let Some(errno) = self.errnos.lock().unwrap().get(name) {
            return Err(io::Error::from_raw_os_error(*errno));
        }
        match self.failures.lock().unwrap().get(name) {
            Some(kind) => Err(io::Error::new(*kind, format!("fake {name} failure"))),
            None => Ok(()),
        }
    }
}

impl Sys for FakeSys {
    fn fork(&self) -> io::Result<Fork> {
        self.record(Call::Fork);
        match self.forks.lock().unwrap().pop_front() {
            Some(Ok(fork)) => Ok(fork),
            Some(Err(errno)) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(Fork::Child),
        }
    }

    fn setsid(&self) -> io::Result<()> {
        self.record(Call::Setsid);
        self.outcome("setsid")
    }

    fn exit_immediately(&self, status: i32) {
        self.record(Call::ExitImmediately(status));
    }

    fn exit(&self, status: i32) {
        self.record(Call::Exit(status));
    }

    fn parent_pid(&self) -> pid_t {
        self.parent_pid.lock().unwrap().unwrap_or(4242)
    }

    fn is_socket(&self, fd: RawFd) -> bool {
        fd == 0 && *self.stdin_is_socket.lock().unwrap()
    }

    fn chdir(&self, path: &Path) -> io::Result<()> {
        self.record(Call::Chdir(path.to_path_buf()));
        self.outcome("chdir")
    }

    fn chroot(&self, path: &Path) -> io::Result<()> {
        self.record(Call::Chroot(path.to_path_buf()));
        self.outcome("chroot")
    }

    fn umask(&self, mask: u32) -> io::Result<()> {
        self.record(Call::Umask(mask));
        self.outcome("umask")
    }

    fn uid(&self) -> uid_t {
        FAKE_UID
    }

    fn gid(&self) -> gid_t {
        FAKE_GID
    }

    fn user_name(&self, uid: uid_t) -> Option<String> {
        self.users.lock().unwrap().get(&uid).cloned()
    }

    fn initgroups(&self, user: &str, gid: gid_t) -> io::Result<()> {
        self.record(Call::Initgroups(user.to_owned(), gid));
        self.outcome("initgroups")
    }

    fn setgid(&self, gid: gid_t) -> io::Result<()> {
        self.record(Call::Setgid(gid));
        self.outcome("setgid")
    }

    fn setuid(&self, uid: uid_t) -> io::Result<()> {
        self.record(Call::Setuid(uid));
        self.outcome("setuid")
    }

    fn getrlimit(&self, resource: Resource) -> io::Result<ResourceLimit> {
        self.record(Call::GetRlimit(resource));
        self.outcome("getrlimit")?;
        Ok(self
            .limits
            .lock()
            .unwrap()
            .get(limit_key(resource))
            .copied()
            .unwrap_or(ResourceLimit {
                soft: Some(1024),
                hard: Some(4096),
            }))
    }

    fn setrlimit(&self, resource: Resource, limit: ResourceLimit) -> io::Result<()> {
        self.record(Call::SetRlimit(resource, limit));
        self.outcome("setrlimit")
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        self.record(Call::Close(fd));
        self.outcome("close")
    }

    fn close_range(&self, range: Range<RawFd>) -> io::Result<()> {
        self.record(Call::CloseRange(range.start, range.end));
        self.outcome("close_range")
    }

    fn open_devnull(&self) -> io::Result<RawFd> {
        self.record(Call::OpenDevnull);
        self.outcome("open_devnull")?;
        Ok(self.devnull.lock().unwrap().unwrap_or(FAKE_DEVNULL))
    }

    fn dup2(&self, src: RawFd, dst: RawFd) -> io::Result<()> {
        self.record(Call::Dup2(src, dst));
        self.outcome("dup2")
    }

    fn install_signal(&self, signal: c_int, action: SignalAction) -> io::Result<()> {
        let kind = match action {
            SignalAction::Default => "default",
            SignalAction::Ignore => "ignore",
            SignalAction::Handler(_) => "handler",
        };
        self.record(Call::InstallSignal(signal, kind));
        self.outcome("install_signal")?;
        self.handlers.lock().unwrap().push((signal, action));
        Ok(())
    }

    fn register_exit_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        self.record(Call::RegisterExitHook);
        self.exit_hooks.lock().unwrap().push(hook);
    }

    fn write_stderr(&self, message: &str) {
        self.record(Call::WriteStderr(message.to_owned()));
    }
}
