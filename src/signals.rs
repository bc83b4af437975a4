//! Signal dispositions for the daemon.
//!
//! A [`SignalMap`] is the configured view: per signal, either no handler
//! (ignore the signal), the name of a handler the daemon context provides, or
//! a raw disposition passed straight to the platform. Resolving the map gives
//! [`Disposition`] values, rejecting unknown handler names up front.

use std::fmt;
use std::sync::Arc;

use signal_hook::consts::signal::*;
use tracing::debug;

use crate::error::{DaemonError, DaemonResult};
use crate::sys::{c_int, SignalAction, Sys};

/// A disposition handed to the platform unchanged.
#[derive(Clone)]
pub enum RawDisposition {
    Default,
    Ignore,
    /// Called on the signal dispatch thread, outside signal context.
    Callback(Arc<dyn Fn() + Send + Sync>),
}

impl fmt::Debug for RawDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawDisposition::Default => f.write_str("Default"),
            RawDisposition::Ignore => f.write_str("Ignore"),
            RawDisposition::Callback(_) => f.write_str("Callback(Fn)"),
        }
    }
}

impl From<RawDisposition> for SignalAction {
    fn from(raw: RawDisposition) -> Self {
        match raw {
            RawDisposition::Default => SignalAction::Default,
            RawDisposition::Ignore => SignalAction::Ignore,
            RawDisposition::Callback(f) => SignalAction::Handler(f),
        }
    }
}

/// A configured handler. `None` in a [`SignalMap`] means "ignore".
#[derive(Debug, Clone)]
pub enum HandlerRef {
    /// A handler method of the daemon context, by name.
    Named(String),
    Raw(RawDisposition),
}

impl HandlerRef {
    pub fn named(name: &str) -> Self {
        HandlerRef::Named(name.to_owned())
    }
}

/// The handler methods the daemon context offers to signal maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// [`DaemonContext::terminate`](crate::DaemonContext::terminate)
    Terminate,
}

impl Method {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "terminate" => Some(Method::Terminate),
            _ => None,
        }
    }
}

/// A resolved signal disposition.
#[derive(Debug, Clone)]
pub enum Disposition {
    Ignore,
    Invoke(Method),
    Raw(RawDisposition),
}

/// Signal numbers mapped to configured handlers, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct SignalMap {
    entries: Vec<(c_int, Option<HandlerRef>)>,
}

impl SignalMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the handler for `signal`, replacing any earlier one in place.
    pub fn insert(&mut self, signal: c_int, handler: Option<HandlerRef>) {
        match self.entries.iter_mut().find(|(sig, _)| *sig == signal) {
            Some(entry) => entry.1 = handler,
            None => self.entries.push((signal, handler)),
        }
    }

    pub fn get(&self, signal: c_int) -> Option<&Option<HandlerRef>> {
        self.entries
            .iter()
            .find(|(sig, _)| *sig == signal)
            .map(|(_, handler)| handler)
    }

    pub fn contains(&self, signal: c_int) -> bool {
        self.get(signal).is_some()
    }

    pub fn signals(&self) -> impl Iterator<Item = c_int> + '_ {
        self.entries.iter().map(|(sig, _)| *sig)
    }

    pub fn iter(&self) -> impl Iterator<Item = (c_int, &Option<HandlerRef>)> {
        self.entries.iter().map(|(sig, handler)| (*sig, handler))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(c_int, Option<HandlerRef>)> for SignalMap {
    fn from_iter<I: IntoIterator<Item = (c_int, Option<HandlerRef>)>>(iter: I) -> Self {
        let mut map = SignalMap::new();
        for (signal, handler) in iter {
            map.insert(signal, handler);
        }
        map
    }
}

const SIGNAL_NAMES: &[(&str, c_int)] = &[
    ("SIGABRT", SIGABRT),
    ("SIGALRM", SIGALRM),
    ("SIGBUS", SIGBUS),
    ("SIGCHLD", SIGCHLD),
    ("SIGCONT", SIGCONT),
    ("SIGFPE", SIGFPE),
    ("SIGHUP", SIGHUP),
    ("SIGILL", SIGILL),
    ("SIGINT", SIGINT),
    ("SIGKILL", SIGKILL),
    ("SIGPIPE", SIGPIPE),
    ("SIGPROF", SIGPROF),
    ("SIGQUIT", SIGQUIT),
    ("SIGSEGV", SIGSEGV),
    ("SIGSTOP", SIGSTOP),
    ("SIGSYS", SIGSYS),
    ("SIGTERM", SIGTERM),
    ("SIGTRAP", SIGTRAP),
    ("SIGTSTP", SIGTSTP),
    ("SIGTTIN", SIGTTIN),
    ("SIGTTOU", SIGTTOU),
    ("SIGURG", SIGURG),
    ("SIGUSR1", SIGUSR1),
    ("SIGUSR2", SIGUSR2),
    ("SIGVTALRM", SIGVTALRM),
    ("SIGWINCH", SIGWINCH),
    ("SIGXCPU", SIGXCPU),
    ("SIGXFSZ", SIGXFSZ),
];

/// Looks up a signal by name on the running platform.
pub fn signal_number(name: &str) -> Option<c_int> {
    SIGNAL_NAMES
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, number)| *number)
}

const DEFAULT_SIGNALS: &[(&str, Option<&str>)] = &[
    ("SIGTSTP", None),
    ("SIGTTIN", None),
    ("SIGTTOU", None),
    ("SIGTERM", Some("terminate")),
];

/// Builds the default signal map for the running platform.
///
/// Terminal job-control signals are ignored and `SIGTERM` calls
/// [`terminate`](crate::DaemonContext::terminate).
pub fn make_default_signal_map() -> SignalMap {
    make_default_signal_map_in(signal_number)
}

/// Builds the default signal map against a signal namespace. Names the
/// namespace does not know are left out.
pub fn make_default_signal_map_in<F>(lookup: F) -> SignalMap
where
    F: Fn(&str) -> Option<c_int>,
{
    DEFAULT_SIGNALS
        .iter()
        .filter_map(|(name, handler)| {
            lookup(name).map(|signal| (signal, handler.map(HandlerRef::named)))
        })
        .collect()
}

/// Resolves one configured handler.
pub fn make_signal_handler(handler: &Option<HandlerRef>) -> DaemonResult<Disposition> {
    match handler {
        None => Ok(Disposition::Ignore),
        Some(HandlerRef::Named(name)) => Method::from_name(name)
            .map(Disposition::Invoke)
            .ok_or_else(|| DaemonError::UnknownHandler { name: name.clone() }),
        Some(HandlerRef::Raw(raw)) => Ok(Disposition::Raw(raw.clone())),
    }
}

/// Resolves every handler of `map`, keeping its order.
pub fn make_signal_handler_map(map: &SignalMap) -> DaemonResult<Vec<(c_int, Disposition)>> {
    map.iter()
        .map(|(signal, handler)| Ok((signal, make_signal_handler(handler)?)))
        .collect()
}

/// Installs each disposition, in order.
pub fn set_signal_handlers<S: Sys + ?Sized>(
    sys: &S,
    handlers: Vec<(c_int, SignalAction)>,
) -> DaemonResult<()> {
    for (signal, action) in handlers {
        debug!(signal, ?action, "installing signal disposition");
        sys.install_signal(signal, action).map_err(|e| {
            DaemonError::environment(format!("Unable to set handler for signal {signal}"), e)
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::fake::{Call, FakeSys};

    #[test]
    fn default_map_ignores_job_control_and_terminates_on_sigterm() {
        let map = make_default_signal_map();
        let signals: Vec<_> = map.signals().collect();
        assert_eq!(signals, vec![SIGTSTP, SIGTTIN, SIGTTOU, SIGTERM]);
        assert!(map.get(SIGTSTP).unwrap().is_none());
        assert!(matches!(
            map.get(SIGTERM),
            Some(Some(HandlerRef::Named(name))) if name == "terminate"
        ));
    }

    #[test]
    fn default_map_omits_signals_unknown_to_platform() {
        let map = make_default_signal_map_in(|name| match name {
            "SIGTTOU" => None,
            other => signal_number(other),
        });
        assert_eq!(map.len(), 3);
        assert!(!map.contains(SIGTTOU));
        assert!(map.contains(SIGTERM));
    }

    #[test]
    fn none_resolves_to_ignore() {
        assert!(matches!(make_signal_handler(&None).unwrap(), Disposition::Ignore));
    }

    #[test]
    fn name_resolves_to_method() {
        let handler = Some(HandlerRef::named("terminate"));
        assert!(matches!(
            make_signal_handler(&handler).unwrap(),
            Disposition::Invoke(Method::Terminate)
        ));
    }

    #[test]
    fn unknown_name_is_rejected() {
        let handler = Some(HandlerRef::named("b0gUs"));
        let err = make_signal_handler(&handler).unwrap_err();
        assert!(matches!(err, DaemonError::UnknownHandler { ref name } if name == "b0gUs"));
    }

    #[test]
    fn raw_disposition_passes_through() {
        let handler = Some(HandlerRef::Raw(RawDisposition::Default));
        assert!(matches!(
            make_signal_handler(&handler).unwrap(),
            Disposition::Raw(RawDisposition::Default)
        ));
    }

    #[test]
    fn handler_map_keeps_map_order() {
        let map: SignalMap = [
            (SIGQUIT, Some(HandlerRef::Raw(RawDisposition::Ignore))),
            (SIGINT, None),
            (SIGHUP, Some(HandlerRef::named("terminate"))),
        ]
        .into_iter()
        .collect();
        let resolved = make_signal_handler_map(&map).unwrap();
        let order: Vec<_> = resolved.iter().map(|(sig, _)| *sig).collect();
        assert_eq!(order, vec![SIGQUIT, SIGINT, SIGHUP]);
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut map = SignalMap::new();
        map.insert(SIGHUP, None);
        map.insert(SIGINT, None);
        map.insert(SIGHUP, Some(HandlerRef::named("terminate")));
        let signals: Vec<_> = map.signals().collect();
        assert_eq!(signals, vec![SIGHUP, SIGINT]);
        assert!(map.get(SIGHUP).unwrap().is_some());
    }

    #[test]
    fn installs_each_handler_in_order() {
        let sys = FakeSys::new();
        set_signal_handlers(
            &sys,
            vec![
                (SIGQUIT, SignalAction::Ignore),
                (SIGSEGV, SignalAction::Default),
                (SIGINT, SignalAction::Handler(Arc::new(|| {}))),
            ],
        )
        .unwrap();
        assert_eq!(
            sys.calls(),
            vec![
                Call::InstallSignal(SIGQUIT, "ignore"),
                Call::InstallSignal(SIGSEGV, "default"),
                Call::InstallSignal(SIGINT, "handler"),
            ]
        );
    }

    #[test]
    fn install_failure_is_environment_error() {
        let sys = FakeSys::new().failing_errno("install_signal", libc::EINVAL);
        let err = set_signal_handlers(&sys, vec![(SIGHUP, SignalAction::Ignore)]).unwrap_err();
        assert!(matches!(err, DaemonError::Environment { .. }));
    }
}
