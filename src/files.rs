//! Closing inherited file descriptors.
//!
//! A daemon must not keep descriptors its parent happened to leave open. The
//! whole descriptor space up to the hard limit is closed, except for an
//! exclusion set, using as few bulk close requests as possible.

use std::fmt;
use std::ops::Range;
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::debug;

use crate::error::{DaemonError, DaemonResult};
use crate::sys::{Resource, Sys};

/// Upper bound used when the platform reports no limit on open descriptors.
pub const MAXFD: RawFd = 2048;

/// The identity of a preserved descriptor.
///
/// Descriptors to keep often arrive from loosely typed configuration, so the
/// value is checked before any descriptor is closed; only [`Descriptor::Int`]
/// is accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    Int(i64),
    Float(f64),
    Text(String),
    Absent,
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descriptor::Int(n) => write!(f, "{n}"),
            Descriptor::Float(x) => write!(f, "{x}"),
            Descriptor::Text(s) => write!(f, "'{s}'"),
            Descriptor::Absent => f.write_str("None"),
        }
    }
}

impl From<RawFd> for Descriptor {
    fn from(fd: RawFd) -> Self {
        Descriptor::Int(i64::from(fd))
    }
}

impl From<f64> for Descriptor {
    fn from(value: f64) -> Self {
        Descriptor::Float(value)
    }
}

impl From<&str> for Descriptor {
    fn from(value: &str) -> Self {
        Descriptor::Text(value.to_owned())
    }
}

impl From<Option<RawFd>> for Descriptor {
    fn from(fd: Option<RawFd>) -> Self {
        fd.map_or(Descriptor::Absent, Descriptor::from)
    }
}

/// An entry of the set of files that must survive daemonization.
#[derive(Debug, Clone, PartialEq)]
pub enum Preserve {
    /// Keep the descriptor with this identity open.
    Descriptor(Descriptor),
    /// A stream with no descriptor of its own. It is kept by identity and
    /// never takes part in closing by number.
    Unnumbered(String),
}

impl Preserve {
    /// Keeps the descriptor behind any open file, socket or pipe.
    pub fn file<F: AsRawFd + ?Sized>(file: &F) -> Self {
        Preserve::Descriptor(Descriptor::from(file.as_raw_fd()))
    }
}

impl From<RawFd> for Preserve {
    fn from(fd: RawFd) -> Self {
        Preserve::Descriptor(Descriptor::from(fd))
    }
}

impl From<Descriptor> for Preserve {
    fn from(descriptor: Descriptor) -> Self {
        Preserve::Descriptor(descriptor)
    }
}

/// Returns the hard limit on open descriptors, or [`MAXFD`] when the
/// platform reports it as unlimited.
pub fn get_maximum_file_descriptors<S: Sys + ?Sized>(sys: &S) -> DaemonResult<RawFd> {
    let limit = sys.getrlimit(Resource::OpenFiles).map_err(|e| {
        DaemonError::environment("Unable to read RLIMIT_NOFILE resource limit", e)
    })?;
    Ok(match limit.hard {
        None => MAXFD,
        Some(hard) => RawFd::try_from(hard).unwrap_or(RawFd::MAX),
    })
}

fn validate(exclude: &[Preserve]) -> DaemonResult<Vec<i64>> {
    let mut numbers = Vec::with_capacity(exclude.len());
    for entry in exclude {
        match entry {
            Preserve::Descriptor(Descriptor::Int(n)) => numbers.push(*n),
            Preserve::Descriptor(other) => {
                return Err(DaemonError::Validation {
                    value: other.to_string(),
                })
            }
            Preserve::Unnumbered(_) => {}
        }
    }
    Ok(numbers)
}

/// Splits `[0, maxfd)` into the maximal ranges that hold no excluded
/// descriptor.
///
/// Excluded numbers outside the range and duplicates are tolerated. Any
/// excluded entry without integer identity is rejected before a range is
/// produced.
pub fn candidate_file_descriptor_ranges(
    exclude: &[Preserve],
    maxfd: RawFd,
) -> DaemonResult<Vec<Range<RawFd>>> {
    let mut cuts: Vec<RawFd> = validate(exclude)?
        .into_iter()
        .filter(|n| (0..i64::from(maxfd)).contains(n))
        .map(|n| n as RawFd)
        .collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut ranges = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for cut in cuts.into_iter().chain(std::iter::once(maxfd)) {
        if start < cut {
            ranges.push(start..cut);
        }
        start = cut.saturating_add(1);
    }
    Ok(ranges)
}

fn is_not_open(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EBADF)
}

/// Closes `fd`, ignoring the error for a descriptor that was not open.
pub fn close_file_descriptor_if_open<S: Sys + ?Sized>(sys: &S, fd: RawFd) -> DaemonResult<()> {
    match sys.close(fd) {
        Err(e) if !is_not_open(&e) => Err(DaemonError::environment(
            format!("Failed to close file descriptor {fd}"),
            e,
        )),
        _ => Ok(()),
    }
}

/// Issues one bulk close request per range, in the given order.
pub fn close_file_descriptor_ranges<S: Sys + ?Sized>(
    sys: &S,
    ranges: &[Range<RawFd>],
) -> DaemonResult<()> {
    for range in ranges {
        match sys.close_range(range.clone()) {
            Err(e) if !is_not_open(&e) => {
                return Err(DaemonError::environment(
                    format!(
                        "Failed to close file descriptors {}..{}",
                        range.start, range.end
                    ),
                    e,
                ))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Closes every open descriptor except those in `exclude`.
pub fn close_all_open_files<S: Sys + ?Sized>(sys: &S, exclude: &[Preserve]) -> DaemonResult<()> {
    // Validate before asking the platform anything.
    validate(exclude)?;
    let maxfd = get_maximum_file_descriptors(sys)?;
    let ranges = candidate_file_descriptor_ranges(exclude, maxfd)?;
    debug!(maxfd, ranges = ranges.len(), "closing inherited descriptors");
    close_file_descriptor_ranges(sys, &ranges)
}
