//! Process environment and privilege changes.
//!
//! Each function wraps one privileged call and turns an OS failure into
//! [`DaemonError::Environment`], keeping the original error as the source.

use std::path::Path;

use tracing::debug;

use crate::error::{DaemonError, DaemonResult};
use crate::sys::{gid_t, uid_t, Resource, ResourceLimit, Sys};

/// Changes the working directory of this process.
pub fn change_working_directory<S: Sys + ?Sized>(sys: &S, directory: &Path) -> DaemonResult<()> {
    sys.chdir(directory)
        .map_err(|e| DaemonError::environment("Unable to change working directory", e))
}

/// Makes `directory` the root of this process's filesystem view.
///
/// The working directory is moved into `directory` first so that no handle
/// to the old tree remains reachable through `.`.
pub fn change_root_directory<S: Sys + ?Sized>(sys: &S, directory: &Path) -> DaemonResult<()> {
    sys.chdir(directory)
        .map_err(|e| DaemonError::environment("Unable to change root directory", e))?;
    sys.chroot(directory)
        .map_err(|e| DaemonError::environment("Unable to change root directory", e))
}

/// Sets the file creation mask of this process.
pub fn change_file_creation_mask<S: Sys + ?Sized>(sys: &S, mask: u32) -> DaemonResult<()> {
    sys.umask(mask)
        .map_err(|e| DaemonError::environment("Unable to change file creation mask", e))
}

/// Changes the owning user and group of this process.
///
/// Group changes need the privilege of the original user, so the user id is
/// always set last. With `initgroups`, the supplementary groups of the user
/// database entry for `uid` are installed first; when there is no such entry
/// only the primary group is set.
pub fn change_process_owner<S: Sys + ?Sized>(
    sys: &S,
    uid: uid_t,
    gid: gid_t,
    initgroups: bool,
) -> DaemonResult<()> {
    let groups_failed = |e| DaemonError::environment("Unable to change process owner", e);
    if initgroups {
        match sys.user_name(uid) {
            Some(user) => {
                debug!(%user, gid, "initializing supplementary groups");
                sys.initgroups(&user, gid).map_err(groups_failed)?;
            }
            None => debug!(uid, "no user database entry, skipping initgroups"),
        }
    }
    sys.setgid(gid).map_err(groups_failed)?;
    sys.setuid(uid)
        .map_err(|e| DaemonError::environment("Unable to change process owner", e))
}

/// Sets the core dump size limit to zero, so a crash leaves no memory image
/// behind.
pub fn prevent_core_dump<S: Sys + ?Sized>(sys: &S) -> DaemonResult<()> {
    let current = sys.getrlimit(Resource::Core).map_err(|e| {
        DaemonError::environment("System does not support RLIMIT_CORE resource limit", e)
    })?;
    debug!(?current, "disabling core dumps");
    sys.setrlimit(Resource::Core, ResourceLimit::ZERO)
        .map_err(|e| DaemonError::environment("Unable to set RLIMIT_CORE resource limit", e))
}
