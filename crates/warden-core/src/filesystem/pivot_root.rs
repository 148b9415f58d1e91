//! Root filesystem switching.
//!
//! `pivot_root(2)` is preferred: it moves the root mount itself, so the old
//! root can be detached and is unreachable afterwards. `chroot(2)` only
//! changes the process's view of `/` and is kept for sessions that have no
//! mount namespace.
//!
//! Both run in the cloned child before exec and take prepared
//! NUL-terminated paths; they neither allocate nor log.

use std::ffi::CStr;

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::stat::Mode;

use crate::namespace::setup::{SetupStep, StepFailure};

fn step(step: SetupStep) -> impl Fn(Errno) -> StepFailure {
    move |errno| StepFailure::new(step, errno)
}

/// Makes `new_root` the root of the calling process's mount namespace.
///
/// `new_root` is bind-mounted onto itself first, because `pivot_root(2)`
/// requires the new root to be a mount point. The old root is parked at
/// `put_old` (inside `new_root`), then detached through `old_root`, its path
/// after the pivot, and the directory removed.
///
/// # Errors
///
/// Returns the step that failed and its errno.
pub fn pivot_root(new_root: &CStr, put_old: &CStr, old_root: &CStr) -> Result<(), StepFailure> {
    mount(
        Some(new_root),
        new_root,
        None::<&CStr>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&CStr>,
    )
    .map_err(step(SetupStep::BindRoot))?;

    match nix::unistd::mkdir(put_old, Mode::from_bits_truncate(0o700)) {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(e) => return Err(StepFailure::new(SetupStep::OldRootDir, e)),
    }

    nix::unistd::pivot_root(new_root, put_old).map_err(step(SetupStep::PivotRoot))?;
    nix::unistd::chdir(c"/").map_err(step(SetupStep::ChangeDir))?;

    umount2(old_root, MntFlags::MNT_DETACH).map_err(step(SetupStep::DetachOldRoot))?;
    // SAFETY: `old_root` is NUL-terminated and outlives the call.
    Errno::result(unsafe { libc::rmdir(old_root.as_ptr()) }).map_err(step(SetupStep::RemoveOldRoot))?;
    Ok(())
}

/// Changes the root directory of the calling process to `new_root`.
///
/// # Errors
///
/// Returns the step that failed and its errno.
pub fn chroot(new_root: &CStr) -> Result<(), StepFailure> {
    nix::unistd::chroot(new_root).map_err(step(SetupStep::Chroot))?;
    nix::unistd::chdir(c"/").map_err(step(SetupStep::ChangeDir))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chroot_into_missing_directory_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = std::ffi::CString::new(
            dir.path().join("absent").into_os_string().into_encoded_bytes(),
        )
        .expect("cstr");
        let err = chroot(&missing).expect_err("missing root");
        assert_eq!(err.step, SetupStep::Chroot);
    }
}
