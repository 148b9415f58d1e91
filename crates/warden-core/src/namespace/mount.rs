//! Mount namespace isolation.
//!
//! Gives the container its own mount table. Propagation is switched to
//! private first so nothing the container mounts leaks back to the host.

use nix::mount::{MsFlags, mount};

/// Marks every mount in the current mount namespace as recursively private.
///
/// Runs in the cloned child, so it neither allocates nor logs.
///
/// # Errors
///
/// Returns the errno of the remount.
pub fn make_mounts_private() -> nix::Result<()> {
    mount(
        None::<&std::ffi::CStr>,
        c"/",
        None::<&std::ffi::CStr>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&std::ffi::CStr>,
    )
}
