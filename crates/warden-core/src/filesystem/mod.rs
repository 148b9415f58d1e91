//! Filesystem management for container isolation.
//!
//! Provides overlay composition and teardown, mount-table inspection and
//! root switching via `pivot_root` or `chroot`.

pub mod mount;
pub mod overlayfs;
pub mod pivot_root;
