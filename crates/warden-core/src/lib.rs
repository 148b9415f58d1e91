//! # warden-core
//!
//! Low-level Linux isolation primitives for the Warden runtime.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: PID, Mount, Network, User, IPC and UTS isolation, and
//!   the launch directive describing how a child enters them.
//! - **Cgroups**: group lifecycle, limits and usage counters on unified and
//!   legacy hierarchies.
//! - **Filesystem**: overlay composition and teardown, `pivot_root` and
//!   `chroot`.
//!
//! Every syscall wrapper returns [`warden_common::error::Result`]. The crate
//! only builds for Linux.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

#[cfg(not(target_os = "linux"))]
compile_error!("warden-core relies on Linux namespaces, cgroups and overlayfs");

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod retry;
