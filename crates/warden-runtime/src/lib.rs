//! # warden-runtime
//!
//! Session orchestration for the Warden runtime.
//!
//! A [`session::ContainerSession`] composes the overlay root filesystem,
//! creates the limiting cgroup, launches the payload into its namespaces
//! through [`process::spawn`], waits for it and tears everything down through
//! its [`ledger::ResourceLedger`].

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod ledger;
pub mod metrics;
pub mod process;
pub mod session;
pub mod telemetry;
