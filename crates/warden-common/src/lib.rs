//! # warden-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the Warden workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the primitives that the isolation layer
//! (`warden-core`) and the session orchestrator (`warden-runtime`) build on.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
