//! Unified error types for the Warden workspace.
//!
//! Every fallible operation in `warden-core` and `warden-runtime` returns
//! [`WardenError`]. The variants mirror the failure taxonomy of the runtime:
//! isolation, overlay, cgroup, registry, launch and teardown failures, plus
//! the ambient I/O and configuration errors.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NamespaceKind;

/// One resource that could not be released during cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    /// Identifier of the resource, as printed in the cleanup report.
    pub resource: String,
    /// Human-readable failure detail.
    pub detail: String,
}

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum WardenError {
    /// The kernel rejected a requested namespace kind.
    #[error("{kind} namespace unavailable: {reason}")]
    NamespaceUnavailable {
        /// Namespace that could not be created.
        kind: NamespaceKind,
        /// Why the kernel refused it.
        reason: String,
    },

    /// The overlay layer set violates a mount precondition.
    #[error("invalid overlay configuration: {message}")]
    InvalidOverlayConfig {
        /// Description of the violated precondition.
        message: String,
    },

    /// A cgroup still has member processes after all removal attempts.
    #[error("cgroup {path} still busy after {attempts} attempts")]
    GroupBusy {
        /// Path of the cgroup directory.
        path: PathBuf,
        /// Number of removal attempts made.
        attempts: u32,
    },

    /// A target path is owned by another live session.
    #[error("path already in use by another session: {path}")]
    PathAlreadyInUse {
        /// Contended path.
        path: PathBuf,
    },

    /// A mount or unmount syscall failed.
    #[error("mount operation on {target} failed: {source}")]
    MountFailed {
        /// Mount target.
        target: PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The child process could not be created or did not reach its payload.
    #[error("process launch failed: {message}")]
    ProcessLaunchFailed {
        /// Description of the failed launch step.
        message: String,
    },

    /// One or more resources could not be released.
    #[error("cleanup left {} resource(s) behind", failures.len())]
    CleanupPartialFailure {
        /// Per-resource failures, in cleanup order.
        failures: Vec<CleanupFailure>,
    },

    /// A session state transition was attempted out of order.
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        /// State the session was in.
        from: String,
        /// State that was requested.
        to: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl WardenError {
    /// Shorthand for an [`WardenError::Io`] with the failing path attached.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Shorthand for a [`WardenError::Config`] error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Shorthand for a [`WardenError::InvalidOverlayConfig`] error.
    pub fn overlay(message: impl Into<String>) -> Self {
        Self::InvalidOverlayConfig {
            message: message.into(),
        }
    }

    /// Returns `true` when the error represents a resource that no longer exists.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Io { source, .. } | Self::MountFailed { source, .. } => {
                source.kind() == std::io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_message_counts_failures() {
        let err = WardenError::CleanupPartialFailure {
            failures: vec![
                CleanupFailure {
                    resource: "mount:/a".into(),
                    detail: "busy".into(),
                },
                CleanupFailure {
                    resource: "cgroup:/b".into(),
                    detail: "busy".into(),
                },
            ],
        };
        assert_eq!(err.to_string(), "cleanup left 2 resource(s) behind");
    }

    #[test]
    fn not_found_detection() {
        let err = WardenError::io("/x", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(err.is_not_found());
        assert!(!WardenError::config("nope").is_not_found());
    }

    #[test]
    fn namespace_error_names_kind() {
        let err = WardenError::NamespaceUnavailable {
            kind: NamespaceKind::User,
            reason: "EPERM".into(),
        };
        assert_eq!(err.to_string(), "user namespace unavailable: EPERM");
    }
}
