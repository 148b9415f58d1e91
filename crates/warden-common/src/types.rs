//! Domain primitive types used across the Warden workspace.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Unique identifier for a container session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a session ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random session ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A kernel namespace type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NamespaceKind {
    /// Process ID space.
    Pid,
    /// Network stack.
    Network,
    /// Mount table.
    Mount,
    /// Hostname and domain name.
    Uts,
    /// System V IPC and POSIX message queues.
    Ipc,
    /// UID/GID space.
    User,
}

impl NamespaceKind {
    /// Every namespace kind, in the order the kernel documents them.
    pub const ALL: [Self; 6] = [
        Self::Pid,
        Self::Network,
        Self::Mount,
        Self::Uts,
        Self::Ipc,
        Self::User,
    ];

    /// Name of the kind's entry under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Network => "net",
            Self::Mount => "mnt",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::User => "user",
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pid => "pid",
            Self::Network => "network",
            Self::Mount => "mount",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::User => "user",
        };
        f.write_str(name)
    }
}

/// How a session reacts when a requested namespace is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// Any unavailable namespace aborts the launch.
    #[default]
    Strict,
    /// Unavailable namespaces are dropped with a warning.
    BestEffort,
}

impl std::str::FromStr for IsolationMode {
    type Err = crate::error::WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "best-effort" | "best_effort" | "besteffort" => Ok(Self::BestEffort),
            other => Err(crate::error::WardenError::config(format!(
                "unknown isolation mode: {other}"
            ))),
        }
    }
}

/// Lifecycle state of a container session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Nothing has been created yet.
    Idle,
    /// The overlay root filesystem is mounted (or none was requested).
    LayersComposed,
    /// The limiting cgroup exists (or none was requested).
    GroupCreated,
    /// The child process is running.
    Launched,
    /// The child process tree has exited.
    Exited,
    /// Every recorded resource went through teardown.
    CleanedUp,
}

impl SessionState {
    /// The only state this one may advance to, if any.
    #[must_use]
    pub const fn successor(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::LayersComposed),
            Self::LayersComposed => Some(Self::GroupCreated),
            Self::GroupCreated => Some(Self::Launched),
            Self::Launched => Some(Self::Exited),
            Self::Exited => Some(Self::CleanedUp),
            Self::CleanedUp => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::LayersComposed => write!(f, "layers-composed"),
            Self::GroupCreated => write!(f, "group-created"),
            Self::Launched => write!(f, "launched"),
            Self::Exited => write!(f, "exited"),
            Self::CleanedUp => write!(f, "cleaned-up"),
        }
    }
}

/// A resource created during a session and owned by its ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceRecord {
    /// A namespace the session's process tree lives in. Audit only.
    Namespace(NamespaceKind),
    /// Absolute path of a cgroup directory.
    CgroupPath(PathBuf),
    /// A mount target.
    MountPoint(PathBuf),
    /// A scratch directory removed recursively on cleanup.
    TempDir(PathBuf),
}

impl ResourceRecord {
    /// Filesystem path backing the record, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Namespace(_) => None,
            Self::CgroupPath(p) | Self::MountPoint(p) | Self::TempDir(p) => Some(p),
        }
    }

    /// Stable identifier used as the key of cleanup reports.
    #[must_use]
    pub fn identifier(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ResourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace(kind) => write!(f, "namespace:{kind}"),
            Self::CgroupPath(p) => write!(f, "cgroup:{}", p.display()),
            Self::MountPoint(p) => write!(f, "mount:{}", p.display()),
            Self::TempDir(p) => write!(f, "tempdir:{}", p.display()),
        }
    }
}
