//! Detection of the cgroup hierarchy flavour and file-name translation.
//!
//! The layout is decided by looking at the files present under the
//! configured root, never by the kernel version.

use std::fmt;
use std::path::Path;

use warden_common::error::{Result, WardenError};

use super::cpu::CpuMax;
use super::memory;

/// File naming convention of a cgroup hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HierarchyLayout {
    /// cgroup v2: `memory.max`, `memory.current`, `cpu.max`, ...
    Unified,
    /// cgroup v1 controller hierarchy: `memory.limit_in_bytes`, ...
    Legacy,
}

/// Unified → legacy file names with a one-to-one value mapping.
const LEGACY_NAMES: &[(&str, &str)] = &[
    ("memory.max", "memory.limit_in_bytes"),
    ("memory.current", "memory.usage_in_bytes"),
    ("memory.peak", "memory.max_usage_in_bytes"),
    ("memory.high", "memory.soft_limit_in_bytes"),
];

impl HierarchyLayout {
    /// Probes the hierarchy mounted at `root`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `root` looks like neither layout.
    pub fn probe(root: &Path) -> Result<Self> {
        if root.join("cgroup.controllers").is_file() {
            return Ok(Self::Unified);
        }
        let legacy_markers = ["memory.limit_in_bytes", "memory.usage_in_bytes", "tasks"];
        if legacy_markers.iter().any(|m| root.join(m).is_file()) {
            return Ok(Self::Legacy);
        }
        Err(WardenError::config(format!(
            "no cgroup hierarchy recognised at {}",
            root.display()
        )))
    }

    /// Translates a limit into the files and values to write, in order.
    ///
    /// Names without a legacy equivalent pass through unchanged, so callers
    /// can also address controller files directly.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed `cpu.max` values.
    pub fn limit_writes(self, name: &str, value: &str) -> Result<Vec<(String, String)>> {
        match self {
            Self::Unified => Ok(vec![(name.to_string(), value.to_string())]),
            Self::Legacy if name == "cpu.max" => Ok(CpuMax::parse(value)?
                .to_legacy()
                .into_iter()
                .map(|(file, v)| (file.to_string(), v))
                .collect()),
            Self::Legacy => {
                let file = self.file_name(name);
                let value = if file.starts_with("memory.") {
                    memory::to_legacy_value(value)
                } else {
                    value.to_string()
                };
                Ok(vec![(file, value)])
            }
        }
    }

    /// Name of the file holding `name` in this layout.
    #[must_use]
    pub fn file_name(self, name: &str) -> String {
        match self {
            Self::Unified => name.to_string(),
            Self::Legacy => LEGACY_NAMES
                .iter()
                .find(|(unified, _)| *unified == name)
                .map_or_else(|| name.to_string(), |(_, legacy)| (*legacy).to_string()),
        }
    }
}

impl fmt::Display for HierarchyLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unified => write!(f, "unified"),
            Self::Legacy => write!(f, "legacy"),
        }
    }
}
