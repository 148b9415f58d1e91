//! User namespace isolation.
//!
//! Maps container UIDs/GIDs to host UIDs/GIDs. The maps of a freshly
//! cloned child are written by the parent while the child is still held
//! on its release pipe, so the payload never runs with an unmapped identity.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use warden_common::error::{Result, WardenError};
use warden_common::types::NamespaceKind;

/// One contiguous ID range mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    /// First ID as seen inside the namespace.
    pub inside: u32,
    /// First ID on the host.
    pub outside: u32,
    /// Number of IDs in the range.
    pub count: u32,
}

impl IdMap {
    /// Maps a single ID.
    #[must_use]
    pub const fn single(inside: u32, outside: u32) -> Self {
        Self {
            inside,
            outside,
            count: 1,
        }
    }
}

/// UID and GID mappings for a user namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMappings {
    /// Lines written to `uid_map`.
    pub uid: Vec<IdMap>,
    /// Lines written to `gid_map`.
    pub gid: Vec<IdMap>,
    /// Write `deny` to `setgroups` before `gid_map`.
    ///
    /// Required for unprivileged writers.
    pub deny_setgroups: bool,
}

/// Upper bound on lines per map file accepted by the kernel.
const MAX_MAP_LINES: usize = 340;

impl IdMappings {
    /// Maps root inside the namespace to the calling user and group.
    #[must_use]
    pub fn root_to_current_user() -> Self {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        Self {
            uid: vec![IdMap::single(0, uid)],
            gid: vec![IdMap::single(0, gid)],
            deny_setgroups: true,
        }
    }

    /// Checks the mapping ranges before anything is written.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for empty maps, zero-length ranges, or
    /// ranges that overflow the 32-bit ID space.
    pub fn validate(&self) -> Result<()> {
        for (name, maps) in [("uid", &self.uid), ("gid", &self.gid)] {
            if maps.is_empty() {
                return Err(WardenError::config(format!("{name} map is empty")));
            }
            if maps.len() > MAX_MAP_LINES {
                return Err(WardenError::config(format!(
                    "{name} map has {} lines, kernel accepts at most {MAX_MAP_LINES}",
                    maps.len()
                )));
            }
            for map in maps {
                if map.count == 0 {
                    return Err(WardenError::config(format!("{name} map range is empty")));
                }
                if map.inside.checked_add(map.count - 1).is_none()
                    || map.outside.checked_add(map.count - 1).is_none()
                {
                    return Err(WardenError::config(format!(
                        "{name} map range overflows: {} {} {}",
                        map.inside, map.outside, map.count
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Renders map lines in the `/proc/<pid>/uid_map` format.
#[must_use]
pub fn render_map(maps: &[IdMap]) -> String {
    let mut out = String::new();
    for map in maps {
        let _ = writeln!(out, "{} {} {}", map.inside, map.outside, map.count);
    }
    out
}

/// Writes UID/GID maps for the user namespace of the held child `pid`.
///
/// A child that unshares its own user namespace writes its maps through
/// [`ChildPlan`](super::setup::ChildPlan) instead.
///
/// # Errors
///
/// Returns [`WardenError::NamespaceUnavailable`] for the user namespace when
/// the kernel rejects a write; an invalid nested mapping is reported this way.
pub fn write_id_maps(pid: i32, mappings: &IdMappings) -> Result<()> {
    let base = std::path::PathBuf::from(format!("/proc/{pid}"));

    let write = |file: &str, content: &str| -> Result<()> {
        let path = base.join(file);
        std::fs::write(&path, content).map_err(|e| WardenError::NamespaceUnavailable {
            kind: NamespaceKind::User,
            reason: format!("writing {}: {e}", path.display()),
        })
    };

    write("uid_map", &render_map(&mappings.uid))?;
    if mappings.deny_setgroups && base.join("setgroups").exists() {
        write("setgroups", "deny")?;
    }
    write("gid_map", &render_map(&mappings.gid))?;

    tracing::debug!(
        pid,
        uid_ranges = mappings.uid.len(),
        gid_ranges = mappings.gid.len(),
        "wrote UID/GID map"
    );
    Ok(())
}
