//! Resource usage snapshots.
//!
//! Reads the session's cgroup counters after the payload exited and before
//! the group is destroyed. Counters a hierarchy does not offer are `None`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_common::error::Result;
use warden_core::cgroup::hierarchy::HierarchyLayout;
use warden_core::cgroup::{CgroupController, CgroupHandle};

/// Snapshot of a session's resource usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Memory charged to the group, in bytes.
    pub memory_current: u64,
    /// Highest memory charge observed, in bytes.
    pub memory_peak: Option<u64>,
    /// Number of processes the OOM killer terminated in the group.
    pub oom_kills: Option<u64>,
    /// Total CPU time consumed, in microseconds.
    pub cpu_usage_usec: Option<u64>,
    /// When the counters were read.
    pub taken_at: DateTime<Utc>,
}

impl UsageSnapshot {
    /// Reads the counters of `handle`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current memory charge cannot be read; the
    /// optional counters are skipped when missing.
    pub fn capture(controller: &CgroupController, handle: &CgroupHandle) -> Result<Self> {
        let memory_current = controller.read_usage(handle, "memory.current")?;
        let memory_peak = controller.read_usage(handle, "memory.peak").ok();
        let events = match handle.layout() {
            HierarchyLayout::Unified => "memory.events",
            HierarchyLayout::Legacy => "memory.oom_control",
        };
        let oom_kills = controller.read_stat(handle, events, "oom_kill").ok().flatten();
        let cpu_usage_usec = controller
            .read_stat(handle, "cpu.stat", "usage_usec")
            .ok()
            .flatten();

        let snapshot = Self {
            memory_current,
            memory_peak,
            oom_kills,
            cpu_usage_usec,
            taken_at: Utc::now(),
        };
        tracing::debug!(
            group = %handle.path().display(),
            memory_current,
            ?memory_peak,
            ?oom_kills,
            "usage captured"
        );
        Ok(snapshot)
    }

    /// Whether the OOM killer fired in the group.
    #[must_use]
    pub fn oom_killed(&self) -> bool {
        self.oom_kills.is_some_and(|n| n > 0)
    }
}
