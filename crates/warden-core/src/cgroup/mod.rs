//! Cgroup resource management.
//!
//! [`CgroupController`] creates per-session groups under an explicitly
//! configured hierarchy root, writes limit and membership files, reads
//! usage counters, and removes groups once their process tree is gone.
//! Both the unified (v2) and the legacy (v1) file naming are supported; see
//! [`hierarchy::HierarchyLayout`].
//!
//! Values are written verbatim in the kernel's encoding. Unit parsing is
//! available separately in [`memory::parse_size`].

pub mod cpu;
pub mod hierarchy;
pub mod memory;

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use warden_common::config::RetryPolicy;
use warden_common::error::{Result, WardenError};

use self::hierarchy::HierarchyLayout;
use crate::retry;

/// Controllers enabled for child groups on unified hierarchies, when the
/// parent offers them.
const DELEGATED_CONTROLLERS: &[&str] = &["cpu", "memory", "pids", "io"];

/// Handle to one cgroup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupHandle {
    path: PathBuf,
    layout: HierarchyLayout,
}

impl CgroupHandle {
    /// Absolute path of the group directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Layout of the hierarchy the group lives in.
    #[must_use]
    pub const fn layout(&self) -> HierarchyLayout {
        self.layout
    }
}

/// Creates, configures and destroys cgroups under one hierarchy root.
#[derive(Debug, Clone)]
pub struct CgroupController {
    root: PathBuf,
    layout: HierarchyLayout,
    retry: RetryPolicy,
}

impl CgroupController {
    /// Creates a controller for the hierarchy mounted at `root`, probing its
    /// layout.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no hierarchy is recognised at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let layout = HierarchyLayout::probe(&root)?;
        tracing::debug!(root = %root.display(), %layout, "cgroup hierarchy probed");
        Ok(Self::with_layout(root, layout))
    }

    /// Creates a controller with a known layout, skipping layout detection.
    #[must_use]
    pub fn with_layout(root: impl Into<PathBuf>, layout: HierarchyLayout) -> Self {
        Self {
            root: root.into(),
            layout,
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the retry policy used by [`destroy`](Self::destroy).
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Root of the hierarchy.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Detected layout.
    #[must_use]
    pub const fn layout(&self) -> HierarchyLayout {
        self.layout
    }

    /// Absolute path a group named `group` would have.
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless `group` is a non-empty relative
    /// path made of plain components.
    pub fn group_path(&self, group: &Path) -> Result<PathBuf> {
        let plain = group.components().all(|c| matches!(c, Component::Normal(_)));
        if group.as_os_str().is_empty() || !plain {
            return Err(WardenError::config(format!(
                "cgroup name must be a plain relative path: {}",
                group.display()
            )));
        }
        Ok(self.root.join(group))
    }

    /// Creates the group `group` (relative to the root).
    ///
    /// An existing directory is reused. On unified hierarchies the
    /// controllers in [`DELEGATED_CONTROLLERS`] are enabled on every
    /// intermediate level, best effort.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the directory cannot be created.
    pub fn create_group(&self, group: &Path) -> Result<CgroupHandle> {
        let path = self.group_path(group)?;
        std::fs::create_dir_all(&path).map_err(|e| WardenError::io(&path, e))?;

        if self.layout == HierarchyLayout::Unified {
            let mut level = self.root.clone();
            for component in group.components() {
                enable_controllers(&level);
                level.push(component);
            }
        }

        tracing::info!(path = %path.display(), layout = %self.layout, "cgroup created");
        Ok(CgroupHandle {
            path,
            layout: self.layout,
        })
    }

    /// Writes one limit. `name` uses unified naming and is translated on
    /// legacy hierarchies; `value` is written in the kernel's encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the control file is missing or rejects the value.
    pub fn set_limit(&self, handle: &CgroupHandle, name: &str, value: &str) -> Result<()> {
        for (file, v) in handle.layout.limit_writes(name, value)? {
            write_control(&handle.path.join(&file), &v)?;
            tracing::debug!(group = %handle.path.display(), file, value = v, "cgroup limit set");
        }
        Ok(())
    }

    /// Moves `pid` into the group by writing `cgroup.procs`.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.procs` fails.
    pub fn add_process(&self, handle: &CgroupHandle, pid: u32) -> Result<()> {
        write_control(&handle.path.join("cgroup.procs"), &pid.to_string())?;
        tracing::debug!(pid, group = %handle.path.display(), "added process to cgroup");
        Ok(())
    }

    /// Reads a single-value counter such as `memory.current`.
    ///
    /// `max` reads as [`u64::MAX`]. The value is an instantaneous snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or does not hold a number.
    pub fn read_usage(&self, handle: &CgroupHandle, counter: &str) -> Result<u64> {
        let path = handle.path.join(handle.layout.file_name(counter));
        let raw = std::fs::read_to_string(&path).map_err(|e| WardenError::io(&path, e))?;
        parse_counter(raw.trim()).ok_or_else(|| {
            WardenError::config(format!("{} does not hold a counter: {raw:?}", path.display()))
        })
    }

    /// Reads `key` from a flat-keyed file such as `memory.events` or `cpu.stat`.
    ///
    /// Returns `Ok(None)` when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn read_stat(&self, handle: &CgroupHandle, file: &str, key: &str) -> Result<Option<u64>> {
        let path = handle.path.join(file);
        let raw = std::fs::read_to_string(&path).map_err(|e| WardenError::io(&path, e))?;
        Ok(raw.lines().find_map(|line| {
            let mut parts = line.split_whitespace();
            (parts.next() == Some(key))
                .then(|| parts.next().and_then(parse_counter))
                .flatten()
        }))
    }

    /// PIDs currently listed in `cgroup.procs`. A missing group has none.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.procs` exists but cannot be read.
    pub fn member_pids(&self, handle: &CgroupHandle) -> Result<Vec<u32>> {
        let path = handle.path.join("cgroup.procs");
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(raw.lines().filter_map(|l| l.trim().parse().ok()).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(WardenError::io(path, e)),
        }
    }

    /// Kills every member through `cgroup.kill` where the kernel offers it.
    ///
    /// Returns `false` when the hierarchy has no `cgroup.kill` file and the
    /// caller has to signal members individually.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.kill` exists but cannot be written.
    pub fn kill_all(&self, handle: &CgroupHandle) -> Result<bool> {
        let kill = handle.path.join("cgroup.kill");
        if handle.layout != HierarchyLayout::Unified || !kill.is_file() {
            return Ok(false);
        }
        write_control(&kill, "1")?;
        tracing::info!(group = %handle.path.display(), "cgroup.kill issued");
        Ok(true)
    }

    /// Removes the group.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::GroupBusy`] if members remain after every retry.
    pub fn destroy(&self, handle: &CgroupHandle) -> Result<()> {
        remove_group_dir(&handle.path, &self.retry)
    }
}

/// Removes a cgroup directory with `rmdir(2)`, retrying while the kernel
/// reports `EBUSY`. A directory that is already gone counts as removed.
///
/// # Errors
///
/// Returns [`WardenError::GroupBusy`] when retries run out on a busy group,
/// or an I/O error for any other failure.
pub fn remove_group_dir(path: &Path, policy: &RetryPolicy) -> Result<()> {
    let outcome = retry::with_backoff(
        policy,
        || match std::fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        },
        |e| e.raw_os_error() == Some(libc::EBUSY),
    );
    match outcome {
        Ok(()) => {
            tracing::info!(path = %path.display(), "cgroup destroyed");
            Ok(())
        }
        Err(exhausted) if exhausted.last.raw_os_error() == Some(libc::EBUSY) => {
            Err(WardenError::GroupBusy {
                path: path.to_path_buf(),
                attempts: exhausted.attempts,
            })
        }
        Err(exhausted) => Err(WardenError::io(path, exhausted.last)),
    }
}

fn parse_counter(raw: &str) -> Option<u64> {
    if raw == memory::UNLIMITED {
        Some(u64::MAX)
    } else {
        raw.parse().ok()
    }
}

/// Writes a control file without creating or truncating it.
fn write_control(path: &Path, value: &str) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| WardenError::io(path, e))?;
    file.write_all(value.as_bytes())
        .map_err(|e| WardenError::io(path, e))
}

/// Enables the delegated controllers `dir` offers for its children.
fn enable_controllers(dir: &Path) {
    let Ok(available) = std::fs::read_to_string(dir.join("cgroup.controllers")) else {
        return;
    };
    let wanted: Vec<String> = available
        .split_whitespace()
        .filter(|c| DELEGATED_CONTROLLERS.contains(c))
        .map(|c| format!("+{c}"))
        .collect();
    if wanted.is_empty() {
        return;
    }
    let control = dir.join("cgroup.subtree_control");
    if let Err(e) = write_control(&control, &wanted.join(" ")) {
        tracing::warn!(path = %control.display(), error = %e, "could not enable cgroup controllers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a fake unified hierarchy and a pre-populated group directory,
    /// the way the kernel materialises control files on `mkdir`.
    fn fake_unified() -> (tempfile::TempDir, CgroupController) {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("cgroup.controllers"), "cpu memory pids").expect("write");
        std::fs::write(dir.path().join("cgroup.subtree_control"), "").expect("write");
        let controller = CgroupController::new(dir.path()).expect("controller");
        (dir, controller)
    }

    fn populate(handle: &CgroupHandle, files: &[(&str, &str)]) {
        for (name, content) in files {
            std::fs::write(handle.path().join(name), content).expect("populate");
        }
    }

    #[test]
    fn create_group_rejects_escaping_names() {
        let (_dir, controller) = fake_unified();
        assert!(controller.create_group(Path::new("../escape")).is_err());
        assert!(controller.create_group(Path::new("/abs")).is_err());
        assert!(controller.create_group(Path::new("")).is_err());
    }

    #[test]
    fn create_group_enables_controllers_on_parent() {
        let (dir, controller) = fake_unified();
        let handle = controller.create_group(Path::new("warden/s1")).expect("create");
        assert!(handle.path().is_dir());
        let subtree =
            std::fs::read_to_string(dir.path().join("cgroup.subtree_control")).expect("read");
        assert_eq!(subtree, "+cpu +memory +pids");
    }

    #[test]
    fn limits_and_membership_are_written_verbatim() {
        let (_dir, controller) = fake_unified();
        let handle = controller.create_group(Path::new("s2")).expect("create");
        populate(&handle, &[("memory.max", "max"), ("cgroup.procs", "")]);

        controller
            .set_limit(&handle, "memory.max", "100000000")
            .expect("set limit");
        controller.add_process(&handle, 4242).expect("add");

        let limit = std::fs::read_to_string(handle.path().join("memory.max")).expect("read");
        assert_eq!(limit, "100000000");
        assert_eq!(controller.member_pids(&handle).expect("members"), vec![4242]);
    }

    #[test]
    fn missing_control_file_is_an_error() {
        let (_dir, controller) = fake_unified();
        let handle = controller.create_group(Path::new("s3")).expect("create");
        assert!(controller.set_limit(&handle, "memory.max", "1").is_err());
    }

    #[test]
    fn legacy_layout_reads_translated_counter() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("tasks"), "").expect("write");
        let controller = CgroupController::new(dir.path()).expect("controller");
        assert_eq!(controller.layout(), HierarchyLayout::Legacy);

        let handle = controller.create_group(Path::new("s4")).expect("create");
        populate(&handle, &[("memory.usage_in_bytes", "12345\n"), ("memory.limit_in_bytes", "")]);
        assert_eq!(controller.read_usage(&handle, "memory.current").expect("read"), 12_345);

        controller.set_limit(&handle, "memory.max", "max").expect("set");
        let limit =
            std::fs::read_to_string(handle.path().join("memory.limit_in_bytes")).expect("read");
        assert_eq!(limit, "-1");
    }

    #[test]
    fn keyed_stat_lookup() {
        let (_dir, controller) = fake_unified();
        let handle = controller.create_group(Path::new("s5")).expect("create");
        populate(&handle, &[("memory.events", "low 0\nhigh 0\nmax 7\noom 1\noom_kill 1\n")]);
        assert_eq!(
            controller.read_stat(&handle, "memory.events", "oom_kill").expect("read"),
            Some(1)
        );
        assert_eq!(
            controller.read_stat(&handle, "memory.events", "absent").expect("read"),
            None
        );
    }

    #[test]
    fn unlimited_counter_reads_as_max() {
        let (_dir, controller) = fake_unified();
        let handle = controller.create_group(Path::new("s6")).expect("create");
        populate(&handle, &[("memory.max", "max\n")]);
        assert_eq!(controller.read_usage(&handle, "memory.max").expect("read"), u64::MAX);
    }

    #[test]
    fn destroy_is_idempotent() {
        let (_dir, controller) = fake_unified();
        let handle = controller.create_group(Path::new("s7")).expect("create");
        controller.destroy(&handle).expect("first destroy");
        assert!(!handle.path().exists());
        controller.destroy(&handle).expect("second destroy is a no-op");
    }

    #[test]
    fn kill_all_requires_cgroup_kill() {
        let (_dir, controller) = fake_unified();
        let handle = controller.create_group(Path::new("s8")).expect("create");
        assert!(!controller.kill_all(&handle).expect("no file"));
        populate(&handle, &[("cgroup.kill", "")]);
        assert!(controller.kill_all(&handle).expect("written"));
    }
}
