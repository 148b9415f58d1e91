//! `OverlayFS` composition for layered container filesystems.
//!
//! A [`LayerStack`] stacks read-only lower layers under a single writable
//! upper layer. Lower layers are listed highest priority first: the first
//! entry shadows every later one. The upper layer always wins, and a
//! whiteout in upper hides the lower entry it names.
//!
//! [`OverlayMount::compose`] never creates the lower or upper directories;
//! it only creates `work` and `merged` when they are missing, and the
//! returned [`MountHandle`] remembers which ones so teardown removes exactly
//! those.

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::mount::{MsFlags, mount};
use warden_common::config::RetryPolicy;
use warden_common::constants::MAX_MOUNT_OPTIONS_LEN;
use warden_common::error::{Result, WardenError};

use super::mount::unmount_recursive;

/// Directories making up one overlay mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerStack {
    /// Read-only layers, highest priority first.
    pub lower: Vec<PathBuf>,
    /// Writable layer receiving every modification.
    pub upper: PathBuf,
    /// Scratch directory on the same filesystem as `upper`.
    pub work: PathBuf,
    /// Mount target presenting the merged view.
    pub merged: PathBuf,
}

impl LayerStack {
    /// Creates a stack from its four roles.
    pub fn new(
        lower: impl IntoIterator<Item = impl Into<PathBuf>>,
        upper: impl Into<PathBuf>,
        work: impl Into<PathBuf>,
        merged: impl Into<PathBuf>,
    ) -> Self {
        Self {
            lower: lower.into_iter().map(Into::into).collect(),
            upper: upper.into(),
            work: work.into(),
            merged: merged.into(),
        }
    }

    fn roles(&self) -> impl Iterator<Item = &PathBuf> {
        self.lower
            .iter()
            .chain([&self.upper, &self.work, &self.merged])
    }

    /// Checks every mount precondition without modifying anything.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::InvalidOverlayConfig`] describing the first
    /// violated precondition.
    pub fn validate(&self) -> Result<()> {
        if self.lower.is_empty() {
            return Err(WardenError::overlay("at least one lower layer is required"));
        }

        let mut seen = HashSet::new();
        for path in self.roles() {
            if !path.is_absolute() {
                return Err(WardenError::overlay(format!(
                    "path must be absolute: {}",
                    path.display()
                )));
            }
            let text = path.to_string_lossy();
            if text.contains(',') || text.contains(':') {
                return Err(WardenError::overlay(format!(
                    "path contains a reserved ',' or ':' character: {text}"
                )));
            }
            if !seen.insert(path) {
                return Err(WardenError::overlay(format!(
                    "path used for more than one role: {text}"
                )));
            }
        }

        for dir in self.lower.iter().chain([&self.upper]) {
            if !dir.is_dir() {
                return Err(WardenError::overlay(format!(
                    "layer directory does not exist: {}",
                    dir.display()
                )));
            }
        }

        if self.work.exists() {
            let mut entries = std::fs::read_dir(&self.work).map_err(|e| {
                WardenError::overlay(format!("work directory unreadable: {}: {e}", self.work.display()))
            })?;
            if entries.next().is_some() {
                return Err(WardenError::overlay(format!(
                    "work directory is not empty: {}",
                    self.work.display()
                )));
            }
        }

        let upper_dev = device_of(&self.upper)?;
        let work_dev = device_of(&self.work)?;
        if upper_dev != work_dev {
            return Err(WardenError::overlay(format!(
                "work directory {} is not on the same filesystem as upper {}",
                self.work.display(),
                self.upper.display()
            )));
        }

        let options = self.mount_options();
        if options.len() >= MAX_MOUNT_OPTIONS_LEN {
            return Err(WardenError::overlay(format!(
                "mount options are {} bytes, limit is {}",
                options.len(),
                MAX_MOUNT_OPTIONS_LEN - 1
            )));
        }
        Ok(())
    }

    /// The overlay mount data string.
    #[must_use]
    pub fn mount_options(&self) -> String {
        let lowers: Vec<String> = self
            .lower
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        format!(
            "lowerdir={},upperdir={},workdir={}",
            lowers.join(":"),
            self.upper.display(),
            self.work.display()
        )
    }
}

/// Device of `path`, or of its nearest existing ancestor.
fn device_of(path: &Path) -> Result<u64> {
    let existing = path
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("/"));
    std::fs::metadata(existing)
        .map(|m| m.dev())
        .map_err(|e| WardenError::overlay(format!("cannot stat {}: {e}", existing.display())))
}

/// A composed overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    merged: PathBuf,
    options: String,
    created: Vec<PathBuf>,
}

impl MountHandle {
    /// Mount target of the merged view.
    #[must_use]
    pub fn merged(&self) -> &Path {
        &self.merged
    }

    /// Mount data passed to the kernel.
    #[must_use]
    pub fn options(&self) -> &str {
        &self.options
    }

    /// Directories created by compose, in creation order.
    #[must_use]
    pub fn created_dirs(&self) -> &[PathBuf] {
        &self.created
    }
}

/// Performs overlay mounts and their teardown.
#[derive(Debug, Clone, Default)]
pub struct OverlayMount {
    retry: RetryPolicy,
}

impl OverlayMount {
    /// Creates a mounter retrying busy unmounts with `retry`.
    #[must_use]
    pub const fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// Validates `stack`, creates the missing `work`/`merged` directories and
    /// mounts the overlay.
    ///
    /// Directories created here are removed again if the mount fails.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::InvalidOverlayConfig`] for precondition
    /// violations and [`WardenError::MountFailed`] if the kernel rejects the
    /// mount.
    pub fn compose(&self, stack: &LayerStack) -> Result<MountHandle> {
        stack.validate()?;

        let mut created = Vec::new();
        for dir in [&stack.work, &stack.merged] {
            if dir.exists() {
                continue;
            }
            if let Err(e) = std::fs::create_dir_all(dir) {
                remove_created(&created);
                return Err(WardenError::io(dir, e));
            }
            created.push(dir.clone());
        }

        let options = stack.mount_options();
        if let Err(e) = mount(
            Some("overlay"),
            &stack.merged,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        ) {
            remove_created(&created);
            return Err(WardenError::MountFailed {
                target: stack.merged.clone(),
                source: e.into(),
            });
        }

        tracing::info!(
            merged = %stack.merged.display(),
            layers = stack.lower.len(),
            "overlay mounted"
        );
        Ok(MountHandle {
            merged: stack.merged.clone(),
            options,
            created,
        })
    }

    /// Unmounts the overlay and everything mounted below it, then removes the
    /// directories compose created.
    ///
    /// Already-unmounted targets and already-removed directories count as
    /// success.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::MountFailed`] if an unmount keeps failing; the
    /// directories are left in place in that case.
    pub fn teardown(&self, handle: &MountHandle) -> Result<()> {
        unmount_recursive(&handle.merged, &self.retry)?;
        for dir in handle.created.iter().rev() {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(WardenError::io(dir, e)),
            }
        }
        tracing::info!(merged = %handle.merged.display(), "overlay torn down");
        Ok(())
    }
}

fn remove_created(created: &[PathBuf]) {
    for dir in created.iter().rev() {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            tracing::warn!(path = %dir.display(), error = %e, "could not remove directory");
        }
    }
}
