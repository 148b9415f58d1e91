//! Mount-table inspection and unmount helpers.
//!
//! The mount table is read from `/proc/self/mountinfo`. Mount points there
//! are octal-escaped (`\040` for a space); [`parse_mountinfo`] undoes that.

use std::ffi::CStr;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::stat::Mode;
use warden_common::config::RetryPolicy;
use warden_common::error::{Result, WardenError};

use crate::namespace::setup::{SetupStep, StepFailure};
use crate::retry;

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Mount points listed in a `mountinfo` document, in table order.
#[must_use]
pub fn parse_mountinfo(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape(field)))
        .collect()
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Current mount points of the calling process.
///
/// # Errors
///
/// Returns an I/O error if the mount table cannot be read.
pub fn mount_points() -> Result<Vec<PathBuf>> {
    let content = std::fs::read_to_string(MOUNTINFO).map_err(|e| WardenError::io(MOUNTINFO, e))?;
    Ok(parse_mountinfo(&content))
}

/// Mount points strictly below `target`, deepest first.
///
/// # Errors
///
/// Returns an I/O error if the mount table cannot be read.
pub fn mounts_under(target: &Path) -> Result<Vec<PathBuf>> {
    Ok(nested_in(&mount_points()?, target))
}

/// Filters `table` to the entries strictly below `target`, deepest first.
///
/// Entries at the same depth come out in reverse mount order, so stacked
/// mounts are listed once per layer, topmost first.
#[must_use]
pub fn nested_in(table: &[PathBuf], target: &Path) -> Vec<PathBuf> {
    let mut nested: Vec<PathBuf> = table
        .iter()
        .rev()
        .filter(|p| p.as_path() != target && p.starts_with(target))
        .cloned()
        .collect();
    nested.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    nested
}

/// Whether `path` is currently a mount point.
///
/// # Errors
///
/// Returns an I/O error if the mount table cannot be read.
pub fn is_mount_point(path: &Path) -> Result<bool> {
    Ok(mount_points()?.iter().any(|p| p == path))
}

/// Unmounts `target`, retrying while it is busy.
///
/// A target that is not mounted (`EINVAL`) or does not exist (`ENOENT`)
/// counts as unmounted.
///
/// # Errors
///
/// Returns [`WardenError::MountFailed`] once retries run out or on any
/// other failure.
pub fn unmount_with_retry(target: &Path, policy: &RetryPolicy) -> Result<()> {
    let outcome = retry::with_backoff(
        policy,
        || match umount2(target, MntFlags::empty()) {
            Ok(()) | Err(Errno::EINVAL | Errno::ENOENT) => Ok(()),
            Err(e) => Err(e),
        },
        |e| *e == Errno::EBUSY,
    );
    match outcome {
        Ok(()) => {
            tracing::debug!(target = %target.display(), "unmounted");
            Ok(())
        }
        Err(exhausted) => {
            tracing::warn!(
                target = %target.display(),
                attempts = exhausted.attempts,
                error = %exhausted.last,
                "unmount failed"
            );
            Err(WardenError::MountFailed {
                target: target.to_path_buf(),
                source: exhausted.last.into(),
            })
        }
    }
}

/// Unmounts every mount below `target` deepest-first, then `target` itself.
///
/// # Errors
///
/// Returns the first unmount failure; mounts above it stay in place.
pub fn unmount_recursive(target: &Path, policy: &RetryPolicy) -> Result<()> {
    for nested in mounts_under(target)? {
        unmount_with_retry(&nested, policy)?;
    }
    unmount_with_retry(target, policy)
}

/// Mounts a fresh `proc` filesystem at `target`, creating the directory if
/// needed.
///
/// Runs in the cloned child before exec, so it neither allocates nor logs.
///
/// # Errors
///
/// Returns the step that failed and its errno.
pub fn mount_proc(target: &CStr) -> std::result::Result<(), StepFailure> {
    match nix::unistd::mkdir(target, Mode::from_bits_truncate(0o555)) {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(e) => return Err(StepFailure::new(SetupStep::ProcDir, e)),
    }
    mount(
        Some(c"proc"),
        target,
        Some(c"proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        None::<&CStr>,
    )
    .map_err(|e| StepFailure::new(SetupStep::MountProc, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
35 22 0:31 / /srv/merged rw,relatime - overlay overlay rw,lowerdir=/a,upperdir=/b,workdir=/c
36 35 0:5 / /srv/merged/proc rw - proc proc rw
37 35 0:32 / /srv/merged/mnt/with\\040space rw - tmpfs tmpfs rw
38 22 0:33 / /srv/merged-other rw - tmpfs tmpfs rw
";

    #[test]
    fn mountinfo_fields_are_unescaped() {
        let table = parse_mountinfo(SAMPLE);
        assert_eq!(table.len(), 5);
        assert_eq!(table[3], PathBuf::from("/srv/merged/mnt/with space"));
    }

    #[test]
    fn nested_mounts_deepest_first() {
        let table = parse_mountinfo(SAMPLE);
        let nested = nested_in(&table, Path::new("/srv/merged"));
        assert_eq!(
            nested,
            vec![
                PathBuf::from("/srv/merged/mnt/with space"),
                PathBuf::from("/srv/merged/proc"),
            ]
        );
    }

    #[test]
    fn sibling_prefix_is_not_nested() {
        let table = parse_mountinfo(SAMPLE);
        assert!(!nested_in(&table, Path::new("/srv/merged")).contains(&PathBuf::from("/srv/merged-other")));
    }

    #[test]
    fn root_is_a_mount_point() {
        assert!(is_mount_point(Path::new("/")).expect("mountinfo readable"));
    }
}
