//! Resource ledger: ordered, idempotent teardown of session artifacts.
//!
//! Every resource a session creates is appended to its [`ResourceLedger`]
//! the moment it exists. [`ResourceLedger::cleanup`] then releases them in
//! dependency order: mount points first (a mount can pin a cgroup member's
//! cwd or a scratch directory), cgroups second, scratch directories last.
//! Within each class, later records are released first.
//!
//! A scratch directory is never removed while a mount it depends on is still
//! in place: removing it recursively would reach through the live mount
//! into the layers below. Such entries are held back and reported as failed
//! until a later pass releases the mount.
//!
//! Destructive operations go through the [`Teardown`] trait so the ordering
//! and retry bookkeeping can be exercised without privileges.
//!
//! Paths owned by a live ledger are tracked in a process-wide registry; a
//! second ledger claiming the same path fails with
//! [`WardenError::PathAlreadyInUse`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use warden_common::config::RetryPolicy;
use warden_common::error::{CleanupFailure, Result, WardenError};
use warden_common::types::{ResourceRecord, SessionId};
use warden_core::cgroup;
use warden_core::filesystem::mount;

static CLAIMED_PATHS: LazyLock<Mutex<HashMap<PathBuf, SessionId>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Destructive operations the ledger performs on the host.
pub trait Teardown: Send {
    /// Unmounts `path` and everything mounted below it.
    ///
    /// # Errors
    ///
    /// Returns an error if the unmount keeps failing.
    fn unmount(&self, path: &Path) -> Result<()>;

    /// Removes the cgroup directory at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the group stays busy or cannot be removed.
    fn remove_cgroup(&self, path: &Path) -> Result<()>;

    /// Recursively removes the scratch directory at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    fn remove_dir(&self, path: &Path) -> Result<()>;
}

/// [`Teardown`] acting on the real host.
#[derive(Debug, Clone, Default)]
pub struct HostTeardown {
    retry: RetryPolicy,
}

impl HostTeardown {
    /// Creates a host teardown retrying busy mounts and groups with `retry`.
    #[must_use]
    pub const fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }
}

impl Teardown for HostTeardown {
    fn unmount(&self, path: &Path) -> Result<()> {
        mount::unmount_recursive(path, &self.retry)
    }

    fn remove_cgroup(&self, path: &Path) -> Result<()> {
        cgroup::remove_group_dir(path, &self.retry)
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WardenError::io(path, e)),
        }
    }
}

/// Result of releasing one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "kebab-case")]
pub enum Outcome {
    /// Released by this cleanup pass.
    Ok,
    /// Released by an earlier pass.
    AlreadyReleased,
    /// Release failed; the entry is retried on the next pass.
    Failed(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::AlreadyReleased => write!(f, "already released"),
            Self::Failed(detail) => write!(f, "failed: {detail}"),
        }
    }
}

/// One line of a [`CleanupReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    /// Resource identifier, e.g. `mount:/srv/merged`.
    pub resource: String,
    /// What happened to it.
    pub outcome: Outcome,
}

/// Per-resource outcome of a cleanup pass, in processing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Session the ledger belongs to.
    pub session: SessionId,
    /// Outcomes in the order the resources were processed.
    pub entries: Vec<ReportEntry>,
}

impl CleanupReport {
    /// An empty report, for sessions that never created anything.
    #[must_use]
    pub const fn empty(session: SessionId) -> Self {
        Self {
            session,
            entries: Vec::new(),
        }
    }

    /// `true` when no entry failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self
            .entries
            .iter()
            .any(|e| matches!(e.outcome, Outcome::Failed(_)))
    }

    /// Outcome recorded for `resource`, if it was processed.
    #[must_use]
    pub fn outcome_of(&self, resource: &str) -> Option<&Outcome> {
        self.entries
            .iter()
            .find(|e| e.resource == resource)
            .map(|e| &e.outcome)
    }

    /// The failed entries.
    #[must_use]
    pub fn failures(&self) -> Vec<CleanupFailure> {
        self.entries
            .iter()
            .filter_map(|e| match &e.outcome {
                Outcome::Failed(detail) => Some(CleanupFailure {
                    resource: e.resource.clone(),
                    detail: detail.clone(),
                }),
                Outcome::Ok | Outcome::AlreadyReleased => None,
            })
            .collect()
    }

    /// Converts a report with failures into an error.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::CleanupPartialFailure`] listing every failed
    /// entry.
    pub fn into_result(self) -> Result<Self> {
        let failures = self.failures();
        if failures.is_empty() {
            Ok(self)
        } else {
            Err(WardenError::CleanupPartialFailure { failures })
        }
    }

    /// Serializes the report as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug)]
struct Entry {
    record: ResourceRecord,
    released: bool,
    after: Option<ResourceRecord>,
}

/// Ordered record of the resources one session owns.
pub struct ResourceLedger {
    session: SessionId,
    entries: Vec<Entry>,
    claims: Vec<PathBuf>,
    teardown: Box<dyn Teardown>,
    cleaned: bool,
}

impl fmt::Debug for ResourceLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLedger")
            .field("session", &self.session)
            .field("entries", &self.entries)
            .field("claims", &self.claims)
            .field("cleaned", &self.cleaned)
            .finish_non_exhaustive()
    }
}

impl ResourceLedger {
    /// Creates an empty ledger releasing resources through `teardown`.
    pub fn new(session: SessionId, teardown: impl Teardown + 'static) -> Self {
        Self {
            session,
            entries: Vec::new(),
            claims: Vec::new(),
            teardown: Box::new(teardown),
            cleaned: false,
        }
    }

    /// Session this ledger belongs to.
    #[must_use]
    pub const fn session(&self) -> &SessionId {
        &self.session
    }

    /// Records in creation order.
    pub fn records(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.entries.iter().map(|e| &e.record)
    }

    /// Appends a record. The ledger owns the resource from now on.
    pub fn record(&mut self, record: ResourceRecord) {
        self.push(record, None);
    }

    /// Appends a record that is only released once `dependency` has been.
    ///
    /// Used for the scratch directories backing a mount: they must outlive
    /// the mount.
    pub fn record_after(&mut self, record: ResourceRecord, dependency: ResourceRecord) {
        self.push(record, Some(dependency));
    }

    fn push(&mut self, record: ResourceRecord, after: Option<ResourceRecord>) {
        tracing::debug!(session = %self.session, resource = %record, "resource recorded");
        self.entries.push(Entry {
            record,
            released: false,
            after,
        });
        self.cleaned = false;
    }

    /// Reserves `path` for this ledger in the process-wide registry.
    ///
    /// Claiming a path this ledger already holds is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::PathAlreadyInUse`] if another live ledger
    /// holds the path.
    pub fn claim(&mut self, path: &Path) -> Result<()> {
        let mut claimed = CLAIMED_PATHS.lock().unwrap_or_else(PoisonError::into_inner);
        match claimed.get(path) {
            Some(owner) if *owner == self.session => Ok(()),
            Some(owner) => {
                tracing::warn!(
                    path = %path.display(),
                    session = %self.session,
                    owner = %owner,
                    "path already claimed"
                );
                Err(WardenError::PathAlreadyInUse {
                    path: path.to_path_buf(),
                })
            }
            None => {
                let _ = claimed.insert(path.to_path_buf(), self.session.clone());
                self.claims.push(path.to_path_buf());
                Ok(())
            }
        }
    }

    /// Releases every recorded resource and reports the outcome of each.
    ///
    /// Every entry is attempted even after earlier failures. Entries released
    /// by a previous pass report [`Outcome::AlreadyReleased`]; failed
    /// entries are attempted again. An entry whose mount is still in place
    /// is held back without touching it. Path claims are dropped once a pass
    /// completes without failures.
    pub fn cleanup(&mut self) -> CleanupReport {
        let mut report = CleanupReport::empty(self.session.clone());
        for index in self.cleanup_order() {
            let resource = self.entries[index].record.identifier();
            let outcome = if self.entries[index].released {
                Outcome::AlreadyReleased
            } else if let Some(blocker) = self.held_by(index) {
                tracing::warn!(session = %self.session, %resource, %blocker, "release held back");
                Outcome::Failed(format!("held back: {blocker} is still mounted"))
            } else {
                match release(self.teardown.as_ref(), &self.entries[index].record) {
                    Ok(()) => {
                        self.entries[index].released = true;
                        tracing::info!(session = %self.session, %resource, "resource released");
                        Outcome::Ok
                    }
                    Err(e) => {
                        tracing::warn!(session = %self.session, %resource, error = %e, "release failed");
                        Outcome::Failed(e.to_string())
                    }
                }
            };
            report.entries.push(ReportEntry { resource, outcome });
        }

        if report.is_clean() {
            self.release_claims();
            self.cleaned = true;
        }
        report
    }

    /// Entry indices in release order.
    fn cleanup_order(&self) -> Vec<usize> {
        let class = |record: &ResourceRecord| match record {
            ResourceRecord::MountPoint(_) => 0,
            ResourceRecord::CgroupPath(_) => 1,
            ResourceRecord::TempDir(_) => 2,
            ResourceRecord::Namespace(_) => 3,
        };
        let mut order: Vec<usize> = (0..self.entries.len()).rev().collect();
        order.sort_by_key(|&i| class(&self.entries[i].record));
        order
    }

    /// The unreleased record entry `index` has to wait for: its declared
    /// dependency, or for a scratch directory any mount at or below it.
    fn held_by(&self, index: usize) -> Option<String> {
        let entry = &self.entries[index];
        let live = |record: &ResourceRecord| {
            self.entries
                .iter()
                .any(|e| !e.released && e.record == *record)
        };
        if let Some(dependency) = entry.after.as_ref().filter(|d| live(*d)) {
            return Some(dependency.identifier());
        }
        let ResourceRecord::TempDir(dir) = &entry.record else {
            return None;
        };
        self.entries
            .iter()
            .find(|e| {
                !e.released
                    && matches!(&e.record, ResourceRecord::MountPoint(target) if target.starts_with(dir))
            })
            .map(|e| e.record.identifier())
    }

    fn release_claims(&mut self) {
        if self.claims.is_empty() {
            return;
        }
        let mut claimed = CLAIMED_PATHS.lock().unwrap_or_else(PoisonError::into_inner);
        for path in self.claims.drain(..) {
            if claimed.get(&path) == Some(&self.session) {
                let _ = claimed.remove(&path);
            }
        }
    }
}

/// Releases one record; a resource that no longer exists counts as released.
fn release(teardown: &dyn Teardown, record: &ResourceRecord) -> Result<()> {
    let result = match record {
        // Namespaces die with their last process; the record is an audit entry.
        ResourceRecord::Namespace(_) => Ok(()),
        ResourceRecord::MountPoint(path) => teardown.unmount(path),
        ResourceRecord::CgroupPath(path) => teardown.remove_cgroup(path),
        ResourceRecord::TempDir(path) => teardown.remove_dir(path),
    };
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

impl Drop for ResourceLedger {
    fn drop(&mut self) {
        if !self.cleaned && self.entries.iter().any(|e| !e.released) {
            let report = self.cleanup();
            if !report.is_clean() {
                tracing::error!(
                    session = %self.session,
                    failures = report.failures().len(),
                    "ledger dropped with unreleased resources"
                );
            }
        }
        self.release_claims();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    use warden_common::types::NamespaceKind;

    use super::*;

    /// Records every call and fails the paths listed in `failing`.
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
        failing: Arc<Mutex<HashSet<PathBuf>>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn fail(&self, path: &str) {
            let _ = self.failing.lock().unwrap().insert(PathBuf::from(path));
        }

        fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }

        fn act(&self, op: &str, path: &Path) -> Result<()> {
            self.calls.lock().unwrap().push(format!("{op} {}", path.display()));
            if self.failing.lock().unwrap().contains(path) {
                Err(WardenError::GroupBusy {
                    path: path.to_path_buf(),
                    attempts: 1,
                })
            } else {
                Ok(())
            }
        }
    }

    impl Teardown for Recorder {
        fn unmount(&self, path: &Path) -> Result<()> {
            self.act("umount", path)
        }

        fn remove_cgroup(&self, path: &Path) -> Result<()> {
            self.act("rmgroup", path)
        }

        fn remove_dir(&self, path: &Path) -> Result<()> {
            self.act("rmdir", path)
        }
    }

    fn populated(recorder: &Recorder) -> ResourceLedger {
        let mount = ResourceRecord::MountPoint("/s/merged".into());
        let mut ledger = ResourceLedger::new(SessionId::generate(), recorder.clone());
        ledger.record_after(ResourceRecord::TempDir("/s/work".into()), mount.clone());
        ledger.record_after(ResourceRecord::TempDir("/s/merged".into()), mount.clone());
        ledger.record(mount);
        ledger.record(ResourceRecord::CgroupPath("/cg/warden/a".into()));
        ledger.record(ResourceRecord::Namespace(NamespaceKind::Pid));
        ledger.record(ResourceRecord::CgroupPath("/cg/warden/b".into()));
        ledger
    }

    #[test]
    fn release_order_is_mounts_then_groups_then_dirs() {
        let recorder = Recorder::default();
        let mut ledger = populated(&recorder);
        let report = ledger.cleanup();

        assert_eq!(
            recorder.calls(),
            vec![
                "umount /s/merged",
                "rmgroup /cg/warden/b",
                "rmgroup /cg/warden/a",
                "rmdir /s/merged",
                "rmdir /s/work",
            ]
        );
        assert!(report.is_clean());
        assert_eq!(report.entries.len(), 6);
        assert_eq!(report.entries.last().map(|e| e.resource.as_str()), Some("namespace:pid"));
    }

    #[test]
    fn second_cleanup_reports_already_released() {
        let recorder = Recorder::default();
        let mut ledger = populated(&recorder);
        let _ = ledger.cleanup();
        let calls = recorder.calls().len();

        let again = ledger.cleanup();
        assert_eq!(recorder.calls().len(), calls, "nothing is released twice");
        assert!(again.entries.iter().all(|e| e.outcome == Outcome::AlreadyReleased));
    }

    #[test]
    fn failures_do_not_stop_later_entries() {
        let recorder = Recorder::default();
        recorder.fail("/cg/warden/b");
        let mut ledger = populated(&recorder);
        let report = ledger.cleanup();

        assert!(!report.is_clean());
        assert!(matches!(report.outcome_of("cgroup:/cg/warden/b"), Some(Outcome::Failed(_))));
        assert_eq!(report.outcome_of("cgroup:/cg/warden/a"), Some(&Outcome::Ok));
        assert_eq!(report.outcome_of("tempdir:/s/work"), Some(&Outcome::Ok));

        let err = report.into_result().expect_err("partial failure");
        match err {
            WardenError::CleanupPartialFailure { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].resource, "cgroup:/cg/warden/b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn scratch_dirs_wait_for_a_stuck_mount() {
        let recorder = Recorder::default();
        recorder.fail("/s/merged");
        let mut ledger = populated(&recorder);
        let report = ledger.cleanup();

        assert!(matches!(report.outcome_of("mount:/s/merged"), Some(Outcome::Failed(_))));
        for dir in ["tempdir:/s/work", "tempdir:/s/merged"] {
            match report.outcome_of(dir) {
                Some(Outcome::Failed(detail)) => assert!(detail.contains("mount:/s/merged"), "{detail}"),
                other => panic!("{dir} was not held back: {other:?}"),
            }
        }
        assert_eq!(report.outcome_of("cgroup:/cg/warden/a"), Some(&Outcome::Ok));
        assert!(
            !recorder.calls().iter().any(|c| c.starts_with("rmdir")),
            "nothing is removed under a live mount: {:?}",
            recorder.calls()
        );
        assert_eq!(report.failures().len(), 3);

        recorder.heal();
        let retry = ledger.cleanup();
        assert!(retry.is_clean(), "{retry:?}");
        assert_eq!(retry.outcome_of("tempdir:/s/work"), Some(&Outcome::Ok));
        assert_eq!(recorder.calls().last().map(String::as_str), Some("rmdir /s/work"));
    }

    #[test]
    fn directory_containing_a_stuck_mount_is_held_back() {
        let recorder = Recorder::default();
        recorder.fail("/scratch/rootfs/proc");
        let mut ledger = ResourceLedger::new(SessionId::generate(), recorder.clone());
        ledger.record(ResourceRecord::TempDir("/scratch".into()));
        ledger.record(ResourceRecord::TempDir("/elsewhere".into()));
        ledger.record(ResourceRecord::MountPoint("/scratch/rootfs/proc".into()));

        let report = ledger.cleanup();
        assert!(matches!(report.outcome_of("tempdir:/scratch"), Some(Outcome::Failed(_))));
        assert_eq!(report.outcome_of("tempdir:/elsewhere"), Some(&Outcome::Ok));
        assert_eq!(recorder.calls(), vec!["umount /scratch/rootfs/proc", "rmdir /elsewhere"]);
    }

    #[test]
    fn failed_entries_are_retried() {
        let recorder = Recorder::default();
        recorder.fail("/cg/warden/a");
        let mut ledger = populated(&recorder);
        assert!(!ledger.cleanup().is_clean());

        recorder.heal();
        let retry = ledger.cleanup();
        assert!(retry.is_clean());
        assert_eq!(retry.outcome_of("cgroup:/cg/warden/a"), Some(&Outcome::Ok));
        assert_eq!(retry.outcome_of("cgroup:/cg/warden/b"), Some(&Outcome::AlreadyReleased));
    }

    #[test]
    fn drop_runs_cleanup() {
        let recorder = Recorder::default();
        drop(populated(&recorder));
        assert_eq!(recorder.calls().len(), 5);
    }

    #[test]
    fn claims_are_exclusive_until_cleanup() {
        let path = tempfile::tempdir().expect("tempdir").path().join("merged");
        let mut first = ResourceLedger::new(SessionId::generate(), Recorder::default());
        let mut second = ResourceLedger::new(SessionId::generate(), Recorder::default());

        first.claim(&path).expect("first claim");
        first.claim(&path).expect("reclaiming own path");
        assert!(matches!(
            second.claim(&path),
            Err(WardenError::PathAlreadyInUse { .. })
        ));

        let _ = first.cleanup();
        second.claim(&path).expect("released after cleanup");
    }

    #[test]
    fn dropping_a_ledger_releases_its_claims() {
        let path = tempfile::tempdir().expect("tempdir").path().join("cg");
        {
            let mut owner = ResourceLedger::new(SessionId::generate(), Recorder::default());
            owner.claim(&path).expect("claim");
        }
        let mut next = ResourceLedger::new(SessionId::generate(), Recorder::default());
        next.claim(&path).expect("claim after drop");
    }

    #[test]
    fn host_teardown_treats_missing_resources_as_released() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = HostTeardown::new(RetryPolicy::once());
        let mut ledger = ResourceLedger::new(SessionId::generate(), host);
        ledger.record(ResourceRecord::TempDir(dir.path().join("gone")));
        ledger.record(ResourceRecord::CgroupPath(dir.path().join("no-group")));
        let report = ledger.cleanup();
        assert!(report.is_clean(), "{report:?}");
    }

    #[test]
    fn host_teardown_removes_scratch_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(scratch.join("nested")).expect("mkdir");
        std::fs::write(scratch.join("nested/file"), "x").expect("write");

        let mut ledger =
            ResourceLedger::new(SessionId::generate(), HostTeardown::new(RetryPolicy::once()));
        ledger.record(ResourceRecord::TempDir(scratch.clone()));
        assert!(ledger.cleanup().is_clean());
        assert!(!scratch.exists());
    }

    /// Host teardown whose unmount always reports the target as busy.
    struct StuckMount(HostTeardown);

    impl Teardown for StuckMount {
        fn unmount(&self, path: &Path) -> Result<()> {
            Err(WardenError::MountFailed {
                target: path.to_path_buf(),
                source: std::io::Error::from_raw_os_error(libc::EBUSY),
            })
        }

        fn remove_cgroup(&self, path: &Path) -> Result<()> {
            self.0.remove_cgroup(path)
        }

        fn remove_dir(&self, path: &Path) -> Result<()> {
            self.0.remove_dir(path)
        }
    }

    #[test]
    fn host_teardown_keeps_layers_behind_a_busy_mount() {
        let dir = tempfile::tempdir().expect("tempdir");
        let merged = dir.path().join("merged");
        let work = dir.path().join("work");
        std::fs::create_dir_all(&merged).expect("mkdir");
        std::fs::create_dir_all(work.join("work")).expect("mkdir");
        std::fs::write(merged.join("keep.txt"), "user data").expect("write");

        let mount = ResourceRecord::MountPoint(merged.clone());
        let mut ledger = ResourceLedger::new(
            SessionId::generate(),
            StuckMount(HostTeardown::new(RetryPolicy::once())),
        );
        ledger.record_after(ResourceRecord::TempDir(work.clone()), mount.clone());
        ledger.record_after(ResourceRecord::TempDir(merged.clone()), mount.clone());
        ledger.record(mount);

        let report = ledger.cleanup();
        assert_eq!(report.failures().len(), 3, "{report:?}");
        assert_eq!(
            std::fs::read_to_string(merged.join("keep.txt")).expect("still there"),
            "user data"
        );
        assert!(work.join("work").is_dir());
    }

    #[test]
    fn report_serializes_with_tagged_outcomes() {
        let report = CleanupReport {
            session: SessionId::new("s-1"),
            entries: vec![
                ReportEntry {
                    resource: "mount:/m".into(),
                    outcome: Outcome::Ok,
                },
                ReportEntry {
                    resource: "cgroup:/c".into(),
                    outcome: Outcome::Failed("busy".into()),
                },
            ],
        };
        let json = report.to_json().expect("serialize");
        assert!(json.contains("\"status\": \"failed\""));
        assert!(json.contains("\"detail\": \"busy\""));
        let back: CleanupReport = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, report);
    }
}
