//! Child-side setup, compiled in the parent before `clone(2)`.
//!
//! A child cloned from a multithreaded host inherits whatever locks other
//! threads held at that instant, and `clone(2)` runs no fork handlers. Until
//! it execs, the child must not allocate, log or take any lock. A
//! [`ChildPlan`] therefore holds every path as a NUL-terminated string and
//! every map file's content as ready bytes, and its run methods only issue
//! raw syscalls.
//!
//! Failures travel to the parent as a fixed [`STEP_RECORD_LEN`]-byte record
//! (see [`StepFailure::encode`]).

use std::ffi::{CStr, CString};
use std::fmt;
use std::path::Path;

use nix::errno::Errno;
use warden_common::constants::OLD_ROOT_DIR;
use warden_common::error::{Result, WardenError};
use warden_common::types::NamespaceKind;

use super::user::{IdMappings, render_map};
use super::{LaunchDirective, PreExecAction, RootSwitch, clone_flag, mount, uts};
use crate::filesystem::{mount as fs_mount, pivot_root};

/// Size of an encoded [`StepFailure`].
pub const STEP_RECORD_LEN: usize = 8;

/// A setup step the child performs before its payload starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SetupStep {
    /// Wiring stdin, stdout and stderr.
    Stdio = 1,
    /// Starting a new session.
    Setsid,
    /// `unshare(2)` of one namespace kind.
    Unshare,
    /// Writing `uid_map`.
    UidMap,
    /// Writing `setgroups`.
    SetGroups,
    /// Writing `gid_map`.
    GidMap,
    /// Forking the payload process.
    Fork,
    /// `sethostname(2)`.
    Hostname,
    /// Making mount propagation private.
    MountsPrivate,
    /// Bind-mounting the new root onto itself.
    BindRoot,
    /// Creating the directory that parks the old root.
    OldRootDir,
    /// `pivot_root(2)`.
    PivotRoot,
    /// Detaching the old root.
    DetachOldRoot,
    /// Removing the old root's directory.
    RemoveOldRoot,
    /// `chroot(2)`.
    Chroot,
    /// Creating `/proc`.
    ProcDir,
    /// Mounting `proc`.
    MountProc,
    /// `chdir(2)`.
    ChangeDir,
    /// `execvp(3)`.
    Exec,
}

impl SetupStep {
    const ALL: [Self; 19] = [
        Self::Stdio,
        Self::Setsid,
        Self::Unshare,
        Self::UidMap,
        Self::SetGroups,
        Self::GidMap,
        Self::Fork,
        Self::Hostname,
        Self::MountsPrivate,
        Self::BindRoot,
        Self::OldRootDir,
        Self::PivotRoot,
        Self::DetachOldRoot,
        Self::RemoveOldRoot,
        Self::Chroot,
        Self::ProcDir,
        Self::MountProc,
        Self::ChangeDir,
        Self::Exec,
    ];

    fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|step| *step as u8 == code)
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Setsid => "setsid",
            Self::Unshare => "unshare",
            Self::UidMap => "uid_map",
            Self::SetGroups => "setgroups",
            Self::GidMap => "gid_map",
            Self::Fork => "fork",
            Self::Hostname => "sethostname",
            Self::MountsPrivate => "mount propagation",
            Self::BindRoot => "bind new root",
            Self::OldRootDir => "old root directory",
            Self::PivotRoot => "pivot_root",
            Self::DetachOldRoot => "detach old root",
            Self::RemoveOldRoot => "remove old root directory",
            Self::Chroot => "chroot",
            Self::ProcDir => "/proc directory",
            Self::MountProc => "mount proc",
            Self::ChangeDir => "chdir",
            Self::Exec => "exec",
        }
    }
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failed setup step, as reported by the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepFailure {
    /// The step that failed.
    pub step: SetupStep,
    /// Namespace kind the step concerned, if any.
    pub kind: Option<NamespaceKind>,
    /// The kernel's error.
    pub errno: Errno,
}

impl StepFailure {
    /// A failure not tied to a namespace kind.
    #[must_use]
    pub const fn new(step: SetupStep, errno: Errno) -> Self {
        Self {
            step,
            kind: None,
            errno,
        }
    }

    /// Encodes the failure without allocating: step, kind, two padding
    /// bytes, then the errno in little-endian order.
    #[must_use]
    pub fn encode(&self) -> [u8; STEP_RECORD_LEN] {
        let kind = self.kind.map_or(0, |kind| {
            NamespaceKind::ALL
                .iter()
                .position(|k| *k == kind)
                .and_then(|i| u8::try_from(i + 1).ok())
                .unwrap_or(0)
        });
        let errno = (self.errno as i32).to_le_bytes();
        [
            self.step as u8,
            kind,
            0,
            0,
            errno[0],
            errno[1],
            errno[2],
            errno[3],
        ]
    }

    /// Decodes a record produced by [`encode`](Self::encode).
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let record: &[u8; STEP_RECORD_LEN] = bytes.try_into().ok()?;
        let step = SetupStep::from_code(record[0])?;
        let kind = match record[1] {
            0 => None,
            n => Some(*NamespaceKind::ALL.get(usize::from(n) - 1)?),
        };
        let errno = i32::from_le_bytes([record[4], record[5], record[6], record[7]]);
        Some(Self {
            step,
            kind,
            errno: Errno::from_raw(errno),
        })
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{} ({kind}): {}", self.step, self.errno.desc()),
            None => write!(f, "{}: {}", self.step, self.errno.desc()),
        }
    }
}

impl From<StepFailure> for WardenError {
    fn from(failure: StepFailure) -> Self {
        match (failure.step, failure.kind) {
            (SetupStep::Unshare, Some(kind)) => Self::NamespaceUnavailable {
                kind,
                reason: failure.errno.desc().to_string(),
            },
            (SetupStep::UidMap | SetupStep::SetGroups | SetupStep::GidMap, _) => {
                Self::NamespaceUnavailable {
                    kind: NamespaceKind::User,
                    reason: format!("writing {}: {}", failure.step, failure.errno.desc()),
                }
            }
            _ => Self::ProcessLaunchFailed {
                message: failure.to_string(),
            },
        }
    }
}

type StepResult = std::result::Result<(), StepFailure>;

/// Map files a child writes for its own user namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SelfMaps {
    uid: Vec<u8>,
    gid: Vec<u8>,
    deny_setgroups: bool,
}

/// A [`PreExecAction`] with its arguments converted for raw syscalls.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PreparedAction {
    SetHostname(String),
    MakeMountsPrivate,
    PivotRoot {
        new_root: CString,
        put_old: CString,
        old_root: CString,
    },
    Chroot(CString),
    MountProc,
    ChangeDir(CString),
}

/// Everything a child needs to enter its namespaces and prepare its view of
/// the system, prepared by the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildPlan {
    unshare: Vec<NamespaceKind>,
    self_maps: Option<SelfMaps>,
    actions: Vec<PreparedAction>,
}

fn c_path(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;

    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| WardenError::config(format!("path contains a NUL byte: {}", path.display())))
}

impl ChildPlan {
    /// Compiles `directive` for the child.
    ///
    /// `mappings` are written by the child itself under
    /// [`LaunchStrategy::UnshareThenFork`](super::LaunchStrategy); with
    /// clone-time creation the parent writes them and they are ignored here.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a path contains a NUL byte.
    pub fn new(directive: &LaunchDirective, mappings: Option<&IdMappings>) -> Result<Self> {
        let unshare = match directive.strategy() {
            super::LaunchStrategy::CloneTime => Vec::new(),
            // The user namespace goes first so the others are created with
            // its capabilities.
            super::LaunchStrategy::UnshareThenFork => {
                let kinds = directive.kinds();
                kinds
                    .iter()
                    .filter(|k| **k == NamespaceKind::User)
                    .chain(kinds.iter().filter(|k| **k != NamespaceKind::User))
                    .copied()
                    .collect()
            }
        };
        let self_maps = match (unshare.contains(&NamespaceKind::User), mappings) {
            (true, Some(maps)) => Some(SelfMaps {
                uid: render_map(&maps.uid).into_bytes(),
                gid: render_map(&maps.gid).into_bytes(),
                deny_setgroups: maps.deny_setgroups,
            }),
            _ => None,
        };

        let mut actions = Vec::with_capacity(directive.actions().len());
        for action in directive.actions() {
            actions.push(match action {
                PreExecAction::SetHostname(name) => PreparedAction::SetHostname(name.clone()),
                PreExecAction::MakeMountsPrivate => PreparedAction::MakeMountsPrivate,
                PreExecAction::SwitchRoot {
                    new_root,
                    method: RootSwitch::PivotRoot,
                } => PreparedAction::PivotRoot {
                    new_root: c_path(new_root)?,
                    put_old: c_path(&new_root.join(OLD_ROOT_DIR))?,
                    old_root: c_path(&Path::new("/").join(OLD_ROOT_DIR))?,
                },
                PreExecAction::SwitchRoot {
                    new_root,
                    method: RootSwitch::Chroot,
                } => PreparedAction::Chroot(c_path(new_root)?),
                PreExecAction::MountProc => PreparedAction::MountProc,
                PreExecAction::ChangeDir(dir) => PreparedAction::ChangeDir(c_path(dir)?),
            });
        }
        Ok(Self {
            unshare,
            self_maps,
            actions,
        })
    }

    /// Unshares the planned kinds and maps the new user namespace.
    ///
    /// # Errors
    ///
    /// Returns the first failed step.
    pub fn unshare(&self) -> StepResult {
        for kind in &self.unshare {
            nix::sched::unshare(clone_flag(*kind)).map_err(|errno| StepFailure {
                step: SetupStep::Unshare,
                kind: Some(*kind),
                errno,
            })?;
            if *kind == NamespaceKind::User {
                if let Some(maps) = &self.self_maps {
                    write_self_maps(maps)?;
                }
            }
        }
        Ok(())
    }

    /// Runs the pre-exec actions in order.
    ///
    /// # Errors
    ///
    /// Returns the first failed step.
    pub fn apply_actions(&self) -> StepResult {
        for action in &self.actions {
            match action {
                PreparedAction::SetHostname(name) => uts::set_hostname(name)
                    .map_err(|e| StepFailure::new(SetupStep::Hostname, e))?,
                PreparedAction::MakeMountsPrivate => mount::make_mounts_private()
                    .map_err(|e| StepFailure::new(SetupStep::MountsPrivate, e))?,
                PreparedAction::PivotRoot {
                    new_root,
                    put_old,
                    old_root,
                } => pivot_root::pivot_root(new_root, put_old, old_root)?,
                PreparedAction::Chroot(new_root) => pivot_root::chroot(new_root)?,
                PreparedAction::MountProc => fs_mount::mount_proc(c"/proc")?,
                PreparedAction::ChangeDir(dir) => nix::unistd::chdir(dir.as_c_str())
                    .map_err(|e| StepFailure::new(SetupStep::ChangeDir, e))?,
            }
        }
        Ok(())
    }

    /// Number of namespace kinds the child unshares itself.
    #[must_use]
    pub fn unshare_count(&self) -> usize {
        self.unshare.len()
    }
}

fn write_self_maps(maps: &SelfMaps) -> StepResult {
    write_file(c"/proc/self/uid_map", &maps.uid)
        .map_err(|e| StepFailure::new(SetupStep::UidMap, e))?;
    if maps.deny_setgroups {
        match write_file(c"/proc/self/setgroups", b"deny") {
            Ok(()) | Err(Errno::ENOENT) => {}
            Err(e) => return Err(StepFailure::new(SetupStep::SetGroups, e)),
        }
    }
    write_file(c"/proc/self/gid_map", &maps.gid).map_err(|e| StepFailure::new(SetupStep::GidMap, e))
}

/// Writes `content` to `path` in a single `write(2)`, as the kernel
/// requires for map files.
fn write_file(path: &CStr, content: &[u8]) -> nix::Result<()> {
    // SAFETY: `path` is NUL-terminated and outlives the call.
    let fd = Errno::result(unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) })?;
    // SAFETY: `content` is valid for `content.len()` bytes.
    let written = Errno::result(unsafe { libc::write(fd, content.as_ptr().cast(), content.len()) });
    // SAFETY: `fd` was opened above and is closed exactly once.
    let _ = unsafe { libc::close(fd) };
    match written {
        Ok(n) if usize::try_from(n) == Ok(content.len()) => Ok(()),
        Ok(_) => Err(Errno::EIO),
        Err(e) => Err(e),
    }
}
