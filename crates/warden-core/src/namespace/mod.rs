//! Linux namespace management for container isolation.
//!
//! A [`NamespaceSpec`] declares which namespaces a session wants and how the
//! child enters them. [`NamespaceSpec::build`] turns it into a
//! [`LaunchDirective`]: the combined `clone(2)` flags, the actions the parent
//! performs while the child is held (UID/GID maps), and the ordered actions
//! the child performs before its payload runs.
//!
//! Namespaces are always created at or before child creation. With
//! [`LaunchStrategy::CloneTime`] the child is born inside them. With
//! [`LaunchStrategy::UnshareThenFork`] the child unshares and forks once more,
//! because a new PID namespace only applies to processes created after the
//! `unshare(2)` call.

pub mod mount;
pub mod setup;
pub mod user;
pub mod uts;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use nix::sched::CloneFlags;
use warden_common::error::{Result, WardenError};
use warden_common::types::NamespaceKind;

use self::user::IdMappings;

/// Returns the `clone(2)`/`unshare(2)` flag that creates `kind`.
#[must_use]
pub const fn clone_flag(kind: NamespaceKind) -> CloneFlags {
    match kind {
        NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
        NamespaceKind::Network => CloneFlags::CLONE_NEWNET,
        NamespaceKind::Mount => CloneFlags::CLONE_NEWNS,
        NamespaceKind::Uts => CloneFlags::CLONE_NEWUTS,
        NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
        NamespaceKind::User => CloneFlags::CLONE_NEWUSER,
    }
}

/// How the child process enters its namespaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// Namespaces are requested in the `clone(2)` call itself.
    #[default]
    CloneTime,
    /// The child calls `unshare(2)`, then forks the process that runs the payload.
    UnshareThenFork,
}

/// How the child switches to the composed root filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RootSwitch {
    /// `pivot_root(2)`; requires a mount namespace.
    #[default]
    PivotRoot,
    /// `chroot(2)`; works without a mount namespace.
    Chroot,
}

/// An action the child performs after entering its namespaces and before
/// its payload runs.
///
/// Actions are declarative; [`setup::ChildPlan`] prepares them for the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreExecAction {
    /// `sethostname(2)` inside the UTS namespace.
    SetHostname(String),
    /// Make every mount recursively private.
    MakeMountsPrivate,
    /// Switch the root filesystem to `new_root`.
    SwitchRoot {
        /// Merged overlay directory.
        new_root: PathBuf,
        /// Root switch method.
        method: RootSwitch,
    },
    /// Mount a fresh `proc` at `/proc`.
    MountProc,
    /// `chdir(2)` into the given directory.
    ChangeDir(PathBuf),
}

/// Declarative description of the namespaces a session creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceSpec {
    kinds: BTreeSet<NamespaceKind>,
    hostname: Option<String>,
    id_mappings: Option<IdMappings>,
    strategy: LaunchStrategy,
    root_switch: RootSwitch,
    mount_proc: bool,
    workdir: Option<PathBuf>,
}

impl NamespaceSpec {
    /// Creates a spec for the given kinds with default per-kind settings.
    #[must_use]
    pub fn new(kinds: impl IntoIterator<Item = NamespaceKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            hostname: None,
            id_mappings: None,
            strategy: LaunchStrategy::default(),
            root_switch: RootSwitch::default(),
            mount_proc: true,
            workdir: None,
        }
    }

    /// Hostname applied inside the UTS namespace.
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// UID/GID mappings for the user namespace.
    #[must_use]
    pub fn id_mappings(mut self, mappings: IdMappings) -> Self {
        self.id_mappings = Some(mappings);
        self
    }

    /// Selects the launch strategy.
    #[must_use]
    pub const fn strategy(mut self, strategy: LaunchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Selects the root switch method used when a root filesystem is given.
    #[must_use]
    pub const fn root_switch(mut self, method: RootSwitch) -> Self {
        self.root_switch = method;
        self
    }

    /// Whether a fresh `/proc` is mounted when both PID and mount
    /// namespaces are requested. Enabled by default.
    #[must_use]
    pub const fn mount_proc(mut self, enabled: bool) -> Self {
        self.mount_proc = enabled;
        self
    }

    /// Working directory of the payload, relative to the new root.
    #[must_use]
    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// The requested namespace kinds.
    #[must_use]
    pub const fn kinds(&self) -> &BTreeSet<NamespaceKind> {
        &self.kinds
    }

    /// Whether `kind` is requested.
    #[must_use]
    pub fn contains(&self, kind: NamespaceKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Returns a copy without `kind` and without the configuration that
    /// only makes sense inside it.
    #[must_use]
    pub fn without(&self, kind: NamespaceKind) -> Self {
        let mut reduced = self.clone();
        let _ = reduced.kinds.remove(&kind);
        match kind {
            NamespaceKind::Uts => reduced.hostname = None,
            NamespaceKind::User => reduced.id_mappings = None,
            NamespaceKind::Mount => reduced.root_switch = RootSwitch::Chroot,
            NamespaceKind::Pid | NamespaceKind::Network | NamespaceKind::Ipc => {}
        }
        reduced
    }

    /// OR-combination of the clone flags of every requested kind.
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        self.kinds
            .iter()
            .fold(CloneFlags::empty(), |acc, kind| acc | clone_flag(*kind))
    }

    /// Checks the request without touching the kernel.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the kind set is empty or per-kind
    /// configuration is given for a kind that is not requested.
    pub fn validate(&self) -> Result<()> {
        if self.kinds.is_empty() {
            return Err(WardenError::config("namespace set is empty"));
        }
        if let Some(hostname) = &self.hostname {
            if !self.contains(NamespaceKind::Uts) {
                return Err(WardenError::config("hostname requires a UTS namespace"));
            }
            uts::validate_hostname(hostname)?;
        }
        if let Some(mappings) = &self.id_mappings {
            if !self.contains(NamespaceKind::User) {
                return Err(WardenError::config("ID mappings require a user namespace"));
            }
            mappings.validate()?;
        }
        if let Some(dir) = &self.workdir {
            if !dir.is_absolute() {
                return Err(WardenError::config(format!(
                    "workdir must be absolute: {}",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Builds the launch directive, switching root to `rootfs` if given.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if [`validate`](Self::validate) fails or
    /// `pivot_root` is requested without a mount namespace.
    pub fn build(&self, rootfs: Option<&Path>) -> Result<LaunchDirective> {
        self.validate()?;

        let mut actions = Vec::new();
        if let Some(hostname) = &self.hostname {
            actions.push(PreExecAction::SetHostname(hostname.clone()));
        }
        let has_mount_ns = self.contains(NamespaceKind::Mount);
        if has_mount_ns {
            actions.push(PreExecAction::MakeMountsPrivate);
        }
        if let Some(root) = rootfs {
            if self.root_switch == RootSwitch::PivotRoot && !has_mount_ns {
                return Err(WardenError::config(
                    "pivot_root requires a mount namespace; use chroot instead",
                ));
            }
            actions.push(PreExecAction::SwitchRoot {
                new_root: root.to_path_buf(),
                method: self.root_switch,
            });
        }
        if self.mount_proc && has_mount_ns && self.contains(NamespaceKind::Pid) {
            actions.push(PreExecAction::MountProc);
        }
        match (&self.workdir, rootfs) {
            (Some(dir), _) => actions.push(PreExecAction::ChangeDir(dir.clone())),
            (None, Some(_)) => actions.push(PreExecAction::ChangeDir(PathBuf::from("/"))),
            (None, None) => {}
        }

        let directive = LaunchDirective {
            kinds: self.kinds.clone(),
            flags: self.clone_flags(),
            strategy: self.strategy,
            id_mappings: self.id_mappings.clone(),
            actions,
        };
        tracing::debug!(
            kinds = ?directive.kinds,
            strategy = ?directive.strategy,
            actions = directive.actions.len(),
            "launch directive built"
        );
        Ok(directive)
    }
}

/// Everything the process-spawn primitive needs to launch a child into its
/// namespaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchDirective {
    kinds: BTreeSet<NamespaceKind>,
    flags: CloneFlags,
    strategy: LaunchStrategy,
    id_mappings: Option<IdMappings>,
    actions: Vec<PreExecAction>,
}

impl LaunchDirective {
    /// Namespace kinds the child is launched into.
    #[must_use]
    pub const fn kinds(&self) -> &BTreeSet<NamespaceKind> {
        &self.kinds
    }

    /// Combined namespace-creation flags.
    #[must_use]
    pub const fn flags(&self) -> CloneFlags {
        self.flags
    }

    /// Launch strategy.
    #[must_use]
    pub const fn strategy(&self) -> LaunchStrategy {
        self.strategy
    }

    /// UID/GID maps to write for the child's user namespace.
    #[must_use]
    pub const fn id_mappings(&self) -> Option<&IdMappings> {
        self.id_mappings.as_ref()
    }

    /// Child-side actions, in execution order.
    #[must_use]
    pub fn actions(&self) -> &[PreExecAction] {
        &self.actions
    }
}

/// Checks whether the kernel lets this process create a `kind` namespace.
///
/// The check runs `unshare(2)` in a short-lived forked child so the caller's
/// own namespaces are untouched.
///
/// # Errors
///
/// Returns [`WardenError::NamespaceUnavailable`] naming the kind and the
/// kernel's reason.
pub fn probe(kind: NamespaceKind) -> Result<()> {
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork};

    let unavailable = |reason: String| WardenError::NamespaceUnavailable { kind, reason };

    // SAFETY: the child only calls unshare(2) and _exit(2), both
    // async-signal-safe.
    match unsafe { fork() }.map_err(|e| unavailable(format!("fork failed: {e}")))? {
        ForkResult::Child => {
            let code = match nix::sched::unshare(clone_flag(kind)) {
                Ok(()) => 0,
                Err(errno) => errno as i32,
            };
            // SAFETY: terminating the forked child without running
            // the parent's atexit handlers.
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            match waitpid(child, None).map_err(|e| unavailable(format!("waitpid failed: {e}")))? {
                WaitStatus::Exited(_, 0) => {
                    tracing::debug!(%kind, "namespace available");
                    Ok(())
                }
                WaitStatus::Exited(_, code) => {
                    Err(unavailable(nix::errno::Errno::from_raw(code).desc().to_string()))
                }
                other => Err(unavailable(format!("check child ended abnormally: {other:?}"))),
            }
        }
    }
}

/// Returns the inode identifying the `kind` namespace of `pid` (or of the
/// calling process when `pid` is `None`).
///
/// # Errors
///
/// Returns an I/O error if `/proc/<pid>/ns/<kind>` cannot be inspected.
pub fn namespace_inode(pid: Option<i32>, kind: NamespaceKind) -> Result<u64> {
    use std::os::unix::fs::MetadataExt;

    let target = pid.map_or_else(|| "self".to_string(), |p| p.to_string());
    let path = PathBuf::from(format!("/proc/{target}/ns/{}", kind.proc_name()));
    let meta = std::fs::metadata(&path).map_err(|e| WardenError::io(&path, e))?;
    Ok(meta.ino())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_every_kind() {
        let spec = NamespaceSpec::new(NamespaceKind::ALL);
        let flags = spec.clone_flags();
        for kind in NamespaceKind::ALL {
            assert!(flags.contains(clone_flag(kind)), "{kind} missing");
        }
    }

    #[test]
    fn empty_set_rejected() {
        let spec = NamespaceSpec::new([]);
        assert!(spec.build(None).is_err());
    }

    #[test]
    fn hostname_without_uts_rejected() {
        let spec = NamespaceSpec::new([NamespaceKind::Pid]).hostname("box");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn id_maps_without_user_rejected() {
        let spec =
            NamespaceSpec::new([NamespaceKind::Pid]).id_mappings(IdMappings::root_to_current_user());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn pivot_root_needs_mount_namespace() {
        let spec = NamespaceSpec::new([NamespaceKind::Pid]);
        assert!(spec.build(Some(Path::new("/tmp/merged"))).is_err());

        let chroot = spec.root_switch(RootSwitch::Chroot);
        let directive = chroot.build(Some(Path::new("/tmp/merged"))).expect("chroot ok");
        assert!(directive.actions().contains(&PreExecAction::SwitchRoot {
            new_root: PathBuf::from("/tmp/merged"),
            method: RootSwitch::Chroot,
        }));
    }

    #[test]
    fn actions_follow_dependency_order() {
        let spec = NamespaceSpec::new([NamespaceKind::Pid, NamespaceKind::Mount, NamespaceKind::Uts])
            .hostname("box");
        let directive = spec.build(Some(Path::new("/srv/merged"))).expect("build");
        assert_eq!(
            directive.actions(),
            &[
                PreExecAction::SetHostname("box".into()),
                PreExecAction::MakeMountsPrivate,
                PreExecAction::SwitchRoot {
                    new_root: PathBuf::from("/srv/merged"),
                    method: RootSwitch::PivotRoot,
                },
                PreExecAction::MountProc,
                PreExecAction::ChangeDir(PathBuf::from("/")),
            ]
        );
    }

    #[test]
    fn no_rootfs_means_no_root_switch() {
        let spec = NamespaceSpec::new([NamespaceKind::Pid]);
        let directive = spec.build(None).expect("build");
        assert!(directive.actions().is_empty());
        assert_eq!(directive.flags(), CloneFlags::CLONE_NEWPID);
        assert_eq!(directive.strategy(), LaunchStrategy::CloneTime);
    }

    #[test]
    fn proc_mount_can_be_disabled() {
        let spec = NamespaceSpec::new([NamespaceKind::Pid, NamespaceKind::Mount]).mount_proc(false);
        let directive = spec.build(None).expect("build");
        assert!(!directive.actions().contains(&PreExecAction::MountProc));
    }

    #[test]
    fn dropping_a_kind_drops_its_configuration() {
        let spec = NamespaceSpec::new([NamespaceKind::Uts, NamespaceKind::User, NamespaceKind::Mount])
            .hostname("box")
            .id_mappings(IdMappings::root_to_current_user());
        let reduced = spec.without(NamespaceKind::Uts).without(NamespaceKind::User);
        reduced.validate().expect("reduced spec stays valid");
        assert!(!reduced.contains(NamespaceKind::Uts));
        assert!(reduced.build(None).expect("build").id_mappings().is_none());

        let no_mount = spec.without(NamespaceKind::Mount);
        let directive = no_mount
            .without(NamespaceKind::Uts)
            .build(Some(Path::new("/m")))
            .expect("falls back to chroot");
        assert!(directive.actions().iter().any(|a| matches!(
            a,
            PreExecAction::SwitchRoot {
                method: RootSwitch::Chroot,
                ..
            }
        )));
    }

    #[test]
    fn relative_workdir_rejected() {
        let spec = NamespaceSpec::new([NamespaceKind::Mount]).workdir("srv");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn own_namespace_inode_is_readable() {
        let ino = namespace_inode(None, NamespaceKind::Pid).expect("proc is mounted");
        assert!(ino > 0);
    }
}
