//! Container sessions: one isolated process tree with its filesystem view
//! and resource limits.
//!
//! A [`ContainerSession`] walks a strictly forward state machine:
//!
//! ```text
//! Idle -> LayersComposed -> GroupCreated -> Launched -> Exited -> CleanedUp
//! ```
//!
//! Every step runs even when it has nothing to do. Each resource is handed
//! to the session's [`ResourceLedger`] as soon as it exists, and any failure
//! after that point goes straight to cleanup.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use warden_common::config::WardenConfig;
use warden_common::error::{Result, WardenError};
use warden_common::types::{IsolationMode, NamespaceKind, ResourceRecord, SessionId, SessionState};
use warden_core::cgroup::{CgroupController, CgroupHandle};
use warden_core::filesystem::overlayfs::{LayerStack, MountHandle, OverlayMount};
use warden_core::namespace::NamespaceSpec;

use crate::ledger::{CleanupReport, HostTeardown, ResourceLedger, Teardown};
use crate::metrics::UsageSnapshot;
use crate::process::{
    self, CancelToken, Child, ExitStatus, Interruption, Payload, SpawnRequest, StdioConfig,
    WaitOptions, WaitResult,
};

/// A cgroup to create for the session and the limits to write into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupLimit {
    /// Group path relative to the configured cgroup parent.
    pub group: PathBuf,
    /// Limit files and kernel-native values, written in order.
    pub limits: Vec<(String, String)>,
}

impl CgroupLimit {
    /// A group without limits.
    pub fn new(group: impl Into<PathBuf>) -> Self {
        Self {
            group: group.into(),
            limits: Vec::new(),
        }
    }

    /// Adds a limit, e.g. `("memory.max", "100000000")`.
    #[must_use]
    pub fn limit(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.limits.push((name.into(), value.into()));
        self
    }
}

/// Everything a session needs to run one payload.
#[derive(Debug)]
pub struct ContainerSpec {
    /// Namespaces to create.
    pub namespaces: NamespaceSpec,
    /// Optional resource limits.
    pub cgroup: Option<CgroupLimit>,
    /// Optional layered root filesystem.
    pub layers: Option<LayerStack>,
    /// What runs inside.
    pub payload: Payload,
    /// Standard stream wiring.
    pub stdio: StdioConfig,
    /// Upper bound on the payload's runtime.
    pub timeout: Option<Duration>,
    /// External cancellation.
    pub cancel: Option<CancelToken>,
}

impl ContainerSpec {
    /// A spec running `payload` in `namespaces`, without limits or layers.
    #[must_use]
    pub fn new(namespaces: NamespaceSpec, payload: Payload) -> Self {
        Self {
            namespaces,
            cgroup: None,
            layers: None,
            payload,
            stdio: StdioConfig::default(),
            timeout: None,
            cancel: None,
        }
    }

    /// Sets the cgroup and its limits.
    #[must_use]
    pub fn cgroup(mut self, limit: CgroupLimit) -> Self {
        self.cgroup = Some(limit);
        self
    }

    /// Sets the layered root filesystem.
    #[must_use]
    pub fn layers(mut self, stack: LayerStack) -> Self {
        self.layers = Some(stack);
        self
    }

    /// Sets stdio wiring.
    #[must_use]
    pub fn stdio(mut self, stdio: StdioConfig) -> Self {
        self.stdio = stdio;
        self
    }

    /// Sets the runtime limit.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Result of a session that ran its payload.
#[derive(Debug)]
pub struct SessionOutcome {
    /// Session identifier.
    pub id: SessionId,
    /// How the payload ended.
    pub exit: ExitStatus,
    /// Set when the payload was stopped by timeout or cancellation.
    pub interrupted: Option<Interruption>,
    /// Cgroup counters read after exit, when a group was used.
    pub usage: Option<UsageSnapshot>,
    /// Namespaces the payload actually ran in.
    pub namespaces: Vec<NamespaceKind>,
    /// Teardown report. Check [`CleanupReport::is_clean`].
    pub cleanup: CleanupReport,
}

/// A session that failed; teardown already ran.
#[derive(Debug)]
pub struct SessionFailure {
    /// What went wrong.
    pub error: WardenError,
    /// What teardown did.
    pub cleanup: CleanupReport,
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        let failures = self.cleanup.failures();
        if !failures.is_empty() {
            write!(f, " ({} resource(s) left behind)", failures.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for SessionFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Starts the payload; [`process::spawn`] outside of tests.
type Launcher =
    fn(SpawnRequest<'_>, Box<dyn FnOnce(u32) -> Result<()> + '_>) -> Result<Child>;

fn host_launcher(
    request: SpawnRequest<'_>,
    on_held: Box<dyn FnOnce(u32) -> Result<()> + '_>,
) -> Result<Child> {
    process::spawn(request, on_held)
}

/// Orchestrates one container run.
#[derive(Debug)]
pub struct ContainerSession {
    id: SessionId,
    config: WardenConfig,
    state: SessionState,
    spec: Option<ContainerSpec>,
    ledger: ResourceLedger,
    overlay: OverlayMount,
    mount: Option<MountHandle>,
    controller: Option<CgroupController>,
    group: Option<CgroupHandle>,
    child: Option<Child>,
    namespaces: Vec<NamespaceKind>,
    launcher: Launcher,
}

impl ContainerSession {
    /// Creates a session tearing down through the host.
    ///
    /// # Errors
    ///
    /// Returns a configuration or overlay error if `spec` or `config` is
    /// invalid. Nothing is created on the host.
    pub fn new(spec: ContainerSpec, config: WardenConfig) -> Result<Self> {
        let teardown = HostTeardown::new(config.retry);
        Self::with_teardown(spec, config, teardown)
    }

    /// Creates a session with a custom [`Teardown`].
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_teardown(
        spec: ContainerSpec,
        config: WardenConfig,
        teardown: impl Teardown + 'static,
    ) -> Result<Self> {
        config.validate()?;
        spec.namespaces.validate()?;
        if let Some(layers) = &spec.layers {
            layers.validate()?;
        }
        if let Some(limit) = &spec.cgroup {
            let relative = Path::new(&config.cgroup_parent).join(&limit.group);
            if limit.group.as_os_str().is_empty()
                || limit.group.is_absolute()
                || relative.components().any(|c| !matches!(c, std::path::Component::Normal(_)))
            {
                return Err(WardenError::config(format!(
                    "cgroup group must be a plain relative path: {}",
                    limit.group.display()
                )));
            }
        }

        let id = SessionId::generate();
        tracing::debug!(session = %id, "session created");
        Ok(Self {
            ledger: ResourceLedger::new(id.clone(), teardown),
            overlay: OverlayMount::new(config.retry),
            id,
            config,
            state: SessionState::Idle,
            spec: Some(spec),
            mount: None,
            controller: None,
            group: None,
            child: None,
            namespaces: Vec::new(),
            launcher: host_launcher,
        })
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether `launch` has taken the spec, i.e. host resources may exist.
    const fn started(&self) -> bool {
        self.spec.is_none()
    }

    /// The session's ledger.
    #[must_use]
    pub const fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Moves to `next`, which must be the current state's successor.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::InvalidTransition`] for any other target.
    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        if self.state.successor() != Some(next) {
            return Err(WardenError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(session = %self.id, from = %self.state, to = %next, "session state advanced");
        self.state = next;
        Ok(())
    }

    /// Runs the session to completion: compose, create group, launch, wait,
    /// snapshot usage, clean up.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionFailure`] carrying the first error and the report
    /// of the cleanup that followed it.
    pub fn launch(&mut self) -> std::result::Result<SessionOutcome, SessionFailure> {
        let Some(mut spec) = self.spec.take() else {
            return Err(SessionFailure {
                error: WardenError::InvalidTransition {
                    from: self.state.to_string(),
                    to: SessionState::LayersComposed.to_string(),
                },
                cleanup: CleanupReport::empty(self.id.clone()),
            });
        };
        tracing::info!(session = %self.id, "session launching");

        match self.run(&mut spec) {
            Ok((exit, interrupted, usage)) => {
                let cleanup = self.cleanup();
                if !cleanup.is_clean() {
                    tracing::warn!(session = %self.id, "session left resources behind");
                }
                tracing::info!(session = %self.id, %exit, "session finished");
                Ok(SessionOutcome {
                    id: self.id.clone(),
                    exit,
                    interrupted,
                    usage,
                    namespaces: self.namespaces.clone(),
                    cleanup,
                })
            }
            Err(error) => {
                tracing::warn!(session = %self.id, state = %self.state, error = %error, "session failed");
                let cleanup = self.cleanup();
                Err(SessionFailure { error, cleanup })
            }
        }
    }

    fn run(
        &mut self,
        spec: &mut ContainerSpec,
    ) -> Result<(ExitStatus, Option<Interruption>, Option<UsageSnapshot>)> {
        self.compose_layers(spec.layers.as_ref())?;
        self.advance(SessionState::LayersComposed)?;

        self.create_group(spec.cgroup.as_ref())?;
        self.advance(SessionState::GroupCreated)?;

        self.launch_child(spec)?;
        self.advance(SessionState::Launched)?;

        let (exit, interrupted) = self.wait_child(spec)?;
        self.advance(SessionState::Exited)?;

        let usage = self.capture_usage();
        Ok((exit, interrupted, usage))
    }

    fn compose_layers(&mut self, layers: Option<&LayerStack>) -> Result<()> {
        let Some(stack) = layers else {
            return Ok(());
        };
        self.ledger.claim(&stack.merged)?;
        let handle = self.overlay.compose(stack)?;
        let mount = ResourceRecord::MountPoint(handle.merged().to_path_buf());
        for dir in handle.created_dirs() {
            self.ledger
                .record_after(ResourceRecord::TempDir(dir.clone()), mount.clone());
        }
        self.ledger.record(mount);
        self.mount = Some(handle);
        Ok(())
    }

    fn create_group(&mut self, limit: Option<&CgroupLimit>) -> Result<()> {
        let Some(limit) = limit else {
            return Ok(());
        };
        let controller =
            CgroupController::new(&self.config.cgroup_root)?.with_retry(self.config.retry);
        let relative = Path::new(&self.config.cgroup_parent).join(&limit.group);
        self.ledger.claim(&controller.group_path(&relative)?)?;

        let handle = controller.create_group(&relative)?;
        self.ledger
            .record(ResourceRecord::CgroupPath(handle.path().to_path_buf()));
        for (name, value) in &limit.limits {
            controller.set_limit(&handle, name, value)?;
        }
        self.controller = Some(controller);
        self.group = Some(handle);
        Ok(())
    }

    fn launch_child(&mut self, spec: &mut ContainerSpec) -> Result<()> {
        let rootfs = self.mount.as_ref().map(|m| m.merged().to_path_buf());
        let mut namespaces = spec.namespaces.clone();
        loop {
            let directive = namespaces.build(rootfs.as_deref())?;
            let request = SpawnRequest {
                directive: &directive,
                payload: &mut spec.payload,
                stdio: &spec.stdio,
                stack_size: self.config.child_stack_size,
            };
            let controller = self.controller.as_ref();
            let group = self.group.as_ref();
            let spawned = (self.launcher)(
                request,
                Box::new(move |pid| match (controller, group) {
                    (Some(c), Some(g)) => c.add_process(g, pid),
                    _ => Ok(()),
                }),
            );

            match spawned {
                Ok(child) => {
                    self.namespaces = directive.kinds().iter().copied().collect();
                    for kind in &self.namespaces {
                        self.ledger.record(ResourceRecord::Namespace(*kind));
                    }
                    self.child = Some(child);
                    break;
                }
                Err(WardenError::NamespaceUnavailable { kind, reason })
                    if self.config.isolation_mode == IsolationMode::BestEffort
                        && namespaces.contains(kind)
                        && namespaces.kinds().len() > 1 =>
                {
                    tracing::warn!(
                        session = %self.id,
                        %kind,
                        %reason,
                        "namespace unavailable, continuing without it"
                    );
                    namespaces = namespaces.without(kind);
                }
                Err(e) => return Err(e),
            }
        }
        // The child holds its own copies of the stdio descriptors now.
        spec.stdio = StdioConfig::default();
        Ok(())
    }

    fn wait_child(&mut self, spec: &ContainerSpec) -> Result<(ExitStatus, Option<Interruption>)> {
        let options = WaitOptions {
            timeout: spec.timeout,
            cancel: spec.cancel.clone(),
            poll: self.config.wait_poll(),
        };
        let group = self.controller.as_ref().zip(self.group.as_ref());
        let Some(child) = self.child.as_mut() else {
            return Err(WardenError::ProcessLaunchFailed {
                message: "no child to wait for".into(),
            });
        };

        let (exit, interrupted) = match child.wait(&options)? {
            WaitResult::Exited(status) => (status, None),
            WaitResult::Interrupted(reason) => {
                tracing::warn!(session = %self.id, ?reason, pid = child.pid(), "payload interrupted");
                let status =
                    child.terminate(group, self.config.kill_grace(), self.config.wait_poll())?;
                (status, Some(reason))
            }
        };
        if let Some((controller, handle)) = group {
            let killed = process::kill_stragglers(controller, handle)?;
            if killed > 0 {
                tracing::debug!(session = %self.id, killed, "group stragglers killed");
            }
        }
        Ok((exit, interrupted))
    }

    fn capture_usage(&self) -> Option<UsageSnapshot> {
        let (controller, handle) = self.controller.as_ref().zip(self.group.as_ref())?;
        match UsageSnapshot::capture(controller, handle) {
            Ok(usage) => Some(usage),
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "usage snapshot unavailable");
                None
            }
        }
    }

    /// Tears down everything the session created.
    ///
    /// Reachable from every state. A running payload is terminated first.
    /// A session that was never launched has created nothing: the report is
    /// empty and the state stays `Idle`. Once launched, the session always
    /// ends in `CleanedUp` with its path claims released, even if it failed
    /// before reaching `LayersComposed`. After the first call, further calls
    /// report every entry as already released.
    pub fn cleanup(&mut self) -> CleanupReport {
        if !self.started() && self.ledger.records().next().is_none() {
            return CleanupReport::empty(self.id.clone());
        }
        self.stop_child();
        let report = self.ledger.cleanup();
        self.mount = None;
        self.group = None;
        if self.state != SessionState::CleanedUp {
            tracing::info!(session = %self.id, from = %self.state, clean = report.is_clean(), "session cleaned up");
        }
        self.state = SessionState::CleanedUp;
        report
    }

    fn stop_child(&mut self) {
        let group = self.controller.as_ref().zip(self.group.as_ref());
        if let Some(child) = self.child.as_mut() {
            if child.status().is_none() {
                if let Err(e) =
                    child.terminate(group, self.config.kill_grace(), self.config.wait_poll())
                {
                    tracing::warn!(session = %self.id, error = %e, "could not stop payload");
                }
            }
        }
        if let Some((controller, handle)) = group {
            if let Err(e) = process::kill_stragglers(controller, handle) {
                tracing::warn!(session = %self.id, error = %e, "could not kill group members");
            }
        }
    }
}

impl Drop for ContainerSession {
    fn drop(&mut self) {
        if self.state != SessionState::CleanedUp && self.started() {
            let _ = self.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use warden_common::config::RetryPolicy;

    use super::*;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Teardown for Recorder {
        fn unmount(&self, path: &Path) -> Result<()> {
            self.0.lock().unwrap().push(format!("umount {}", path.display()));
            Ok(())
        }

        fn remove_cgroup(&self, path: &Path) -> Result<()> {
            self.0.lock().unwrap().push(format!("rmgroup {}", path.display()));
            HostTeardown::new(RetryPolicy::once()).remove_cgroup(path)
        }

        fn remove_dir(&self, path: &Path) -> Result<()> {
            self.0.lock().unwrap().push(format!("rmdir {}", path.display()));
            Ok(())
        }
    }

    fn fake_cgroup_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("cgroup.controllers"), "memory").expect("write");
        dir
    }

    fn config(root: &Path) -> WardenConfig {
        WardenConfig {
            cgroup_root: root.to_path_buf(),
            retry: RetryPolicy::once(),
            kill_grace_ms: 200,
            wait_poll_ms: 5,
            ..WardenConfig::default()
        }
    }

    fn user_spec(payload: Payload) -> ContainerSpec {
        ContainerSpec::new(NamespaceSpec::new([NamespaceKind::User]), payload)
    }

    #[test]
    fn invalid_namespace_spec_rejected_at_construction() {
        let spec = ContainerSpec::new(NamespaceSpec::new([]), Payload::callback(|| 0));
        assert!(ContainerSession::new(spec, WardenConfig::default()).is_err());
    }

    #[test]
    fn invalid_layers_rejected_at_construction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stack = LayerStack::new(
            Vec::<PathBuf>::new(),
            dir.path().join("upper"),
            dir.path().join("work"),
            dir.path().join("merged"),
        );
        let spec = user_spec(Payload::callback(|| 0)).layers(stack);
        let err = ContainerSession::new(spec, WardenConfig::default()).expect_err("no lowers");
        assert!(matches!(err, WardenError::InvalidOverlayConfig { .. }));
        assert!(!dir.path().join("work").exists());
    }

    #[test]
    fn escaping_group_rejected_at_construction() {
        let spec = user_spec(Payload::callback(|| 0)).cgroup(CgroupLimit::new("../host"));
        assert!(ContainerSession::new(spec, WardenConfig::default()).is_err());
    }

    #[test]
    fn transitions_cannot_skip_states() {
        let mut session =
            ContainerSession::new(user_spec(Payload::callback(|| 0)), WardenConfig::default())
                .expect("session");
        let err = session
            .advance(SessionState::Launched)
            .expect_err("skipping is rejected");
        assert!(matches!(err, WardenError::InvalidTransition { .. }));
        session.advance(SessionState::LayersComposed).expect("forward step");
        assert!(session.advance(SessionState::Idle).is_err());
    }

    #[test]
    fn cleanup_from_idle_is_a_no_op() {
        let mut session =
            ContainerSession::new(user_spec(Payload::callback(|| 0)), WardenConfig::default())
                .expect("session");
        let report = session.cleanup();
        assert!(report.entries.is_empty());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn failure_after_group_creation_cleans_the_group() {
        let root = fake_cgroup_root();
        let recorder = Recorder::default();
        // The fake group has no memory.max file, so writing the limit fails.
        let spec = user_spec(Payload::callback(|| 0))
            .cgroup(CgroupLimit::new("limit-fails").limit("memory.max", "100000000"));
        let mut session =
            ContainerSession::with_teardown(spec, config(root.path()), recorder.clone())
                .expect("session");

        let failure = session.launch().expect_err("limit write fails");
        assert!(matches!(failure.error, WardenError::Io { .. }));
        let group = root.path().join("warden/limit-fails");
        assert_eq!(
            failure.cleanup.outcome_of(&format!("cgroup:{}", group.display())),
            Some(&crate::ledger::Outcome::Ok)
        );
        assert!(!group.exists());
        assert_eq!(session.state(), SessionState::CleanedUp);
        assert_eq!(
            recorder.0.lock().unwrap().clone(),
            vec![format!("rmgroup {}", group.display())]
        );

        let again = session.cleanup();
        assert!(again
            .entries
            .iter()
            .all(|e| e.outcome == crate::ledger::Outcome::AlreadyReleased));
    }

    #[test]
    fn failure_before_layers_composed_still_releases_the_claim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lower = dir.path().join("lower");
        let upper = dir.path().join("upper");
        std::fs::create_dir_all(&lower).expect("mkdir");
        std::fs::create_dir_all(&upper).expect("mkdir");
        let merged = dir.path().join("merged");
        let stack = LayerStack::new([lower], upper.clone(), dir.path().join("work"), merged.clone());
        let spec = user_spec(Payload::callback(|| 0)).layers(stack);
        let mut session =
            ContainerSession::with_teardown(spec, WardenConfig::default(), Recorder::default())
                .expect("session");

        std::fs::remove_dir(&upper).expect("rmdir");
        let failure = session.launch().expect_err("upper is gone");
        assert!(matches!(failure.error, WardenError::InvalidOverlayConfig { .. }));
        assert!(failure.cleanup.is_clean());
        assert_eq!(session.state(), SessionState::CleanedUp);

        let mut other = ResourceLedger::new(SessionId::generate(), Recorder::default());
        other.claim(&merged).expect("claim was released");
    }

    /// Launcher that refuses network namespaces and starts everything else.
    fn refuse_network(
        request: SpawnRequest<'_>,
        on_held: Box<dyn FnOnce(u32) -> Result<()> + '_>,
    ) -> Result<Child> {
        if request.directive.kinds().contains(&NamespaceKind::Network) {
            return Err(WardenError::NamespaceUnavailable {
                kind: NamespaceKind::Network,
                reason: "EPERM".into(),
            });
        }
        host_launcher(request, on_held)
    }

    fn user_and_network(mode: IsolationMode) -> ContainerSession {
        let spec = ContainerSpec::new(
            NamespaceSpec::new([NamespaceKind::User, NamespaceKind::Network]),
            Payload::callback(|| 0),
        );
        let config = WardenConfig {
            isolation_mode: mode,
            ..config(Path::new("/sys/fs/cgroup"))
        };
        let mut session = ContainerSession::new(spec, config).expect("session");
        session.launcher = refuse_network;
        session
    }

    #[test]
    fn strict_mode_fails_on_unavailable_namespace() {
        let mut session = user_and_network(IsolationMode::Strict);
        let failure = session.launch().expect_err("network refused");
        assert!(matches!(
            failure.error,
            WardenError::NamespaceUnavailable {
                kind: NamespaceKind::Network,
                ..
            }
        ));
        assert!(failure.cleanup.is_clean());
        assert_eq!(session.state(), SessionState::CleanedUp);
    }

    #[test]
    fn best_effort_keeps_the_last_namespace_mandatory() {
        let spec = ContainerSpec::new(
            NamespaceSpec::new([NamespaceKind::Network]),
            Payload::callback(|| 0),
        );
        let config = WardenConfig {
            isolation_mode: IsolationMode::BestEffort,
            ..config(Path::new("/sys/fs/cgroup"))
        };
        let mut session = ContainerSession::new(spec, config).expect("session");
        session.launcher = refuse_network;
        let failure = session.launch().expect_err("nothing left to drop");
        assert!(matches!(failure.error, WardenError::NamespaceUnavailable { .. }));
    }

    #[test]
    fn best_effort_runs_without_the_refused_namespace() {
        if warden_core::namespace::probe(NamespaceKind::User).is_err() {
            return;
        }
        let mut session = user_and_network(IsolationMode::BestEffort);
        let outcome = session.launch().expect("launch");
        assert_eq!(outcome.exit, ExitStatus::Exited(0));
        assert_eq!(outcome.namespaces, vec![NamespaceKind::User]);
        assert_eq!(outcome.cleanup.outcome_of("namespace:net"), None);
        assert_eq!(session.state(), SessionState::CleanedUp);
    }

    #[test]
    fn second_launch_is_rejected() {
        let root = fake_cgroup_root();
        let spec = user_spec(Payload::callback(|| 0))
            .cgroup(CgroupLimit::new("twice").limit("memory.max", "1"));
        let mut session =
            ContainerSession::with_teardown(spec, config(root.path()), Recorder::default())
                .expect("session");
        let _ = session.launch();
        let failure = session.launch().expect_err("spec was consumed");
        assert!(matches!(failure.error, WardenError::InvalidTransition { .. }));
    }

    #[test]
    fn user_namespace_session_runs_callback() {
        if warden_core::namespace::probe(NamespaceKind::User).is_err() {
            return;
        }
        let mut session = ContainerSession::new(
            user_spec(Payload::callback(|| 5)),
            config(Path::new("/sys/fs/cgroup")),
        )
        .expect("session");
        let outcome = session.launch().expect("launch");
        assert_eq!(outcome.exit, ExitStatus::Exited(5));
        assert_eq!(outcome.namespaces, vec![NamespaceKind::User]);
        assert!(outcome.usage.is_none());
        assert_eq!(
            outcome.cleanup.outcome_of("namespace:user"),
            Some(&crate::ledger::Outcome::Ok)
        );
    }

    #[test]
    fn timeout_terminates_the_payload() {
        if warden_core::namespace::probe(NamespaceKind::User).is_err() {
            return;
        }
        let spec = user_spec(Payload::command(["sleep", "30"])).timeout(Duration::from_millis(50));
        let mut session =
            ContainerSession::new(spec, config(Path::new("/sys/fs/cgroup"))).expect("session");
        let outcome = session.launch().expect("launch");
        assert_eq!(outcome.interrupted, Some(Interruption::TimedOut));
        assert!(!outcome.exit.success());
    }
}
