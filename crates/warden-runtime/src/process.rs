//! Process spawning inside isolated namespaces.
//!
//! [`spawn`] clones a child according to a [`LaunchDirective`] and holds it
//! on a release pipe. While it is held, the parent writes the user
//! namespace ID maps and runs the caller's hook (the session uses it to put
//! the PID into its cgroup). Only then is the release byte written, so no
//! payload instruction ever runs outside the limiting group.
//!
//! Between `clone(2)` and exec the child only issues raw syscalls on data
//! prepared by the parent (a [`ChildPlan`] and the exec argument vector):
//! the host may be multithreaded, and a lock held by another thread at clone
//! time would never be released in the child. Setup failures travel back
//! over a close-on-exec status pipe as a fixed-size [`StepFailure`] record.
//! An empty status stream means the payload started.

use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sched::CloneFlags;
use nix::sys::signal::{Signal, kill, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use warden_common::error::{Result, WardenError};
use warden_common::types::NamespaceKind;
use warden_core::cgroup::{CgroupController, CgroupHandle};
use warden_core::namespace::setup::{ChildPlan, SetupStep, StepFailure};
use warden_core::namespace::user::{IdMappings, write_id_maps};
use warden_core::namespace::{self, LaunchDirective, LaunchStrategy};

/// What the child runs once its namespaces are set up.
pub enum Payload {
    /// Program and arguments, resolved through `PATH` by `execvp(3)`.
    Command(Vec<String>),
    /// In-process entry point; its return value becomes the exit code.
    ///
    /// Runs in the cloned child of a possibly multithreaded process, so it
    /// should avoid taking locks another thread may have held at clone time
    /// (the allocator included).
    Callback(Box<dyn FnMut() -> i32 + Send>),
}

impl Payload {
    /// Builds a [`Payload::Command`].
    pub fn command(argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Command(argv.into_iter().map(Into::into).collect())
    }

    /// Builds a [`Payload::Callback`].
    pub fn callback(f: impl FnMut() -> i32 + Send + 'static) -> Self {
        Self::Callback(Box::new(f))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(argv) => f.debug_tuple("Command").field(argv).finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Wiring of one standard stream.
#[derive(Debug, Default)]
pub enum Stdio {
    /// Share the parent's stream.
    #[default]
    Inherit,
    /// Use this descriptor; the parent's copy is closed after the spawn.
    Fd(OwnedFd),
}

impl Stdio {
    fn raw(&self) -> Option<RawFd> {
        match self {
            Self::Inherit => None,
            Self::Fd(fd) => Some(fd.as_raw_fd()),
        }
    }
}

/// Wiring of stdin, stdout and stderr.
#[derive(Debug, Default)]
pub struct StdioConfig {
    /// Standard input.
    pub stdin: Stdio,
    /// Standard output.
    pub stdout: Stdio,
    /// Standard error.
    pub stderr: Stdio,
}

/// Shared flag that interrupts [`Child::wait`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitStatus {
    /// Normal exit with the given code.
    Exited(i32),
    /// Terminated by the given signal number.
    Signaled(i32),
}

impl ExitStatus {
    /// `true` for a zero exit code.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Shell-style code: the exit code, or 128 plus the signal number.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => 128 + signal,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// Why a wait ended before the child exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Interruption {
    /// The timeout elapsed.
    TimedOut,
    /// The [`CancelToken`] was set.
    Cancelled,
}

/// Result of [`Child::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The child exited and has been reaped.
    Exited(ExitStatus),
    /// The wait was interrupted; the child is still running.
    Interrupted(Interruption),
}

/// Parameters of [`Child::wait`].
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Upper bound on the wait.
    pub timeout: Option<Duration>,
    /// External cancellation.
    pub cancel: Option<CancelToken>,
    /// Interval between `waitpid` polls.
    pub poll: Duration,
}

/// Everything [`spawn`] needs besides the hold hook.
///
/// Payload and stdio are borrowed so a refused launch can be retried with a
/// reduced directive. The caller closes its stdio descriptors afterwards.
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    /// Namespaces, strategy and child-side actions.
    pub directive: &'a LaunchDirective,
    /// What the child runs.
    pub payload: &'a mut Payload,
    /// Standard stream wiring.
    pub stdio: &'a StdioConfig,
    /// Size of the stack the cloned child starts on.
    pub stack_size: usize,
}

/// Argument vector for `execvp(3)`, pointer array included, built before
/// the clone.
struct ExecArgs {
    args: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl ExecArgs {
    fn new(args: &[String]) -> Result<Self> {
        if args.is_empty() {
            return Err(WardenError::config("command payload has no program"));
        }
        let args = args
            .iter()
            .map(|a| {
                CString::new(a.as_str())
                    .map_err(|_| WardenError::config(format!("argument contains a NUL byte: {a:?}")))
            })
            .collect::<Result<Vec<_>>>()?;
        // The CStrings' heap buffers do not move with the Vec.
        let ptrs = args
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        Ok(Self { args, ptrs })
    }

    fn program(&self) -> String {
        self.args
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Data the cloned child reads; prepared by the parent before `clone(2)`.
struct ChildContext<'a> {
    release_read: RawFd,
    release_write: RawFd,
    status_read: RawFd,
    status_write: RawFd,
    stdio: [(Option<RawFd>, RawFd); 3],
    strategy: LaunchStrategy,
    plan: &'a ChildPlan,
    exec: Option<&'a ExecArgs>,
}

/// A spawned, released child process.
#[derive(Debug)]
pub struct Child {
    pid: Pid,
    status: Option<ExitStatus>,
}

/// Clones a child into the directive's namespaces and releases it once the
/// hold hook succeeded.
///
/// `on_held` receives the child's PID while the child is blocked before
/// any setup step. If it fails, the child is killed and reaped.
///
/// # Errors
///
/// Returns [`WardenError::NamespaceUnavailable`] when the kernel refuses a
/// namespace kind, [`WardenError::ProcessLaunchFailed`] when the child
/// cannot be created or fails before its payload starts, and the hook's
/// own error if it fails.
pub fn spawn(request: SpawnRequest<'_>, on_held: impl FnOnce(u32) -> Result<()>) -> Result<Child> {
    let SpawnRequest {
        directive,
        payload,
        stdio,
        stack_size,
    } = request;

    let exec = match &*payload {
        Payload::Command(args) => Some(ExecArgs::new(args)?),
        Payload::Callback(_) => None,
    };
    let default_mappings;
    let mappings = if directive.kinds().contains(&NamespaceKind::User) {
        default_mappings = IdMappings::root_to_current_user();
        Some(directive.id_mappings().unwrap_or(&default_mappings))
    } else {
        None
    };
    let plan = ChildPlan::new(directive, mappings)?;

    let launch_err = |step: &str, e: Errno| WardenError::ProcessLaunchFailed {
        message: format!("{step}: {e}"),
    };
    let (release_read, release_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| launch_err("release pipe", e))?;
    let (status_read, status_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| launch_err("status pipe", e))?;

    let context = ChildContext {
        release_read: release_read.as_raw_fd(),
        release_write: release_write.as_raw_fd(),
        status_read: status_read.as_raw_fd(),
        status_write: status_write.as_raw_fd(),
        stdio: [
            (stdio.stdin.raw(), libc::STDIN_FILENO),
            (stdio.stdout.raw(), libc::STDOUT_FILENO),
            (stdio.stderr.raw(), libc::STDERR_FILENO),
        ],
        strategy: directive.strategy(),
        plan: &plan,
        exec: exec.as_ref(),
    };

    let clone_flags = match directive.strategy() {
        LaunchStrategy::CloneTime => directive.flags(),
        LaunchStrategy::UnshareThenFork => CloneFlags::empty(),
    };
    let mut stack = vec![0u8; stack_size];
    // SAFETY: the child runs on its own stack in a copy of our address
    // space (no CLONE_VM) and only touches data prepared above.
    let cloned = unsafe {
        nix::sched::clone(
            Box::new(|| child_main(&context, &mut *payload)),
            &mut stack,
            clone_flags,
            Some(Signal::SIGCHLD as i32),
        )
    };
    let pid = match cloned {
        Ok(pid) => pid,
        Err(errno) => return Err(diagnose_clone_failure(directive, errno)),
    };
    drop(release_read);
    drop(status_write);

    let mut child = Child { pid, status: None };
    tracing::debug!(pid = pid.as_raw(), strategy = ?directive.strategy(), "child cloned, holding");

    let held = (|| {
        if directive.strategy() == LaunchStrategy::CloneTime {
            if let Some(mappings) = mappings {
                write_id_maps(pid.as_raw(), mappings)?;
            }
        }
        on_held(child.pid())
    })();
    if let Err(e) = held {
        drop(release_write);
        child.abort();
        return Err(e);
    }

    let mut release = File::from(release_write);
    if let Err(e) = release.write_all(&[1]) {
        drop(release);
        child.abort();
        return Err(WardenError::ProcessLaunchFailed {
            message: format!("releasing child: {e}"),
        });
    }
    drop(release);

    let mut report = Vec::new();
    let read = File::from(status_read).read_to_end(&mut report);
    if let Err(e) = read {
        child.abort();
        return Err(WardenError::ProcessLaunchFailed {
            message: format!("reading child status: {e}"),
        });
    }
    if !report.is_empty() {
        child.abort();
        let err = match StepFailure::decode(&report) {
            Some(failure) if failure.step == SetupStep::Exec => WardenError::ProcessLaunchFailed {
                message: format!(
                    "exec {}: {}",
                    exec.as_ref().map(ExecArgs::program).unwrap_or_default(),
                    failure.errno.desc()
                ),
            },
            Some(failure) => WardenError::from(failure),
            None => WardenError::ProcessLaunchFailed {
                message: format!("malformed child status ({} bytes)", report.len()),
            },
        };
        tracing::warn!(pid = pid.as_raw(), error = %err, "child failed before its payload");
        return Err(err);
    }

    tracing::info!(pid = pid.as_raw(), kinds = ?directive.kinds(), "child released");
    Ok(child)
}

/// Finds the namespace kind responsible for a failed clone-time launch.
fn diagnose_clone_failure(directive: &LaunchDirective, errno: Errno) -> WardenError {
    if directive.strategy() == LaunchStrategy::CloneTime
        && matches!(errno, Errno::EPERM | Errno::EINVAL | Errno::ENOSPC | Errno::EUSERS)
    {
        for kind in directive.kinds() {
            if let Err(e) = namespace::probe(*kind) {
                return e;
            }
        }
    }
    WardenError::ProcessLaunchFailed {
        message: format!("clone failed: {errno}"),
    }
}

// Everything below up to `impl Child` runs in the cloned child: raw
// syscalls on prepared data only, no allocation, no logging.

fn child_main(ctx: &ChildContext<'_>, payload: &mut Payload) -> isize {
    // SAFETY: the parent's pipe ends, duplicated by clone(2); the child
    // never uses them.
    unsafe {
        let _ = libc::close(ctx.release_write);
        let _ = libc::close(ctx.status_read);
    }
    let mut byte = 0u8;
    // SAFETY: reads one byte into a stack variable.
    let read = unsafe { libc::read(ctx.release_read, (&raw mut byte).cast(), 1) };
    // SAFETY: closed exactly once.
    let _ = unsafe { libc::close(ctx.release_read) };
    if read != 1 {
        // Parent gave up on us.
        return 1;
    }

    if let Err(failure) = enter_session(ctx) {
        return report(ctx.status_write, &failure);
    }

    match ctx.strategy {
        LaunchStrategy::CloneTime => run_payload(ctx, payload),
        LaunchStrategy::UnshareThenFork => {
            if let Err(failure) = ctx.plan.unshare() {
                return report(ctx.status_write, &failure);
            }
            match fork_raw() {
                Ok(0) => run_payload(ctx, payload),
                Ok(child) => {
                    close_status(ctx);
                    relay_exit(Pid::from_raw(child))
                }
                Err(errno) => report(ctx.status_write, &StepFailure::new(SetupStep::Fork, errno)),
            }
        }
    }
}

/// Wires stdio and starts a new session so the whole tree shares one
/// process group.
fn enter_session(ctx: &ChildContext<'_>) -> std::result::Result<(), StepFailure> {
    for (source, target) in ctx.stdio {
        if let Some(source) = source {
            // SAFETY: both descriptors are valid in the child.
            Errno::result(unsafe { libc::dup2(source, target) })
                .map_err(|e| StepFailure::new(SetupStep::Stdio, e))?;
        }
    }
    nix::unistd::setsid().map_err(|e| StepFailure::new(SetupStep::Setsid, e))?;
    Ok(())
}

/// `fork(2)` through the raw syscall, so no fork handlers run.
fn fork_raw() -> nix::Result<libc::pid_t> {
    // SAFETY: with a null stack pointer the kernel duplicates the caller
    // like fork(2); both sides continue on their own copy of this stack.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone,
            libc::c_long::from(libc::SIGCHLD),
            0 as libc::c_long,
            0 as libc::c_long,
            0 as libc::c_long,
            0 as libc::c_long,
        )
    };
    let pid = Errno::result(ret)?;
    libc::pid_t::try_from(pid).map_err(|_| Errno::EOVERFLOW)
}

fn run_payload(ctx: &ChildContext<'_>, payload: &mut Payload) -> isize {
    if let Err(failure) = ctx.plan.apply_actions() {
        return report(ctx.status_write, &failure);
    }
    match payload {
        Payload::Command(_) => {
            let Some(exec) = ctx.exec else {
                return report(ctx.status_write, &StepFailure::new(SetupStep::Exec, Errno::EINVAL));
            };
            let Some(program) = exec.args.first() else {
                return report(ctx.status_write, &StepFailure::new(SetupStep::Exec, Errno::EINVAL));
            };
            // SAFETY: the program and the null-terminated pointer array were
            // built by the parent and outlive the call.
            let _ = unsafe { libc::execvp(program.as_ptr(), exec.ptrs.as_ptr()) };
            let _ = report(ctx.status_write, &StepFailure::new(SetupStep::Exec, Errno::last()));
            127
        }
        Payload::Callback(callback) => {
            close_status(ctx);
            isize::try_from(callback()).unwrap_or(1)
        }
    }
}

/// Waits for the payload process and exits with its shell-style code.
fn relay_exit(child: Pid) -> isize {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return isize::try_from(code).unwrap_or(1),
            Ok(WaitStatus::Signaled(_, signal, _)) => return 128 + signal as isize,
            Ok(_) | Err(Errno::EINTR) => {}
            Err(_) => return 1,
        }
    }
}

fn close_status(ctx: &ChildContext<'_>) {
    // SAFETY: the status pipe's write end is owned by this process.
    let _ = unsafe { libc::close(ctx.status_write) };
}

/// Sends `failure` to the parent and returns the child's exit code.
fn report(status: RawFd, failure: &StepFailure) -> isize {
    let record = failure.encode();
    // SAFETY: writes a stack buffer; a short or failed write leaves the
    // parent with a malformed record, which it reports as such.
    let _ = unsafe { libc::write(status, record.as_ptr().cast(), record.len()) };
    1
}

impl Child {
    /// PID of the child in the caller's PID namespace.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid.as_raw().unsigned_abs()
    }

    /// Exit status, once reaped.
    #[must_use]
    pub const fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Reaps the child if it has exited, without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::ProcessLaunchFailed`] if `waitpid(2)` fails.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if self.status.is_some() {
            return Ok(self.status);
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => Ok(self.record(status)),
            Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(self.wait_error(e)),
        }
    }

    /// Polls until the child exits or the wait is interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::ProcessLaunchFailed`] if `waitpid(2)` fails.
    pub fn wait(&mut self, options: &WaitOptions) -> Result<WaitResult> {
        let started = Instant::now();
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(WaitResult::Exited(status));
            }
            if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                return Ok(WaitResult::Interrupted(Interruption::Cancelled));
            }
            if options.timeout.is_some_and(|t| started.elapsed() >= t) {
                return Ok(WaitResult::Interrupted(Interruption::TimedOut));
            }
            std::thread::sleep(options.poll);
        }
    }

    /// Terminates the child's process tree and reaps the child.
    ///
    /// SIGTERM goes to the child's process group and to every member of
    /// `group`; after `grace`, the same targets get SIGKILL and the group is
    /// killed through `cgroup.kill` where available.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::ProcessLaunchFailed`] if `waitpid(2)` fails.
    pub fn terminate(
        &mut self,
        group: Option<(&CgroupController, &CgroupHandle)>,
        grace: Duration,
        poll: Duration,
    ) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        tracing::info!(pid = self.pid.as_raw(), grace_ms = grace.as_millis(), "terminating process tree");
        self.signal_tree(Signal::SIGTERM, group);

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(status) = self.try_wait()? {
                return Ok(status);
            }
            std::thread::sleep(poll);
        }

        tracing::warn!(pid = self.pid.as_raw(), "grace period elapsed, sending SIGKILL");
        self.signal_tree(Signal::SIGKILL, group);
        if let Some((controller, handle)) = group {
            if let Err(e) = controller.kill_all(handle) {
                tracing::warn!(error = %e, "cgroup.kill failed");
            }
        }
        self.wait_blocking()
    }

    fn signal_tree(&self, signal: Signal, group: Option<(&CgroupController, &CgroupHandle)>) {
        if let Err(e) = killpg(self.pid, signal) {
            tracing::debug!(pid = self.pid.as_raw(), %signal, error = %e, "killpg failed");
        }
        if let Some((controller, handle)) = group {
            signal_members(controller, handle, signal);
        }
    }

    /// Kills and reaps a child that never reached its payload.
    fn abort(&mut self) {
        if self.status.is_some() {
            return;
        }
        let _ = kill(self.pid, Signal::SIGKILL);
        if let Err(e) = self.wait_blocking() {
            tracing::warn!(pid = self.pid.as_raw(), error = %e, "could not reap aborted child");
        }
    }

    fn wait_blocking(&mut self) -> Result<ExitStatus> {
        loop {
            if let Some(status) = self.status {
                return Ok(status);
            }
            match waitpid(self.pid, None) {
                Ok(status) => {
                    let _ = self.record(status);
                }
                Err(Errno::EINTR) => {}
                Err(e) => return Err(self.wait_error(e)),
            }
        }
    }

    fn record(&mut self, status: WaitStatus) -> Option<ExitStatus> {
        let exit = match status {
            WaitStatus::Exited(_, code) => ExitStatus::Exited(code),
            WaitStatus::Signaled(_, signal, _) => ExitStatus::Signaled(signal as i32),
            _ => return None,
        };
        tracing::debug!(pid = self.pid.as_raw(), %exit, "child reaped");
        self.status = Some(exit);
        self.status
    }

    fn wait_error(&self, e: Errno) -> WardenError {
        WardenError::ProcessLaunchFailed {
            message: format!("waitpid({}) failed: {e}", self.pid),
        }
    }
}

fn signal_members(controller: &CgroupController, handle: &CgroupHandle, signal: Signal) -> usize {
    let members = match controller.member_pids(handle) {
        Ok(members) => members,
        Err(e) => {
            tracing::debug!(error = %e, "could not list cgroup members");
            return 0;
        }
    };
    members
        .into_iter()
        .filter_map(|pid| i32::try_from(pid).ok())
        .filter(|pid| kill(Pid::from_raw(*pid), signal).is_ok())
        .count()
}

/// Kills processes left in `group` after the payload exited, so the group
/// can be removed.
///
/// Returns the number of processes signalled individually.
///
/// # Errors
///
/// Returns an error if `cgroup.kill` exists but cannot be written.
pub fn kill_stragglers(controller: &CgroupController, handle: &CgroupHandle) -> Result<usize> {
    if controller.kill_all(handle)? {
        return Ok(0);
    }
    let killed = signal_members(controller, handle, Signal::SIGKILL);
    if killed > 0 {
        tracing::info!(killed, group = %handle.path().display(), "killed leftover group members");
    }
    Ok(killed)
}
