//! System-wide constants and defaults.

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Parent group under which session cgroups are created by default.
pub const DEFAULT_CGROUP_PARENT: &str = "warden";

/// Environment variable overriding the cgroup root.
pub const ENV_CGROUP_ROOT: &str = "WARDEN_CGROUP_ROOT";

/// Environment variable overriding the isolation mode.
pub const ENV_ISOLATION_MODE: &str = "WARDEN_ISOLATION_MODE";

/// Stack size handed to `clone(2)` for the child process.
pub const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Default number of attempts for retried teardown operations.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 6;

/// Default first backoff delay in milliseconds.
pub const DEFAULT_RETRY_INITIAL_MS: u64 = 10;

/// Default backoff ceiling in milliseconds.
pub const DEFAULT_RETRY_MAX_MS: u64 = 500;

/// Default grace period between SIGTERM and SIGKILL in milliseconds.
pub const DEFAULT_KILL_GRACE_MS: u64 = 2_000;

/// Default polling interval while waiting for the child, in milliseconds.
pub const DEFAULT_WAIT_POLL_MS: u64 = 20;

/// Upper bound of the overlay mount option string (one page).
pub const MAX_MOUNT_OPTIONS_LEN: usize = 4096;

/// Name of the directory used to park the old root during `pivot_root`.
pub const OLD_ROOT_DIR: &str = ".warden-oldroot";
