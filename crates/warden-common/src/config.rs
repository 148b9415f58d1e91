//! Global configuration model for the Warden runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, WardenError};
use crate::types::IsolationMode;

/// Bounded exponential backoff used for busy cgroups and busy mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Ceiling applied to the doubled delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Delay to sleep after the failed attempt number `attempt` (zero-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// A policy that tries exactly once.
    #[must_use]
    pub const fn once() -> Self {
        Self {
            attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: constants::DEFAULT_RETRY_ATTEMPTS,
            initial_delay_ms: constants::DEFAULT_RETRY_INITIAL_MS,
            max_delay_ms: constants::DEFAULT_RETRY_MAX_MS,
        }
    }
}

/// Root configuration for the Warden runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Mount point of the cgroup hierarchy sessions are created in.
    pub cgroup_root: PathBuf,
    /// Group under `cgroup_root` that holds per-session groups.
    pub cgroup_parent: String,
    /// Retry policy for busy cgroups and busy unmounts.
    pub retry: RetryPolicy,
    /// Grace period between SIGTERM and SIGKILL when terminating a tree.
    pub kill_grace_ms: u64,
    /// Polling interval of the exit wait loop.
    pub wait_poll_ms: u64,
    /// Reaction to unavailable namespaces.
    pub isolation_mode: IsolationMode,
    /// Stack size for the cloned child.
    pub child_stack_size: usize,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from(constants::CGROUP_V2_PATH),
            cgroup_parent: constants::DEFAULT_CGROUP_PARENT.to_string(),
            retry: RetryPolicy::default(),
            kill_grace_ms: constants::DEFAULT_KILL_GRACE_MS,
            wait_poll_ms: constants::DEFAULT_WAIT_POLL_MS,
            isolation_mode: IsolationMode::default(),
            child_stack_size: constants::CHILD_STACK_SIZE,
        }
    }
}

impl WardenConfig {
    /// Loads a configuration from a JSON file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resulting configuration is invalid.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| WardenError::io(path, e))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Builds the default configuration with environment overrides applied.
    ///
    /// # Errors
    ///
    /// Returns an error if an override holds an invalid value.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies `WARDEN_*` overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if an override holds an invalid value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(root) = lookup(constants::ENV_CGROUP_ROOT) {
            self.cgroup_root = PathBuf::from(root);
        }
        if let Some(mode) = lookup(constants::ENV_ISOLATION_MODE) {
            self.isolation_mode = mode.parse()?;
        }
        self.validate()
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if !self.cgroup_root.is_absolute() {
            return Err(WardenError::config(format!(
                "cgroup root must be absolute: {}",
                self.cgroup_root.display()
            )));
        }
        if self.cgroup_parent.contains("..") || self.cgroup_parent.starts_with('/') {
            return Err(WardenError::config(format!(
                "cgroup parent must be a relative path without '..': {}",
                self.cgroup_parent
            )));
        }
        if self.retry.attempts == 0 {
            return Err(WardenError::config("retry attempts must be at least 1"));
        }
        if self.wait_poll_ms == 0 {
            return Err(WardenError::config("wait poll interval must be non-zero"));
        }
        if self.child_stack_size < 64 * 1024 {
            return Err(WardenError::config("child stack must be at least 64 KiB"));
        }
        Ok(())
    }

    /// Grace period between SIGTERM and SIGKILL.
    #[must_use]
    pub const fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Polling interval of the exit wait loop.
    #[must_use]
    pub const fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        WardenConfig::default().validate().expect("default validates");
    }

    #[test]
    fn backoff_doubles_until_ceiling() {
        let policy = RetryPolicy {
            attempts: 5,
            initial_delay_ms: 10,
            max_delay_ms: 50,
        };
        assert_eq!(policy.delay_after(0), Duration::from_millis(10));
        assert_eq!(policy.delay_after(1), Duration::from_millis(20));
        assert_eq!(policy.delay_after(2), Duration::from_millis(40));
        assert_eq!(policy.delay_after(3), Duration::from_millis(50));
        assert_eq!(policy.delay_after(200), Duration::from_millis(50));
    }

    #[test]
    fn overrides_replace_root_and_mode() {
        let mut config = WardenConfig::default();
        config
            .apply_overrides(|key| match key {
                "WARDEN_CGROUP_ROOT" => Some("/tmp/fake-cgroup".into()),
                "WARDEN_ISOLATION_MODE" => Some("best-effort".into()),
                _ => None,
            })
            .expect("overrides apply");
        assert_eq!(config.cgroup_root, PathBuf::from("/tmp/fake-cgroup"));
        assert_eq!(config.isolation_mode, IsolationMode::BestEffort);
    }

    #[test]
    fn relative_cgroup_root_rejected() {
        let mut config = WardenConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "WARDEN_CGROUP_ROOT").then(|| "relative/root".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn file_with_partial_fields_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("warden.json");
        std::fs::write(&path, r#"{ "cgroup_parent": "ci", "retry": { "attempts": 2 } }"#)
            .expect("write config");
        let config = WardenConfig::from_file(&path).expect("load");
        assert_eq!(config.cgroup_parent, "ci");
        assert_eq!(config.retry.attempts, 2);
        assert_eq!(config.retry.max_delay_ms, constants::DEFAULT_RETRY_MAX_MS);
        assert_eq!(config.cgroup_root, PathBuf::from(constants::CGROUP_V2_PATH));
    }

    #[test]
    fn zero_attempts_rejected_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("warden.json");
        std::fs::write(&path, r#"{ "retry": { "attempts": 0 } }"#).expect("write config");
        assert!(WardenConfig::from_file(&path).is_err());
    }
}
