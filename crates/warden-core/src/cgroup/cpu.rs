//! CPU controller helpers.
//!
//! `cpu.max` holds `"<quota> <period>"` in microseconds, with `max` as the
//! unlimited quota. The legacy hierarchy splits the same setting into
//! `cpu.cfs_period_us` and `cpu.cfs_quota_us`.

use warden_common::error::{Result, WardenError};

/// Default CFS period in microseconds.
pub const DEFAULT_PERIOD_US: u64 = 100_000;

/// Parsed form of a `cpu.max` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMax {
    /// Allowed runtime per period, `None` when unlimited.
    pub quota_us: Option<u64>,
    /// Period length.
    pub period_us: u64,
}

impl CpuMax {
    /// Parses a unified `cpu.max` value.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed values or a zero period.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || WardenError::config(format!("invalid cpu.max value: {value:?}"));
        let mut parts = value.split_whitespace();
        let quota = parts.next().ok_or_else(invalid)?;
        let period_us = match parts.next() {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None => DEFAULT_PERIOD_US,
        };
        if parts.next().is_some() || period_us == 0 {
            return Err(invalid());
        }
        let quota_us = if quota == super::memory::UNLIMITED {
            None
        } else {
            Some(quota.parse().map_err(|_| invalid())?)
        };
        Ok(Self {
            quota_us,
            period_us,
        })
    }

    /// Renders the unified `cpu.max` encoding.
    #[must_use]
    pub fn to_unified(&self) -> String {
        match self.quota_us {
            Some(q) => format!("{q} {}", self.period_us),
            None => format!("max {}", self.period_us),
        }
    }

    /// Legacy files and values, in the order they must be written.
    ///
    /// The period goes first so the kernel never sees a quota validated
    /// against a stale period.
    #[must_use]
    pub fn to_legacy(&self) -> Vec<(&'static str, String)> {
        let quota = self
            .quota_us
            .map_or_else(|| super::memory::LEGACY_UNLIMITED.to_string(), |q| q.to_string());
        vec![
            ("cpu.cfs_period_us", self.period_us.to_string()),
            ("cpu.cfs_quota_us", quota),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_and_period() {
        let max = CpuMax::parse("50000 100000").expect("parse");
        assert_eq!(max.quota_us, Some(50_000));
        assert_eq!(max.to_unified(), "50000 100000");
    }

    #[test]
    fn unlimited_without_period() {
        let max = CpuMax::parse("max").expect("parse");
        assert_eq!(max.quota_us, None);
        assert_eq!(max.period_us, DEFAULT_PERIOD_US);
        assert_eq!(
            max.to_legacy(),
            vec![
                ("cpu.cfs_period_us", "100000".to_string()),
                ("cpu.cfs_quota_us", "-1".to_string()),
            ]
        );
    }

    #[test]
    fn malformed_values_rejected() {
        assert!(CpuMax::parse("").is_err());
        assert!(CpuMax::parse("fast 100").is_err());
        assert!(CpuMax::parse("100 0").is_err());
        assert!(CpuMax::parse("1 2 3").is_err());
    }
}
