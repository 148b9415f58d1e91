//! Memory controller helpers.
//!
//! Limits are written in the kernel's native encoding (a byte count or
//! `max`). Converting human-friendly sizes is an explicit step done by the
//! caller through [`parse_size`] or [`limit_value`]; the controller never
//! converts units on its own.

use warden_common::error::{Result, WardenError};

/// Unlimited sentinel of the unified hierarchy.
pub const UNLIMITED: &str = "max";

/// Unlimited sentinel of the legacy hierarchy.
pub const LEGACY_UNLIMITED: &str = "-1";

/// Parses sizes like `"100m"`, `"128MiB"`, `"1GB"` or `"4096"` into bytes.
///
/// Single-letter suffixes (`k`, `m`, `g`, `t`) and `KiB`-style suffixes are
/// binary multiples; `KB`-style suffixes are decimal. Suffixes are
/// case-insensitive.
///
/// # Errors
///
/// Returns a configuration error if the number or suffix is invalid or the
/// result does not fit in 64 bits.
pub fn parse_size(input: &str) -> Result<u64> {
    const KIB: u64 = 1024;
    const UNITS: &[(&str, u64)] = &[
        ("kib", KIB),
        ("mib", KIB * KIB),
        ("gib", KIB * KIB * KIB),
        ("tib", KIB * KIB * KIB * KIB),
        ("kb", 1_000),
        ("mb", 1_000_000),
        ("gb", 1_000_000_000),
        ("tb", 1_000_000_000_000),
        ("k", KIB),
        ("m", KIB * KIB),
        ("g", KIB * KIB * KIB),
        ("t", KIB * KIB * KIB * KIB),
        ("b", 1),
    ];

    let lowered = input.trim().to_ascii_lowercase();
    let (number, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, mult)| lowered.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((lowered.as_str(), 1));

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| WardenError::config(format!("invalid size: {input:?}")))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| WardenError::config(format!("size overflows 64 bits: {input:?}")))
}

/// Converts a human-friendly size or `max` into a `memory.max` value.
///
/// # Errors
///
/// Returns the error of [`parse_size`].
pub fn limit_value(input: &str) -> Result<String> {
    if input.trim().eq_ignore_ascii_case(UNLIMITED) {
        return Ok(UNLIMITED.to_string());
    }
    parse_size(input).map(|bytes| bytes.to_string())
}

/// Rewrites a unified memory value for a legacy `memory.*_in_bytes` file.
#[must_use]
pub fn to_legacy_value(value: &str) -> String {
    if value.trim() == UNLIMITED {
        LEGACY_UNLIMITED.to_string()
    } else {
        value.trim().to_string()
    }
}
