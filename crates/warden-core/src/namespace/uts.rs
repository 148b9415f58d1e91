//! UTS namespace isolation.
//!
//! Allows the container to have its own hostname.

use warden_common::error::{Result, WardenError};

/// Longest hostname the kernel accepts (`HOST_NAME_MAX`).
pub const MAX_HOSTNAME_LEN: usize = 64;

/// Checks that `hostname` can be handed to `sethostname(2)`.
///
/// # Errors
///
/// Returns a configuration error for empty, oversized, or NUL-containing names.
pub fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() {
        return Err(WardenError::config("hostname is empty"));
    }
    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err(WardenError::config(format!(
            "hostname longer than {MAX_HOSTNAME_LEN} bytes: {hostname}"
        )));
    }
    if hostname.contains('\0') {
        return Err(WardenError::config("hostname contains a NUL byte"));
    }
    Ok(())
}

/// Sets the hostname inside the UTS namespace.
///
/// Safe to call in a freshly cloned child: it neither allocates nor logs.
///
/// # Errors
///
/// Returns the errno of `sethostname(2)`.
pub fn set_hostname(hostname: &str) -> nix::Result<()> {
    nix::unistd::sethostname(hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_limits() {
        assert!(validate_hostname("box-1").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname(&"h".repeat(65)).is_err());
        assert!(validate_hostname(&"h".repeat(64)).is_ok());
    }
}
