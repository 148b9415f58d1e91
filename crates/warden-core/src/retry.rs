//! Bounded exponential backoff for transient teardown failures.
//!
//! Only two conditions are retried in the runtime: a cgroup that still has
//! members (`EBUSY` on `rmdir`) and a mount target that is still in use
//! (`EBUSY` on `umount2`). Everything else surfaces on the first failure.

use warden_common::config::RetryPolicy;

/// Result of a retried operation that never succeeded.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Error returned by the last attempt.
    pub last: E,
    /// Number of attempts made.
    pub attempts: u32,
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts.
///
/// `is_transient` decides whether a failure is worth another attempt. A
/// non-transient failure is returned immediately with `attempts` set to the
/// number of attempts made so far.
///
/// # Errors
///
/// Returns the last error together with the attempt count.
pub fn with_backoff<T, E>(
    policy: &RetryPolicy,
    mut op: impl FnMut() -> Result<T, E>,
    is_transient: impl Fn(&E) -> bool,
) -> Result<T, Exhausted<E>> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= attempts || !is_transient(&err) {
                    return Err(Exhausted {
                        last: err,
                        attempts: attempt,
                    });
                }
                let delay = policy.delay_after(attempt - 1);
                tracing::debug!(attempt, delay_ms = delay.as_millis(), "transient failure, backing off");
                std::thread::sleep(delay);
            }
        }
    }
}
