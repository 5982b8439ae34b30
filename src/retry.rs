// ============================================
// retry.rs - Retry and elevation-fallback policy
// ============================================
//
// Two small helpers that every step shares instead of writing its own
// loop:
//
//   RetryPolicy::run         - bounded attempts with a backoff schedule
//   with_elevated_fallback   - run an operation, and if (and only if) it
//                              fails with PermissionDenied, hand the error
//                              to an elevated fallback
// ============================================

use std::time::Duration;

use tracing::warn;

use crate::error::{DeployError, DeployResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Vec<Duration>,
}

impl RetryPolicy {
    /// `max_attempts` of 0 is treated as 1.
    pub fn new(max_attempts: u32, backoff: Vec<Duration>) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before attempt number `attempt` (1-based, so attempt 2 is the
    /// first retry). Past the end of the schedule the last delay repeats.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.backoff.is_empty() {
            return Duration::ZERO;
        }
        let index = (attempt as usize - 2).min(self.backoff.len() - 1);
        self.backoff[index]
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or the
    /// attempts run out. The last error is returned on exhaustion.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut(u32) -> DeployResult<T>,
        retryable: impl Fn(&DeployError) -> bool,
    ) -> DeployResult<T> {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && retryable(&err) => {
                    let delay = self.delay_before(attempt + 1);
                    warn!(
                        "{} failed (attempt {}/{}): {} - retrying in {:?}",
                        what, attempt, self.max_attempts, err, delay
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Run `op`; on `PermissionDenied` run `fallback` with the error.
/// Any other error is returned untouched.
pub fn with_elevated_fallback<T>(
    op: impl FnOnce() -> DeployResult<T>,
    fallback: impl FnOnce(DeployError) -> DeployResult<T>,
) -> DeployResult<T> {
    match op() {
        Err(err) if err.is_permission_denied() => {
            warn!("{} - trying the elevated path", err);
            fallback(err)
        }
        other => other,
    }
}

// ============================================
// TESTS
// ============================================
