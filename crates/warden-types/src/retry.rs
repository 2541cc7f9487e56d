//! Bounded local retry for transient failures (lock contention, interrupted I/O).

use std::time::Duration;

use crate::Result;

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let factor = 2u64.saturating_pow(attempt.min(32) as u32);
                let millis = (base.as_millis() as u64).saturating_mul(factor);
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(25),
            max: Duration::from_secs(1),
        }
    }
}

/// Run `op` up to `attempts` times, sleeping between tries, for as long as it
/// fails with a retryable error. Non-retryable errors and the final failure
/// are returned unchanged.
pub fn retry_transient<T, F>(
    attempts: usize,
    policy: &BackoffPolicy,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(what, attempt, delay_ms = %delay.as_millis(), error = %e, "transient failure, retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
