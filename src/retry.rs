//! Bounded retry with exponential backoff for hosted-API calls
//!
//! Retries happen at the boundary wrappers (STT, TTS, NLU); when attempts
//! are exhausted the last error surfaces to the caller, which maps it to a
//! state-machine failure.

use std::time::Duration;

use rand::Rng;

use crate::Error;

/// Retry policy for a boundary wrapper
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first (0 disables retry)
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Ceiling on any single delay
    pub max_delay: Duration,
    /// Jitter fraction applied to each delay (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries (for tests)
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Backoff delay for the given attempt (1-based), with jitter
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);

        if self.jitter <= f64::EPSILON {
            return exp;
        }

        let spread = exp.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((exp.as_secs_f64() + offset).max(0.0))
    }
}

/// Whether an error is worth retrying
///
/// Server-side failures (5xx), rate limiting (429), and transport-level
/// problems are transient; everything else (4xx, parse errors, local
/// failures) is not.
#[must_use]
pub fn is_transient(error: &Error) -> bool {
    match error {
        Error::Status { status, .. } => *status >= 500 || *status == 429,
        Error::Http(e) => {
            e.is_timeout()
                || e.is_connect()
                || e.status().is_some_and(|s| s.is_server_error())
        }
        _ => false,
    }
}

/// Run `op` with bounded retry on transient failures
///
/// # Errors
///
/// Returns the final error once retries are exhausted or the error is not
/// transient.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries && is_transient(&e) => {
                attempt += 1;
                let delay = policy.delay(attempt);
                tracing::warn!(
                    service = label,
                    attempt,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
