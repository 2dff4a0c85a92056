//! Retry-with-backoff combinator for contended operations
//!
//! Agents poll rather than block. Instead of sleeping inline at every call
//! site, contended operations are wrapped in [`retry_with_backoff`], which
//! is bounded by both `RetryPolicy::max_attempts` and
//! `RetryPolicy::max_wait_ms`.

use crate::config::RetryPolicy;
use crate::{Error, Result};
use std::future::Future;
use tokio::time::Instant;
use tracing::debug;

/// Run `op` until it succeeds, fails with a non-recoverable error, or the
/// policy is exhausted.
///
/// `op` receives the 1-based attempt number. Recoverable errors (see
/// [`Error::is_recoverable`]) are retried; exhausting the policy on a
/// contention error yields [`Error::Timeout`].
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let deadline = policy.max_wait().map(|wait| started + wait);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_recoverable() => return Err(err),
            Err(err) => err,
        };

        let now = Instant::now();
        let out_of_attempts = attempt >= policy.max_attempts;
        let out_of_time = deadline.is_some_and(|deadline| now >= deadline);

        if out_of_attempts || out_of_time {
            debug!(
                operation = %operation,
                attempts = attempt,
                error = %err,
                "Retry budget exhausted"
            );
            if err.is_contention() {
                let waited = started.elapsed().as_secs_f64().ceil() as u64;
                return Err(Error::timeout(operation, waited));
            }
            return Err(err);
        }

        // The last sleep is cut short so one attempt lands on the deadline
        let delay = match deadline {
            Some(deadline) => policy.delay_for_attempt(attempt).min(deadline - now),
            None => policy.delay_for_attempt(attempt),
        };
        debug!(
            operation = %operation,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "Retrying after recoverable error: {}",
            err
        );
        tokio::time::sleep(delay).await;
    }
}
