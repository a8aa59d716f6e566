//! Bounded exponential backoff for calls to external services.
//!
//! Only transient failures are retried (see
//! [`clearhouse_types::ClearhouseError::is_retryable`]); a rejection from the remote side or a
//! domain error surfaces immediately. Delays grow exponentially from the
//! policy's base, are capped at its maximum, and carry random jitter so a
//! fleet of adapters does not hammer a recovering service in lockstep.

use std::future::Future;
use std::time::Duration;

use clearhouse_types::{Result, RetryPolicy};
use rand::Rng;

/// Run `call` until it succeeds, fails non-transiently, or the policy's
/// attempt budget is spent.
///
/// `operation` names the call in logs, e.g. `"bank.fetch_invoice"`.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = backoff_delay(policy, attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::warn!(operation, attempt, error = %err, "attempt budget spent");
                }
                return Err(err);
            }
        }
    }
}

/// Delay before the retry following `attempt` (1-based): half the capped
/// exponential step plus up to another half of jitter.
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let shift = (attempt - 1).min(16);
    let capped = policy
        .base_delay_ms
        .saturating_mul(1u64 << shift)
        .min(policy.max_delay_ms);
    let jitter = rand::thread_rng().gen_range(0..=capped / 2);
    Duration::from_millis(capped / 2 + jitter)
}
