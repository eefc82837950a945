//! Shared retry-with-backoff utility used by `ParallelExecutor` and `ContextReducer`.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::model::RetryConfig;

const MAX_BACKOFF_SECS: u64 = 30;

/// Runs `op` until it succeeds or `policy.max_attempts` is exhausted, doubling the
/// delay after each failed attempt starting from `policy.backoff` seconds and
/// capping at 30s. Returns the successful value plus the attempt number it
/// succeeded on (1-indexed), or the last error once attempts are exhausted.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryConfig,
    mut op: F,
) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = Duration::from_secs(policy.backoff.max(1));

    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => return (Ok(value), attempt),
            Err(err) => {
                if attempt == max_attempts {
                    return (Err(err), attempt);
                }
                warn!(attempt, max_attempts, error = %err, "attempt failed, retrying after backoff");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
            }
        }
    }

    unreachable!("max_attempts is always >= 1")
}
