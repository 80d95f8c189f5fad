//! Exponential backoff for directory calls.
//!
//! Only transient [`DirectoryError`]s are retried. Directory operations are
//! idempotent (publish replaces, fetch reads, consumption removes at most
//! once), so repeating one after an ambiguous failure is safe.

use std::future::Future;

use tracing::warn;

use crate::{config::RetryPolicy, env::Environment, error::DirectoryError};

/// Run `operation` until it succeeds, fails permanently, or the policy's
/// attempts are used up.
///
/// Cancel-safe: dropping the returned future between attempts leaves no
/// partial state behind.
pub async fn with_backoff<E, T, F, Fut>(
    env: &E,
    policy: &RetryPolicy,
    name: &'static str,
    mut operation: F,
) -> Result<T, DirectoryError>
where
    E: Environment,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DirectoryError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let backoff = policy.backoff_after(attempt);
                warn!(
                    operation = name,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Directory call failed, retrying"
                );
                env.sleep(backoff).await;
                attempt += 1;
            },
            Err(err) => return Err(err),
        }
    }
}
