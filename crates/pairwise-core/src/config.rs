//! Session subsystem configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when the fetched bundle offers no usable one-time prekey.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OneTimePreKeyPolicy {
    /// Proceed with the signed prekey only (reduced forward secrecy for the
    /// first message). Logged as a warning.
    #[default]
    AllowFallback,
    /// Fail with `NoKeyBundle` instead.
    Required,
}

/// Exponential backoff for transient directory failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Session subsystem configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// One-time prekeys generated at initialization and kept available
    pub one_time_prekey_pool_size: u32,
    /// Replenish the pool when fewer than this many remain
    pub replenish_threshold: u32,
    /// Id of the first one-time prekey ever generated
    pub first_one_time_prekey_id: u32,
    /// Id of the active signed prekey
    pub signed_prekey_id: u32,
    /// Fallback behaviour when no one-time prekey can be claimed
    pub one_time_prekey_policy: OneTimePreKeyPolicy,
    /// Backoff for directory calls
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            one_time_prekey_pool_size: 10,
            replenish_threshold: 3,
            first_one_time_prekey_id: 1000,
            signed_prekey_id: 1,
            one_time_prekey_policy: OneTimePreKeyPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}
