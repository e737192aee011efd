//! Reconnect backoff policy
//!
//! Pure computation: how long to wait before the next attempt and whether
//! another attempt is allowed. Scheduling lives in the session loop.

use serde::{Deserialize, Serialize};

/// Exponential backoff with a ceiling and a bounded number of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Reconnect attempts before giving up.
    /// Default: 5
    pub max_attempts: u32,

    /// Delay before the first reconnect (milliseconds).
    /// Default: 1000ms
    pub base_delay_ms: u64,

    /// Upper bound on any single delay (milliseconds).
    /// Default: 10000ms
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay in milliseconds for the attempt numbered `count` (0-based):
    /// `min(base * 2^count, max)`.
    pub fn delay_for(&self, count: u32) -> u64 {
        let factor = 1u64.checked_shl(count).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Whether another attempt is allowed after `count` attempts
    pub fn should_retry(&self, count: u32) -> bool {
        count < self.max_attempts
    }
}

/// Progress through the current reconnect cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectAttempt {
    pub count: u32,
    pub last_delay_ms: u64,
}

impl ReconnectAttempt {
    /// Record a scheduled attempt and its delay
    pub fn advance(self, delay_ms: u64) -> Self {
        Self {
            count: self.count.saturating_add(1),
            last_delay_ms: delay_ms,
        }
    }
}
