//! Collaborator retry policy.

use std::time::Duration;

use codeagent_core::config::OrchestratorConfig;

/// Longest single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Exponential backoff for collaborator timeouts and transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub const fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_retries: config.max_collaborator_retries,
            base_backoff: config.retry_backoff(),
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    /// Whether another retry is allowed after `retries_done` retries.
    pub const fn allows(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}
