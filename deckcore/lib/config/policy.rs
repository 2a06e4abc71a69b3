use std::time::Duration;

use getset::CopyGetters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::config::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BOOTSTRAP_ATTEMPTS, DEFAULT_DRAIN_GRACE_MS,
    DEFAULT_FIRST_ATTEMPT_TIMEOUT_MS, DEFAULT_FULL_LOG_LINES, DEFAULT_GRACEFUL_KILL_TIMEOUT_MS,
    DEFAULT_HIVE_POLL_ATTEMPTS, DEFAULT_HIVE_POLL_DELAY_MS, DEFAULT_KILL_POLL_INTERVAL_MS,
    DEFAULT_OUTPUT_TAIL_LINES, DEFAULT_REGISTRY_TOOL_TIMEOUT_MS, DEFAULT_RETRY_ATTEMPT_TIMEOUT_MS,
    DEFAULT_SOCKET_POLL_ATTEMPTS, DEFAULT_SOCKET_POLL_DELAY_MS,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Timing of the container bootstrap state machine.
///
/// Durations are stored as milliseconds so they read naturally in `deck.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, CopyGetters)]
#[serde(default)]
#[getset(get_copy = "pub with_prefix")]
pub struct BootstrapPolicy {
    /// Number of attempts, each with more conservative translator settings.
    #[builder(default = DEFAULT_BOOTSTRAP_ATTEMPTS)]
    attempts: u32,

    /// Deadline of attempt 0.
    #[builder(default = DEFAULT_FIRST_ATTEMPT_TIMEOUT_MS)]
    first_attempt_timeout_ms: u64,

    /// Deadline of every later attempt.
    #[builder(default = DEFAULT_RETRY_ATTEMPT_TIMEOUT_MS)]
    retry_attempt_timeout_ms: u64,

    /// How many times to look for the wineserver socket.
    #[builder(default = DEFAULT_SOCKET_POLL_ATTEMPTS)]
    socket_poll_attempts: u32,

    /// Delay between socket polls.
    #[builder(default = DEFAULT_SOCKET_POLL_DELAY_MS)]
    socket_poll_delay_ms: u64,

    /// How many times to look for the registry hives after a clean exit.
    #[builder(default = DEFAULT_HIVE_POLL_ATTEMPTS)]
    hive_poll_attempts: u32,

    /// Delay between hive polls.
    #[builder(default = DEFAULT_HIVE_POLL_DELAY_MS)]
    hive_poll_delay_ms: u64,

    /// Backoff after attempt `n` is `backoff_base_ms * 2^n`.
    #[builder(default = DEFAULT_BACKOFF_BASE_MS)]
    backoff_base_ms: u64,

    /// How long the output drain may run on after the child exits.
    #[builder(default = DEFAULT_DRAIN_GRACE_MS)]
    drain_grace_ms: u64,

    /// Lines of output kept for the failure report.
    #[builder(default = DEFAULT_OUTPUT_TAIL_LINES)]
    output_tail_lines: usize,

    /// Deadline of each sandboxed registry tool invocation.
    #[builder(default = DEFAULT_REGISTRY_TOOL_TIMEOUT_MS)]
    registry_tool_timeout_ms: u64,
}

/// Timing and logging limits for launched guest processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, CopyGetters)]
#[serde(default)]
#[getset(get_copy = "pub with_prefix")]
pub struct LaunchPolicy {
    /// How long a graceful kill waits before escalating to a forced one.
    #[builder(default = DEFAULT_GRACEFUL_KILL_TIMEOUT_MS)]
    graceful_kill_timeout_ms: u64,

    /// Liveness poll interval during a graceful kill.
    #[builder(default = DEFAULT_KILL_POLL_INTERVAL_MS)]
    kill_poll_interval_ms: u64,

    /// Output lines logged in full before only flagged lines are logged.
    #[builder(default = DEFAULT_FULL_LOG_LINES)]
    full_log_lines: usize,

    /// How long the output drain may run on after the process exits.
    #[builder(default = DEFAULT_DRAIN_GRACE_MS)]
    drain_grace_ms: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BootstrapPolicy {
    /// Deadline of the given attempt: short for the first, long for the rest.
    pub fn attempt_timeout(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::from_millis(self.first_attempt_timeout_ms)
        } else {
            Duration::from_millis(self.retry_attempt_timeout_ms)
        }
    }

    /// Delay before the attempt following `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms.saturating_mul(1u64 << attempt.min(16)))
    }

    /// Delay between wineserver socket polls.
    pub fn socket_poll_delay(&self) -> Duration {
        Duration::from_millis(self.socket_poll_delay_ms)
    }

    /// Delay between registry hive polls.
    pub fn hive_poll_delay(&self) -> Duration {
        Duration::from_millis(self.hive_poll_delay_ms)
    }

    /// How long the output drain may outlive the child.
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    /// Deadline of a sandboxed registry tool invocation.
    pub fn registry_tool_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_tool_timeout_ms)
    }
}

impl LaunchPolicy {
    /// How long a graceful kill waits before escalating.
    pub fn graceful_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_kill_timeout_ms)
    }

    /// Liveness poll interval during a graceful kill.
    pub fn kill_poll_interval(&self) -> Duration {
        Duration::from_millis(self.kill_poll_interval_ms)
    }

    /// How long the output drain may outlive the process.
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for BootstrapPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for LaunchPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_policy_timeouts_grow_after_first_attempt() {
        let policy = BootstrapPolicy::default();

        assert!(policy.attempt_timeout(0) < policy.attempt_timeout(1));
        assert_eq!(policy.attempt_timeout(1), policy.attempt_timeout(2));
    }

    #[test]
    fn test_bootstrap_policy_backoff_is_exponential() {
        let policy = BootstrapPolicy::builder().backoff_base_ms(100).build();

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
    }

    #[test]
    fn test_policies_fill_missing_fields_from_defaults() -> anyhow::Result<()> {
        let policy: BootstrapPolicy = serde_yaml::from_str("first_attempt_timeout_ms: 5000")?;
        assert_eq!(policy.get_first_attempt_timeout_ms(), 5000);
        assert_eq!(policy.get_attempts(), DEFAULT_BOOTSTRAP_ATTEMPTS);

        let policy: LaunchPolicy = serde_yaml::from_str("full_log_lines: 10")?;
        assert_eq!(policy.get_full_log_lines(), 10);
        assert_eq!(
            policy.get_graceful_kill_timeout_ms(),
            DEFAULT_GRACEFUL_KILL_TIMEOUT_MS
        );

        Ok(())
    }
}
