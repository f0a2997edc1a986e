//! Per-execution timeout and breaker thresholds
//!
//! `TimeoutPolicy` is a pure value object: construction goes through
//! `validate()`, and `check_timeout` is a side-effect-free function of the
//! clock, safe to call from any task.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Result, TrackerError};
use crate::record::ExecutionRecord;

/// Timeout and circuit-breaker thresholds applied to executions
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    /// Default wall-clock budget for a full agent execution
    pub agent_execution_timeout: Duration,

    /// Max silence between heartbeats before a worker is presumed dead
    pub heartbeat_timeout: Duration,

    /// Bound applied to individual guarded operations (LLM/tool calls)
    pub llm_api_timeout: Duration,

    /// Consecutive failures before a breaker opens
    pub failure_threshold: u32,

    /// Cooldown before an open breaker allows a probe
    pub recovery_timeout: Duration,

    /// Consecutive half-open successes required to close a breaker
    pub success_threshold: u32,

    /// Max retries advisory carried for guarded-operation callers
    pub max_retries: u32,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            agent_execution_timeout: Duration::from_secs(300),
            heartbeat_timeout: Duration::from_secs(30),
            llm_api_timeout: Duration::from_secs(60),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            max_retries: 3,
        }
    }
}

impl TimeoutPolicy {
    /// Load policy from environment variables, falling back to defaults
    ///
    /// Unparseable and non-positive values are ignored, so the returned
    /// policy always passes `validate()`.
    pub fn from_env() -> Self {
        let mut policy = Self::default();

        if let Some(secs) = env_u64("AGENTRUN_EXECUTION_TIMEOUT_SECS") {
            policy.agent_execution_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("AGENTRUN_HEARTBEAT_TIMEOUT_SECS") {
            policy.heartbeat_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("AGENTRUN_LLM_TIMEOUT_MS") {
            policy.llm_api_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("AGENTRUN_BREAKER_FAILURE_THRESHOLD") {
            policy.failure_threshold = n as u32;
        }
        if let Some(secs) = env_u64("AGENTRUN_BREAKER_RECOVERY_SECS") {
            policy.recovery_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("AGENTRUN_BREAKER_SUCCESS_THRESHOLD") {
            policy.success_threshold = n as u32;
        }
        if let Some(n) = env_u64("AGENTRUN_MAX_RETRIES") {
            policy.max_retries = n as u32;
        }

        policy
    }

    /// Validate that every field is strictly positive
    ///
    /// No default is allowed to pass through `<= 0`; a zero threshold would
    /// make the breaker open on creation or the monitor kill healthy runs.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("agent_execution_timeout", self.agent_execution_timeout),
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("llm_api_timeout", self.llm_api_timeout),
            ("recovery_timeout", self.recovery_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(TrackerError::validation(format!(
                    "{} must be strictly positive, got {:?}",
                    name, value
                )));
            }
        }

        let counts = [
            ("failure_threshold", self.failure_threshold),
            ("success_threshold", self.success_threshold),
            ("max_retries", self.max_retries),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(TrackerError::validation(format!(
                    "{} must be strictly positive, got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }

    /// Evaluate a record's wall-clock timeout against an explicit `now`
    ///
    /// Pure function of `now`, `started_at` and the record's own timeout;
    /// no side effects.
    pub fn check_timeout(record: &ExecutionRecord, now: DateTime<Utc>) -> TimeoutCheck {
        let elapsed_ms = (now - record.started_at).num_milliseconds().max(0) as u64;
        let budget_ms = record.timeout.as_millis() as u64;

        TimeoutCheck {
            is_timed_out: elapsed_ms > budget_ms,
            time_until_timeout_ms: budget_ms.saturating_sub(elapsed_ms),
        }
    }
}

/// Result of a pure timeout check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutCheck {
    /// Whether the execution has exceeded its wall-clock budget
    pub is_timed_out: bool,

    /// Remaining budget, clamped at zero once exceeded
    pub time_until_timeout_ms: u64,
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v| *v > 0)
}
