//! Per-execution circuit breakers guarding retryable operations
//!
//! Each execution gets its own breaker so one agent's failing tool or LLM
//! call cannot block unrelated runs. Closed is normal operation; after
//! `failure_threshold` consecutive failures the breaker opens and fails fast
//! for `recovery_timeout`; the first call after the cooldown flips it to
//! half-open, and `success_threshold` consecutive successes close it again.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, TrackerError};
use crate::policy::TimeoutPolicy;
use crate::record::{BreakerSnapshot, CircuitState};

/// Failure-counting state machine for a single execution
#[derive(Debug)]
struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    success_streak: u32,
    opened_at: Option<Instant>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
}

impl CircuitBreaker {
    fn new(failure_threshold: u32, recovery_timeout: Duration, success_threshold: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_streak: 0,
            opened_at: None,
            failure_threshold,
            recovery_timeout,
            success_threshold,
        }
    }

    /// Admit or reject a new call
    ///
    /// Returns the remaining cooldown when the breaker is open. An open
    /// breaker whose cooldown has elapsed transitions to half-open and
    /// admits the probing call.
    fn try_acquire(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| now.duration_since(t))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.recovery_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.success_streak = 0;
                    debug!("Circuit breaker transitioning to half-open");
                    Ok(())
                } else {
                    Err(self.recovery_timeout - elapsed)
                }
            }
        }
    }

    fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.success_streak += 1;
                if self.success_streak >= self.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_streak = 0;
                    self.opened_at = None;
                    debug!("Circuit breaker closed after successful probes");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                    warn!(
                        failures = self.failure_count,
                        "Circuit breaker opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Any failure while probing reopens immediately.
                self.state = CircuitState::Open;
                self.failure_count += 1;
                self.success_streak = 0;
                self.opened_at = Some(now);
                warn!("Circuit breaker reopened by half-open failure");
            }
            CircuitState::Open => {
                self.failure_count += 1;
            }
        }
    }

    fn can_retry(&self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self
                .opened_at
                .map(|t| now.duration_since(t) >= self.recovery_timeout)
                .unwrap_or(true),
        }
    }

    fn snapshot(&self, now: Instant) -> BreakerSnapshot {
        let next_attempt_at = match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                let remaining = self.recovery_timeout.saturating_sub(now.duration_since(opened));
                Some(Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero()))
            }
            _ => None,
        };
        BreakerSnapshot {
            state: self.state,
            failures: self.failure_count,
            next_attempt_at,
        }
    }
}

/// Observable breaker state for one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub can_retry: bool,
    pub is_open: bool,
}

/// Breakers keyed by execution id
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
    operation_timeout: Duration,
}

impl BreakerRegistry {
    pub fn new(policy: &TimeoutPolicy) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            failure_threshold: policy.failure_threshold,
            recovery_timeout: policy.recovery_timeout,
            success_threshold: policy.success_threshold,
            operation_timeout: policy.llm_api_timeout,
        }
    }

    /// Initialize a closed breaker for an execution
    pub async fn register(&self, execution_id: &str) {
        let mut breakers = self.breakers.write().await;
        breakers.entry(execution_id.to_string()).or_insert_with(|| {
            CircuitBreaker::new(
                self.failure_threshold,
                self.recovery_timeout,
                self.success_threshold,
            )
        });
    }

    /// Drop the breaker for a removed execution
    pub async fn unregister(&self, execution_id: &str) {
        self.breakers.write().await.remove(execution_id);
    }

    /// Run `operation` under the execution's breaker
    ///
    /// Fails fast with `CircuitOpen` while the breaker is open, without
    /// polling the operation. The call itself is bounded by the policy's
    /// operation timeout; an elapsed timeout counts as a failure and maps to
    /// `OperationTimeout` carrying the operation name and the bound.
    /// Breaker state changes only affect calls admitted after them; a call
    /// already in flight runs to completion.
    pub async fn execute_guarded<T, F>(
        &self,
        execution_id: &str,
        operation_name: &str,
        operation: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        {
            let mut breakers = self.breakers.write().await;
            let breaker = breakers
                .get_mut(execution_id)
                .ok_or_else(|| TrackerError::not_found(execution_id))?;

            if let Err(retry_in) = breaker.try_acquire(Instant::now()) {
                return Err(TrackerError::circuit_open(
                    operation_name,
                    breaker.failure_count,
                    breaker.failure_threshold,
                    retry_in,
                ));
            }
        }

        let outcome = tokio::time::timeout(self.operation_timeout, operation).await;

        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TrackerError::operation_timeout(
                operation_name,
                self.operation_timeout,
            )),
        };

        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get_mut(execution_id) {
            match &result {
                Ok(_) => breaker.record_success(),
                Err(_) => breaker.record_failure(Instant::now()),
            }
        }

        result
    }

    /// Observable status for an execution's breaker
    pub async fn status(&self, execution_id: &str) -> Result<BreakerStatus> {
        let breakers = self.breakers.read().await;
        let breaker = breakers
            .get(execution_id)
            .ok_or_else(|| TrackerError::not_found(execution_id))?;

        let now = Instant::now();
        Ok(BreakerStatus {
            state: breaker.state,
            failure_count: breaker.failure_count,
            can_retry: breaker.can_retry(now),
            is_open: breaker.state == CircuitState::Open,
        })
    }

    /// Breaker sub-state mirrored onto the execution record
    pub async fn snapshot(&self, execution_id: &str) -> Result<BreakerSnapshot> {
        let breakers = self.breakers.read().await;
        let breaker = breakers
            .get(execution_id)
            .ok_or_else(|| TrackerError::not_found(execution_id))?;
        Ok(breaker.snapshot(Instant::now()))
    }
}
