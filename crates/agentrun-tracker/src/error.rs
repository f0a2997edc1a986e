//! Error types for the execution tracking layer

use std::time::Duration;

use thiserror::Error;

use crate::record::ExecutionState;

/// Main error type for tracker operations
///
/// `NotFound`, `InvalidState` and `Terminal` are expected-race values: two
/// callers completing the same execution, a late heartbeat after a monitor
/// transition. Callers handle them with a no-op or log-and-continue, never
/// as fatal failures.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("execution not found: {0}")]
    NotFound(String),

    #[error("operation '{operation}' not allowed for execution {execution_id} in state {state}")]
    InvalidState {
        execution_id: String,
        operation: &'static str,
        state: ExecutionState,
    },

    #[error("execution {execution_id} already finished in state {state}; no further mutation permitted")]
    Terminal {
        execution_id: String,
        state: ExecutionState,
    },

    #[error("circuit breaker open for operation '{operation}' after {failures} failures (threshold {threshold}); retry in {retry_in_ms}ms")]
    CircuitOpen {
        operation: String,
        failures: u32,
        threshold: u32,
        retry_in_ms: u64,
    },

    #[error("operation '{operation}' timed out after {timeout_ms}ms")]
    OperationTimeout { operation: String, timeout_ms: u64 },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("operation '{operation}' failed: {message}")]
    Operation { operation: String, message: String },
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, TrackerError>;

impl TrackerError {
    /// Create a not found error
    pub fn not_found(execution_id: impl Into<String>) -> Self {
        TrackerError::NotFound(execution_id.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        TrackerError::Validation(msg.into())
    }

    /// Create a circuit-open error for a blocked operation
    pub fn circuit_open(operation: &str, failures: u32, threshold: u32, retry_in: Duration) -> Self {
        TrackerError::CircuitOpen {
            operation: operation.to_string(),
            failures,
            threshold,
            retry_in_ms: retry_in.as_millis() as u64,
        }
    }

    /// Create an operation timeout error
    pub fn operation_timeout(operation: &str, timeout: Duration) -> Self {
        TrackerError::OperationTimeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a guarded-operation failure
    pub fn operation(operation: &str, message: impl Into<String>) -> Self {
        TrackerError::Operation {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Check whether this error represents an expected race rather than a bug
    pub fn is_expected_race(&self) -> bool {
        matches!(
            self,
            TrackerError::NotFound(_)
                | TrackerError::InvalidState { .. }
                | TrackerError::Terminal { .. }
        )
    }
}
