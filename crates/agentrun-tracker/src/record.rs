use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse lifecycle state of an execution
///
/// Transitions only move forward:
/// `Pending → Starting → Running → Completing → {Completed | Failed | TimedOut | Dead | Cancelled}`.
/// The bracketed states are terminal and mutually exclusive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    /// Execution has been created but not started
    Pending,

    /// Execution has been handed to a worker
    Starting,

    /// Worker is actively making progress
    Running,

    /// Worker is finalizing its result
    Completing,

    /// Execution completed successfully
    Completed,

    /// Execution failed
    Failed,

    /// Execution exceeded its wall-clock timeout
    TimedOut,

    /// Worker stopped heartbeating without reporting an outcome
    Dead,

    /// Execution was cancelled
    Cancelled,
}

impl ExecutionState {
    /// Check if this state is terminal (no further mutation permitted)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::TimedOut
                | ExecutionState::Dead
                | ExecutionState::Cancelled
        )
    }

    /// Position in the forward lifecycle, used to reject backward transitions
    fn rank(&self) -> u8 {
        match self {
            ExecutionState::Pending => 0,
            ExecutionState::Starting => 1,
            ExecutionState::Running => 2,
            ExecutionState::Completing => 3,
            // Terminal states share a rank: reachable from any non-terminal
            // state but never from each other.
            _ => 4,
        }
    }

    /// Check whether a transition to `next` is a legal forward move
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank() || next.is_terminal()
    }

    /// The named heartbeat-promotion rule: a heartbeat on a `Starting`
    /// execution is an implicit "work has begun" signal and moves it to
    /// `Running`. Other states are left alone.
    pub fn promoted_by_heartbeat(&self) -> Option<ExecutionState> {
        match self {
            ExecutionState::Starting => Some(ExecutionState::Running),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Starting => "starting",
            ExecutionState::Running => "running",
            ExecutionState::Completing => "completing",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::TimedOut => "timed_out",
            ExecutionState::Dead => "dead",
            ExecutionState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Fine-grained progress phase, independent of the coarse lifecycle state
///
/// Used purely for progress reporting. Transitions are permissive: agent
/// control flow is not fully predictable, so out-of-order phases are
/// accepted and logged, never rejected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExecutionPhase {
    Created,
    Setup,
    ContextValidation,
    Starting,
    Thinking,
    ToolPreparation,
    ToolExecution,
    LlmInteraction,
    ResultProcessing,
    Completing,
    Completed,
    Failed,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionPhase::Created => "created",
            ExecutionPhase::Setup => "setup",
            ExecutionPhase::ContextValidation => "context_validation",
            ExecutionPhase::Starting => "starting",
            ExecutionPhase::Thinking => "thinking",
            ExecutionPhase::ToolPreparation => "tool_preparation",
            ExecutionPhase::ToolExecution => "tool_execution",
            ExecutionPhase::LlmInteraction => "llm_interaction",
            ExecutionPhase::ResultProcessing => "result_processing",
            ExecutionPhase::Completing => "completing",
            ExecutionPhase::Completed => "completed",
            ExecutionPhase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// One entry in a record's append-only phase history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpan {
    /// Phase this span covers
    pub phase: ExecutionPhase,

    /// When the phase was entered
    pub entered_at: DateTime<Utc>,

    /// When the phase was exited; `None` while the phase is current
    pub exited_at: Option<DateTime<Utc>>,

    /// Caller-supplied metadata for this transition
    pub metadata: serde_json::Value,
}

/// State of a record's circuit breaker, mirrored for observability
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Blocking calls until the recovery timeout elapses
    Open,

    /// Probing: allowing calls through while counting successes
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker sub-state carried on the record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Default for BreakerSnapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            next_attempt_at: None,
        }
    }
}

/// Tracked state for one agent execution
///
/// Identity fields are immutable after creation; mutable state is only
/// touched through the registry, which enforces the terminal-state
/// invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Unique execution ID, never reused for the life of the process
    pub execution_id: String,

    /// Agent being run
    pub agent_name: String,

    /// Conversation thread / session this run belongs to
    pub thread_id: String,

    /// User who triggered the run
    pub user_id: String,

    /// Coarse lifecycle state
    pub state: ExecutionState,

    /// Fine-grained progress phase
    pub current_phase: ExecutionPhase,

    /// When the execution was created
    pub started_at: DateTime<Utc>,

    /// Last liveness signal from the worker
    pub last_heartbeat_at: DateTime<Utc>,

    /// Last mutation of any kind
    pub updated_at: DateTime<Utc>,

    /// Set exactly when the execution reaches a terminal state
    pub completed_at: Option<DateTime<Utc>>,

    /// Monotonically non-decreasing heartbeat counter
    pub heartbeat_count: u64,

    /// Opaque result payload, set on completion
    pub result: Option<serde_json::Value>,

    /// Error message, set on failure/timeout/death
    pub error: Option<String>,

    /// Caller-supplied metadata, immutable after creation
    pub metadata: serde_json::Value,

    /// Per-execution wall-clock timeout
    pub timeout: Duration,

    /// Circuit breaker sub-state
    pub breaker: BreakerSnapshot,

    /// Append-only phase history
    pub phase_history: Vec<PhaseSpan>,
}

impl ExecutionRecord {
    /// Create a new record in `Pending` with an opening `Created` phase span
    pub fn new(
        execution_id: String,
        agent_name: String,
        thread_id: String,
        user_id: String,
        timeout: Duration,
        metadata: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            agent_name,
            thread_id,
            user_id,
            state: ExecutionState::Pending,
            current_phase: ExecutionPhase::Created,
            started_at: now,
            last_heartbeat_at: now,
            updated_at: now,
            completed_at: None,
            heartbeat_count: 0,
            result: None,
            error: None,
            metadata,
            timeout,
            breaker: BreakerSnapshot::default(),
            phase_history: vec![PhaseSpan {
                phase: ExecutionPhase::Created,
                entered_at: now,
                exited_at: None,
                metadata: serde_json::json!({}),
            }],
        }
    }

    /// Check if this record has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
