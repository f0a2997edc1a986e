//! Agent Run Tracker - Execution Lifecycle Tracking Layer
//!
//! The single source of truth for the lifecycle of asynchronous agent runs:
//! - Creation, liveness and terminal-outcome tracking per execution
//! - Heartbeat-based dead-worker detection and wall-clock timeouts
//! - Per-execution circuit breakers guarding retryable operations
//! - Fine-grained phase state machine for progress notification
//! - On-demand metrics without duplicating state management
//!
//! The registry is constructed explicitly by the application's composition
//! root and shared by reference; there is no process-wide singleton in
//! library code.

pub mod breaker;
pub mod error;
pub mod id;
pub mod metrics;
pub mod monitor;
pub mod notify;
pub mod phase;
pub mod policy;
pub mod record;
pub mod registry;
pub mod snapshot;

pub use breaker::{BreakerRegistry, BreakerStatus};
pub use error::{Result, TrackerError};
pub use id::{IdGenerator, UuidIdGenerator, EXECUTION_ID_PREFIX};
pub use metrics::{MetricsSnapshot, TrackerMetrics};
pub use monitor::{LivenessCallback, LivenessMonitor, MonitorConfig};
pub use notify::{BroadcastNotifier, EventKind, Notification, NotificationPort, NullNotifier};
pub use policy::{TimeoutCheck, TimeoutPolicy};
pub use record::{
    BreakerSnapshot, CircuitState, ExecutionPhase, ExecutionRecord, ExecutionState, PhaseSpan,
};
pub use registry::{
    CompletionOutcome, CreateExecution, ExecutionRegistry, LivenessReport, LivenessVerdict,
};
pub use snapshot::{NullSnapshotStore, SnapshotStore};
