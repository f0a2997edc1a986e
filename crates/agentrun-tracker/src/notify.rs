//! Notification port for pushing progress to the surrounding system
//!
//! The registry calls the injected `NotificationPort` on state and phase
//! transitions. Delivery transport, ordering to end users and reconnection
//! are entirely the collaborator's responsibility; dispatch here is bounded
//! by a short timeout so a slow sink can never stall execution tracking.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::record::ExecutionPhase;

/// Bound on a single notification dispatch
pub const NOTIFY_TIMEOUT: Duration = Duration::from_millis(250);

/// Externally meaningful event kinds pushed through the port
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Thinking,
    ToolExecuting,
    ToolCompleted,
    Completed,
    Error,
}

impl EventKind {
    /// Wire name used by the surrounding system
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::Thinking => "thinking",
            EventKind::ToolExecuting => "tool-executing",
            EventKind::ToolCompleted => "tool-completed",
            EventKind::Completed => "completed",
            EventKind::Error => "error",
        }
    }

    /// Static phase-to-event mapping
    ///
    /// Most phases are internal progress markers and map to nothing.
    pub fn for_phase(phase: ExecutionPhase) -> Option<EventKind> {
        match phase {
            ExecutionPhase::Starting => Some(EventKind::Started),
            ExecutionPhase::Thinking => Some(EventKind::Thinking),
            ExecutionPhase::ToolExecution => Some(EventKind::ToolExecuting),
            ExecutionPhase::ResultProcessing => Some(EventKind::ToolCompleted),
            ExecutionPhase::Completed => Some(EventKind::Completed),
            ExecutionPhase::Failed => Some(EventKind::Error),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A notification as delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub execution_id: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

/// Injected sink for execution progress events
#[async_trait]
pub trait NotificationPort: Send + Sync {
    async fn notify(&self, execution_id: &str, kind: EventKind, payload: serde_json::Value);
}

/// Dispatch helper: bounded-timeout, warn-and-continue on a slow sink
pub(crate) async fn dispatch(
    port: &dyn NotificationPort,
    execution_id: &str,
    kind: EventKind,
    payload: serde_json::Value,
) {
    let result = tokio::time::timeout(NOTIFY_TIMEOUT, port.notify(execution_id, kind, payload)).await;
    if result.is_err() {
        warn!(
            execution_id = %execution_id,
            event = %kind,
            timeout_ms = NOTIFY_TIMEOUT.as_millis() as u64,
            "Notification sink too slow, event dropped"
        );
    }
}

/// Notification port that drops everything
pub struct NullNotifier;

#[async_trait]
impl NotificationPort for NullNotifier {
    async fn notify(&self, _execution_id: &str, _kind: EventKind, _payload: serde_json::Value) {}
}

/// In-process fan-out over a tokio broadcast channel
///
/// Lagging receivers lose old events rather than blocking the sender.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all execution notifications
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl NotificationPort for BroadcastNotifier {
    async fn notify(&self, execution_id: &str, kind: EventKind, payload: serde_json::Value) {
        // Send fails only when there are no subscribers, which is fine.
        let _ = self.sender.send(Notification {
            execution_id: execution_id.to_string(),
            kind,
            payload,
        });
    }
}
