//! Execution registry: the concurrency-safe source of truth for agent runs
//!
//! Owns the map of execution id to record plus by-agent and by-thread
//! indices. Locking is per-record: the outer map lock is held only for map
//! access, never across record mutation or notification dispatch, so
//! callers tracking different executions never block each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::breaker::{BreakerRegistry, BreakerStatus};
use crate::error::{Result, TrackerError};
use crate::id::{IdGenerator, UuidIdGenerator};
use crate::metrics::{MetricsSnapshot, TrackerMetrics};
use crate::notify::{self, EventKind, NotificationPort, NullNotifier};
use crate::phase;
use crate::policy::{TimeoutCheck, TimeoutPolicy};
use crate::record::{CircuitState, ExecutionPhase, ExecutionRecord, ExecutionState};
use crate::snapshot::{self, NullSnapshotStore, SnapshotStore};

/// Arguments for creating a new execution
#[derive(Debug, Clone)]
pub struct CreateExecution {
    pub agent_name: String,
    pub thread_id: String,
    pub user_id: String,
    pub timeout: Option<Duration>,
    pub metadata: Option<serde_json::Value>,
}

impl CreateExecution {
    pub fn new(
        agent_name: impl Into<String>,
        thread_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            thread_id: thread_id.into(),
            user_id: user_id.into(),
            timeout: None,
            metadata: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Outcome of a state update
#[derive(Debug, Clone, Copy)]
pub struct CompletionOutcome {
    /// State the record is in after the call
    pub state: ExecutionState,

    /// Whether the audit snapshot reached the persistence collaborator.
    /// `false` is a warning, not a failure: tracking continued in-memory.
    pub persisted: bool,
}

/// Why a record was reported by the liveness scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// No heartbeat within the policy threshold. Death takes priority over
    /// a simultaneous wall-clock timeout since it is the more specific
    /// signal of actual failure; `also_timed_out` preserves the overlap so
    /// both callback classes still fire.
    Dead {
        heartbeat_gap: Duration,
        also_timed_out: bool,
    },

    /// Still heartbeating but past its wall-clock budget
    TimedOut { elapsed: Duration },
}

/// One record flagged by `detect_dead_or_timed_out`
#[derive(Debug, Clone)]
pub struct LivenessReport {
    pub record: ExecutionRecord,
    pub verdict: LivenessVerdict,
}

/// Primary map plus derived indices, updated atomically together
#[derive(Default)]
struct RegistryState {
    records: HashMap<String, Arc<RwLock<ExecutionRecord>>>,
    by_agent: HashMap<String, Vec<String>>,
    by_thread: HashMap<String, Vec<String>>,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    dead: AtomicU64,
    cancelled: AtomicU64,
}

/// Concurrency-safe registry of agent executions
pub struct ExecutionRegistry {
    state: RwLock<RegistryState>,
    counters: Counters,
    breakers: BreakerRegistry,
    policy: TimeoutPolicy,
    notifier: Arc<dyn NotificationPort>,
    snapshots: Arc<dyn SnapshotStore>,
    ids: Arc<dyn IdGenerator>,
    metrics: Arc<TrackerMetrics>,
}

impl ExecutionRegistry {
    /// Create a registry with the given policy and default collaborators
    pub fn new(policy: TimeoutPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            state: RwLock::new(RegistryState::default()),
            counters: Counters::default(),
            breakers: BreakerRegistry::new(&policy),
            policy,
            notifier: Arc::new(NullNotifier),
            snapshots: Arc::new(NullSnapshotStore),
            ids: Arc::new(UuidIdGenerator),
            metrics: Arc::new(TrackerMetrics::default()),
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationPort>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<TrackerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    pub fn prometheus(&self) -> &TrackerMetrics {
        &self.metrics
    }

    /// Create a new execution in `Pending` and index it
    #[instrument(skip(self, request), fields(agent_name = %request.agent_name))]
    pub async fn create(&self, request: CreateExecution) -> Result<String> {
        for (name, value) in [
            ("agent_name", &request.agent_name),
            ("thread_id", &request.thread_id),
            ("user_id", &request.user_id),
        ] {
            if value.trim().is_empty() {
                return Err(TrackerError::validation(format!("{} must not be empty", name)));
            }
        }

        let timeout = request.timeout.unwrap_or(self.policy.agent_execution_timeout);
        if timeout.is_zero() {
            return Err(TrackerError::validation(
                "timeout must be strictly positive".to_string(),
            ));
        }

        let execution_id = {
            let mut state = self.state.write().await;

            // The generator guarantees uniqueness; the loop makes a
            // misbehaving injected generator unable to clobber a live record.
            let mut id = self.ids.next_id();
            while state.records.contains_key(&id) {
                id = self.ids.next_id();
            }

            let record = ExecutionRecord::new(
                id.clone(),
                request.agent_name.clone(),
                request.thread_id.clone(),
                request.user_id.clone(),
                timeout,
                request.metadata.unwrap_or_else(|| serde_json::json!({})),
            );

            state
                .records
                .insert(id.clone(), Arc::new(RwLock::new(record)));
            state
                .by_agent
                .entry(request.agent_name.clone())
                .or_default()
                .push(id.clone());
            state
                .by_thread
                .entry(request.thread_id.clone())
                .or_default()
                .push(id.clone());
            id
        };

        self.breakers.register(&execution_id).await;
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        self.metrics.execution_started();

        info!(execution_id = %execution_id, "Tracking new execution");
        Ok(execution_id)
    }

    /// Get a consistent snapshot of one record
    pub async fn get(&self, execution_id: &str) -> Result<ExecutionRecord> {
        let handle = self.record_handle(execution_id).await?;
        let record = handle.read().await;
        Ok(record.clone())
    }

    /// Move a `Pending` execution to `Starting`
    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn start(&self, execution_id: &str) -> Result<()> {
        let handle = self.record_handle(execution_id).await?;
        let mut record = handle.write().await;

        if record.is_terminal() {
            return Err(TrackerError::Terminal {
                execution_id: execution_id.to_string(),
                state: record.state,
            });
        }
        if record.state != ExecutionState::Pending {
            return Err(TrackerError::InvalidState {
                execution_id: execution_id.to_string(),
                operation: "start",
                state: record.state,
            });
        }

        record.state = ExecutionState::Starting;
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Record a liveness signal
    ///
    /// Applies the named heartbeat-promotion rule: a heartbeat on a
    /// `Starting` execution moves it to `Running`.
    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn heartbeat(&self, execution_id: &str) -> Result<ExecutionState> {
        let handle = self.record_handle(execution_id).await?;
        let mut record = handle.write().await;

        if record.is_terminal() {
            return Err(TrackerError::Terminal {
                execution_id: execution_id.to_string(),
                state: record.state,
            });
        }

        let now = Utc::now();
        record.heartbeat_count += 1;
        record.last_heartbeat_at = now;
        record.updated_at = now;
        if let Some(promoted) = record.state.promoted_by_heartbeat() {
            debug!(execution_id = %execution_id, "Heartbeat promoted execution to running");
            record.state = promoted;
        }

        self.metrics.heartbeat();
        Ok(record.state)
    }

    /// Transition the coarse lifecycle state
    ///
    /// Terminal transitions are idempotent-safe: repeating the same terminal
    /// state is a no-op success, a different terminal state is rejected.
    /// Entering a terminal state sets `completed_at`, updates aggregate
    /// counters, mirrors the record to the persistence collaborator
    /// (warn-only) and notifies the port.
    #[instrument(skip(self, error, result), fields(execution_id = %execution_id, new_state = %new_state))]
    pub async fn update_state(
        &self,
        execution_id: &str,
        new_state: ExecutionState,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) -> Result<CompletionOutcome> {
        let handle = self.record_handle(execution_id).await?;

        let finished = {
            let mut record = handle.write().await;

            if record.is_terminal() {
                if record.state == new_state {
                    return Ok(CompletionOutcome {
                        state: record.state,
                        persisted: true,
                    });
                }
                return Err(TrackerError::Terminal {
                    execution_id: execution_id.to_string(),
                    state: record.state,
                });
            }

            if !record.state.can_transition_to(new_state) {
                return Err(TrackerError::InvalidState {
                    execution_id: execution_id.to_string(),
                    operation: "update_state",
                    state: record.state,
                });
            }

            let now = Utc::now();
            record.state = new_state;
            record.updated_at = now;
            if error.is_some() {
                record.error = error;
            }
            if result.is_some() {
                record.result = result;
            }

            if new_state.is_terminal() {
                record.completed_at = Some(now);
                Some(record.clone())
            } else {
                None
            }
        };

        let Some(final_record) = finished else {
            return Ok(CompletionOutcome {
                state: new_state,
                persisted: true,
            });
        };

        let counter = match new_state {
            ExecutionState::Completed => &self.counters.succeeded,
            ExecutionState::Failed => &self.counters.failed,
            ExecutionState::TimedOut => &self.counters.timed_out,
            ExecutionState::Dead => &self.counters.dead,
            ExecutionState::Cancelled => &self.counters.cancelled,
            _ => unreachable!("is_terminal checked above"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .execution_finished(new_state, phase::total_duration_ms(&final_record, Utc::now()));

        let persisted = snapshot::mirror(self.snapshots.as_ref(), &final_record).await;

        let (kind, payload) = match new_state {
            ExecutionState::Completed => (
                EventKind::Completed,
                serde_json::json!({
                    "agent_name": final_record.agent_name,
                    "result": final_record.result,
                }),
            ),
            _ => (
                EventKind::Error,
                serde_json::json!({
                    "agent_name": final_record.agent_name,
                    "state": new_state.to_string(),
                    "error": final_record.error,
                }),
            ),
        };
        notify::dispatch(self.notifier.as_ref(), execution_id, kind, payload).await;

        info!(
            execution_id = %execution_id,
            state = %new_state,
            persisted = persisted,
            "Execution finished"
        );

        Ok(CompletionOutcome {
            state: new_state,
            persisted,
        })
    }

    /// Drive the fine-grained phase state machine
    ///
    /// Never rejects a transition; out-of-order phases are accepted. If the
    /// new phase maps to an externally meaningful event it is dispatched
    /// through the notification port.
    #[instrument(skip(self, metadata), fields(execution_id = %execution_id, phase = %new_phase))]
    pub async fn transition_phase(
        &self,
        execution_id: &str,
        new_phase: ExecutionPhase,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let handle = self.record_handle(execution_id).await?;

        let (event, agent_name) = {
            let mut record = handle.write().await;
            let event = phase::apply_phase(
                &mut record,
                new_phase,
                metadata.unwrap_or_else(|| serde_json::json!({})),
                Utc::now(),
            );
            (event, record.agent_name.clone())
        };

        if let Some(kind) = event {
            let payload = serde_json::json!({
                "agent_name": agent_name,
                "phase": new_phase.to_string(),
            });
            notify::dispatch(self.notifier.as_ref(), execution_id, kind, payload).await;
        }

        Ok(())
    }

    /// Run an operation under the execution's circuit breaker
    ///
    /// Fails fast with `CircuitOpen` while the breaker is open; mirrors the
    /// breaker sub-state back onto the record after the call.
    pub async fn execute_guarded<T, F>(
        &self,
        execution_id: &str,
        operation_name: &str,
        operation: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let handle = self.record_handle(execution_id).await?;

        let result = self
            .breakers
            .execute_guarded(execution_id, operation_name, operation)
            .await;

        if let Ok(mirror) = self.breakers.snapshot(execution_id).await {
            let mut record = handle.write().await;
            let was_open = record.breaker.state == CircuitState::Open;
            if !was_open && mirror.state == CircuitState::Open {
                self.metrics.breaker_opened();
            }
            record.breaker = mirror;
        }

        result
    }

    /// Observable breaker status for one execution
    pub async fn breaker_status(&self, execution_id: &str) -> Result<BreakerStatus> {
        self.breakers.status(execution_id).await
    }

    /// Pure wall-clock timeout check for one execution
    pub async fn check_timeout(&self, execution_id: &str) -> Result<TimeoutCheck> {
        let record = self.get(execution_id).await?;
        Ok(TimeoutPolicy::check_timeout(&record, Utc::now()))
    }

    /// Time spent in one phase, `None` if the phase was never entered
    pub async fn phase_duration_ms(
        &self,
        execution_id: &str,
        phase: ExecutionPhase,
    ) -> Result<Option<i64>> {
        let record = self.get(execution_id).await?;
        Ok(phase::phase_duration_ms(&record, phase, Utc::now()))
    }

    /// Total duration from creation to completion (or now)
    pub async fn total_duration_ms(&self, execution_id: &str) -> Result<i64> {
        let record = self.get(execution_id).await?;
        Ok(phase::total_duration_ms(&record, Utc::now()))
    }

    /// Read-only scan for dead and timed-out executions
    ///
    /// Each record is evaluated against one consistent snapshot of its
    /// fields; the scan never mutates anything. A record past both
    /// thresholds is reported dead with `also_timed_out` set.
    pub async fn detect_dead_or_timed_out(&self) -> Vec<LivenessReport> {
        let handles: Vec<Arc<RwLock<ExecutionRecord>>> = {
            let state = self.state.read().await;
            state.records.values().cloned().collect()
        };

        let now = Utc::now();
        let heartbeat_budget_ms = self.policy.heartbeat_timeout.as_millis() as i64;
        let mut reports = Vec::new();

        for handle in handles {
            let record = handle.read().await.clone();
            if record.is_terminal() {
                continue;
            }

            let gap_ms = (now - record.last_heartbeat_at).num_milliseconds().max(0);
            let check = TimeoutPolicy::check_timeout(&record, now);

            if gap_ms > heartbeat_budget_ms {
                reports.push(LivenessReport {
                    record,
                    verdict: LivenessVerdict::Dead {
                        heartbeat_gap: Duration::from_millis(gap_ms as u64),
                        also_timed_out: check.is_timed_out,
                    },
                });
            } else if check.is_timed_out {
                let elapsed_ms = (now - record.started_at).num_milliseconds().max(0);
                reports.push(LivenessReport {
                    record,
                    verdict: LivenessVerdict::TimedOut {
                        elapsed: Duration::from_millis(elapsed_ms as u64),
                    },
                });
            }
        }

        reports
    }

    /// Remove terminal records older than the retention window
    ///
    /// Never removes a non-terminal record. Index entries are dropped in
    /// the same critical section as the primary map, so indices never
    /// reference a removed record.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero());

        let removed: Vec<String> = {
            let mut state = self.state.write().await;

            let mut expired = Vec::new();
            for (id, handle) in &state.records {
                // Only records already terminal can hold the lock briefly
                // here; try_read avoids stalling the sweep on a record being
                // actively mutated, which by definition is not stale.
                if let Ok(record) = handle.try_read() {
                    if let Some(completed_at) = record.completed_at {
                        if record.is_terminal() && now - completed_at > retention {
                            expired.push((id.clone(), record.agent_name.clone(), record.thread_id.clone()));
                        }
                    }
                }
            }

            let mut removed = Vec::with_capacity(expired.len());
            for (id, agent_name, thread_id) in expired {
                state.records.remove(&id);
                if let Some(ids) = state.by_agent.get_mut(&agent_name) {
                    ids.retain(|existing| existing != &id);
                    if ids.is_empty() {
                        state.by_agent.remove(&agent_name);
                    }
                }
                if let Some(ids) = state.by_thread.get_mut(&thread_id) {
                    ids.retain(|existing| existing != &id);
                    if ids.is_empty() {
                        state.by_thread.remove(&thread_id);
                    }
                }
                removed.push(id);
            }
            removed
        };

        for id in &removed {
            self.breakers.unregister(id).await;
        }

        if !removed.is_empty() {
            debug!(count = removed.len(), "Cleaned up expired terminal records");
        }
        removed.len()
    }

    /// Aggregate counters as one consistent snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot::from_counts(
            self.counters.total.load(Ordering::Relaxed),
            self.counters.succeeded.load(Ordering::Relaxed),
            self.counters.failed.load(Ordering::Relaxed),
            self.counters.timed_out.load(Ordering::Relaxed),
            self.counters.dead.load(Ordering::Relaxed),
            self.counters.cancelled.load(Ordering::Relaxed),
        )
    }

    /// All records not yet in a terminal state
    pub async fn list_active(&self) -> Vec<ExecutionRecord> {
        let handles: Vec<Arc<RwLock<ExecutionRecord>>> = {
            let state = self.state.read().await;
            state.records.values().cloned().collect()
        };

        let mut active = Vec::new();
        for handle in handles {
            let record = handle.read().await;
            if !record.is_terminal() {
                active.push(record.clone());
            }
        }
        active
    }

    /// Executions created for an agent
    pub async fn list_by_agent(&self, agent_name: &str) -> Vec<ExecutionRecord> {
        self.list_index(|state| state.by_agent.get(agent_name).cloned())
            .await
    }

    /// Executions created for a thread / session
    pub async fn list_by_thread(&self, thread_id: &str) -> Vec<ExecutionRecord> {
        self.list_index(|state| state.by_thread.get(thread_id).cloned())
            .await
    }

    async fn list_index<F>(&self, select: F) -> Vec<ExecutionRecord>
    where
        F: FnOnce(&RegistryState) -> Option<Vec<String>>,
    {
        let handles: Vec<Arc<RwLock<ExecutionRecord>>> = {
            let state = self.state.read().await;
            let Some(ids) = select(&state) else {
                return Vec::new();
            };
            ids.iter()
                .filter_map(|id| state.records.get(id).cloned())
                .collect()
        };

        let mut records = Vec::with_capacity(handles.len());
        for handle in handles {
            records.push(handle.read().await.clone());
        }
        records
    }

    async fn record_handle(&self, execution_id: &str) -> Result<Arc<RwLock<ExecutionRecord>>> {
        let state = self.state.read().await;
        state
            .records
            .get(execution_id)
            .cloned()
            .ok_or_else(|| TrackerError::not_found(execution_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::BroadcastNotifier;
    use std::collections::HashSet;

    fn registry() -> ExecutionRegistry {
        ExecutionRegistry::new(TimeoutPolicy::default()).unwrap()
    }

    fn request() -> CreateExecution {
        CreateExecution::new("researcher", "thread-1", "user-1")
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let reg = registry();
        let id = reg
            .create(request().with_metadata(serde_json::json!({"topic": "rust"})))
            .await
            .unwrap();

        assert!(id.starts_with("exec-"));
        let record = reg.get(&id).await.unwrap();
        assert_eq!(record.state, ExecutionState::Pending);
        assert_eq!(record.agent_name, "researcher");
        assert_eq!(record.metadata["topic"], "rust");
        assert_eq!(record.timeout, reg.policy().agent_execution_timeout);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_agent_name() {
        let reg = registry();
        let result = reg.create(CreateExecution::new("  ", "t", "u")).await;
        assert!(matches!(result, Err(TrackerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_get_unknown_execution() {
        let reg = registry();
        assert!(matches!(
            reg.get("exec-missing").await,
            Err(TrackerError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_yield_unique_ids() {
        let reg = Arc::new(registry());

        let mut tasks = Vec::new();
        for i in 0..100 {
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..100 {
                    let id = reg
                        .create(CreateExecution::new("agent", "thread", format!("user-{i}")))
                        .await
                        .unwrap();
                    ids.push(id);
                }
                ids
            }));
        }

        let mut all = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(all.insert(id), "duplicate execution id");
            }
        }
        assert_eq!(all.len(), 10_000);
        assert_eq!(reg.metrics().total, 10_000);
    }

    #[tokio::test]
    async fn test_start_only_from_pending() {
        let reg = registry();
        let id = reg.create(request()).await.unwrap();

        reg.start(&id).await.unwrap();
        assert_eq!(reg.get(&id).await.unwrap().state, ExecutionState::Starting);

        let result = reg.start(&id).await;
        assert!(matches!(result, Err(TrackerError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_start_after_terminal_rejected() {
        let reg = registry();
        let id = reg.create(request()).await.unwrap();
        reg.update_state(&id, ExecutionState::Cancelled, None, None)
            .await
            .unwrap();

        assert!(matches!(
            reg.start(&id).await,
            Err(TrackerError::Terminal { .. })
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_promotes_and_counts() {
        let reg = registry();
        let id = reg.create(request()).await.unwrap();
        reg.start(&id).await.unwrap();

        let state = reg.heartbeat(&id).await.unwrap();
        assert_eq!(state, ExecutionState::Running);
        assert_eq!(reg.get(&id).await.unwrap().heartbeat_count, 1);

        reg.heartbeat(&id).await.unwrap();
        reg.heartbeat(&id).await.unwrap();
        let record = reg.get(&id).await.unwrap();
        assert_eq!(record.heartbeat_count, 3);
        assert_eq!(record.state, ExecutionState::Running);
    }

    #[tokio::test]
    async fn test_heartbeat_on_terminal_rejected() {
        let reg = registry();
        let id = reg.create(request()).await.unwrap();
        reg.update_state(&id, ExecutionState::Failed, Some("boom".into()), None)
            .await
            .unwrap();

        let before = reg.get(&id).await.unwrap().heartbeat_count;
        assert!(matches!(
            reg.heartbeat(&id).await,
            Err(TrackerError::Terminal { .. })
        ));
        assert_eq!(reg.get(&id).await.unwrap().heartbeat_count, before);
    }

    #[tokio::test]
    async fn test_terminal_idempotency() {
        let reg = registry();
        let id = reg.create(request()).await.unwrap();
        reg.start(&id).await.unwrap();
        reg.heartbeat(&id).await.unwrap();

        let outcome = reg
            .update_state(
                &id,
                ExecutionState::Completed,
                None,
                Some(serde_json::json!({"answer": 42})),
            )
            .await
            .unwrap();
        assert_eq!(outcome.state, ExecutionState::Completed);

        // Same terminal state again: no-op success.
        reg.update_state(&id, ExecutionState::Completed, None, None)
            .await
            .unwrap();

        // Different terminal state: rejected, record unchanged.
        let err = reg
            .update_state(&id, ExecutionState::Failed, Some("late".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Terminal { .. }));

        let record = reg.get(&id).await.unwrap();
        assert_eq!(record.state, ExecutionState::Completed);
        assert_eq!(record.result, Some(serde_json::json!({"answer": 42})));
        assert!(record.error.is_none());
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_backward_transition_rejected() {
        let reg = registry();
        let id = reg.create(request()).await.unwrap();
        reg.start(&id).await.unwrap();
        reg.heartbeat(&id).await.unwrap();

        let result = reg
            .update_state(&id, ExecutionState::Starting, None, None)
            .await;
        assert!(matches!(result, Err(TrackerError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_completed_at_set_only_on_terminal() {
        let reg = registry();
        let id = reg.create(request()).await.unwrap();
        reg.start(&id).await.unwrap();
        reg.heartbeat(&id).await.unwrap();
        reg.update_state(&id, ExecutionState::Completing, None, None)
            .await
            .unwrap();
        assert!(reg.get(&id).await.unwrap().completed_at.is_none());

        reg.update_state(&id, ExecutionState::Completed, None, None)
            .await
            .unwrap();
        assert!(reg.get(&id).await.unwrap().completed_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_transition_notifies() {
        let notifier = Arc::new(BroadcastNotifier::new(16));
        let mut rx = notifier.subscribe();
        let reg = ExecutionRegistry::new(TimeoutPolicy::default())
            .unwrap()
            .with_notifier(notifier);

        let id = reg.create(request()).await.unwrap();
        reg.update_state(
            &id,
            ExecutionState::Completed,
            None,
            Some(serde_json::json!("done")),
        )
        .await
        .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Completed);
        assert_eq!(event.execution_id, id);
        assert_eq!(event.payload["result"], "done");
    }

    #[tokio::test]
    async fn test_phase_transition_notifies_mapped_events() {
        let notifier = Arc::new(BroadcastNotifier::new(16));
        let mut rx = notifier.subscribe();
        let reg = ExecutionRegistry::new(TimeoutPolicy::default())
            .unwrap()
            .with_notifier(notifier);

        let id = reg.create(request()).await.unwrap();
        reg.transition_phase(&id, ExecutionPhase::Setup, None)
            .await
            .unwrap();
        reg.transition_phase(&id, ExecutionPhase::Thinking, None)
            .await
            .unwrap();

        // Setup maps to no event, Thinking does.
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Thinking);
        assert_eq!(event.payload["phase"], "thinking");
    }

    #[tokio::test]
    async fn test_indices() {
        let reg = registry();
        let a1 = reg
            .create(CreateExecution::new("alpha", "thread-1", "u1"))
            .await
            .unwrap();
        let a2 = reg
            .create(CreateExecution::new("alpha", "thread-2", "u2"))
            .await
            .unwrap();
        let b1 = reg
            .create(CreateExecution::new("beta", "thread-1", "u1"))
            .await
            .unwrap();

        let alphas = reg.list_by_agent("alpha").await;
        assert_eq!(alphas.len(), 2);
        assert!(alphas.iter().any(|r| r.execution_id == a1));
        assert!(alphas.iter().any(|r| r.execution_id == a2));

        let thread1 = reg.list_by_thread("thread-1").await;
        assert_eq!(thread1.len(), 2);
        assert!(thread1.iter().any(|r| r.execution_id == b1));

        assert!(reg.list_by_agent("gamma").await.is_empty());
    }

    #[tokio::test]
    async fn test_detect_dead_worker() {
        let policy = TimeoutPolicy {
            heartbeat_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let reg = ExecutionRegistry::new(policy).unwrap();
        let id = reg.create(request()).await.unwrap();
        reg.start(&id).await.unwrap();
        reg.heartbeat(&id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        let reports = reg.detect_dead_or_timed_out().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].record.execution_id, id);
        match reports[0].verdict {
            LivenessVerdict::Dead {
                heartbeat_gap,
                also_timed_out,
            } => {
                assert!(heartbeat_gap >= Duration::from_millis(50));
                assert!(!also_timed_out);
            }
            other => panic!("expected Dead verdict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_detect_timed_out_execution() {
        let reg = registry();
        let id = reg
            .create(request().with_timeout(Duration::from_millis(50)))
            .await
            .unwrap();
        reg.start(&id).await.unwrap();
        reg.heartbeat(&id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        reg.heartbeat(&id).await.unwrap();

        let reports = reg.detect_dead_or_timed_out().await;
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            reports[0].verdict,
            LivenessVerdict::TimedOut { elapsed } if elapsed >= Duration::from_millis(50)
        ));
    }

    #[tokio::test]
    async fn test_dead_takes_priority_over_timeout() {
        let policy = TimeoutPolicy {
            heartbeat_timeout: Duration::from_millis(40),
            ..Default::default()
        };
        let reg = ExecutionRegistry::new(policy).unwrap();
        let id = reg
            .create(request().with_timeout(Duration::from_millis(40)))
            .await
            .unwrap();
        reg.start(&id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let reports = reg.detect_dead_or_timed_out().await;
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            reports[0].verdict,
            LivenessVerdict::Dead {
                also_timed_out: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_detect_skips_terminal_records() {
        let policy = TimeoutPolicy {
            heartbeat_timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let reg = ExecutionRegistry::new(policy).unwrap();
        let id = reg.create(request()).await.unwrap();
        reg.update_state(&id, ExecutionState::Completed, None, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(reg.detect_dead_or_timed_out().await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_stale_terminal_records() {
        let reg = registry();
        let finished = reg.create(request()).await.unwrap();
        let running = reg
            .create(CreateExecution::new("researcher", "thread-2", "user-1"))
            .await
            .unwrap();
        reg.start(&running).await.unwrap();
        reg.update_state(&finished, ExecutionState::Completed, None, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        let removed = reg.cleanup(Duration::from_millis(1)).await;
        assert_eq!(removed, 1);
        assert!(matches!(
            reg.get(&finished).await,
            Err(TrackerError::NotFound(_))
        ));
        assert!(reg.get(&running).await.is_ok());
        assert!(reg.list_by_thread("thread-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_honors_retention_window() {
        let reg = registry();
        let id = reg.create(request()).await.unwrap();
        reg.update_state(&id, ExecutionState::Completed, None, None)
            .await
            .unwrap();

        let removed = reg.cleanup(Duration::from_secs(3600)).await;
        assert_eq!(removed, 0);
        assert!(reg.get(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let reg = registry();

        for outcome in [
            ExecutionState::Completed,
            ExecutionState::Completed,
            ExecutionState::Failed,
            ExecutionState::TimedOut,
        ] {
            let id = reg.create(request()).await.unwrap();
            reg.update_state(&id, outcome, None, None).await.unwrap();
        }
        let _active = reg.create(request()).await.unwrap();

        let snap = reg.metrics();
        assert_eq!(snap.total, 5);
        assert_eq!(snap.active, 1);
        assert_eq!(snap.succeeded, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.timed_out, 1);
        assert!((snap.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((snap.failure_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_guarded_call_mirrors_breaker_state() {
        let policy = TimeoutPolicy {
            failure_threshold: 2,
            ..Default::default()
        };
        let reg = ExecutionRegistry::new(policy).unwrap();
        let id = reg.create(request()).await.unwrap();

        for _ in 0..2 {
            let _ = reg
                .execute_guarded::<(), _>(&id, "llm_call", async {
                    Err(TrackerError::operation("llm_call", "boom"))
                })
                .await;
        }

        let record = reg.get(&id).await.unwrap();
        assert_eq!(record.breaker.state, CircuitState::Open);
        assert_eq!(record.breaker.failures, 2);
        assert!(record.breaker.next_attempt_at.is_some());

        let status = reg.breaker_status(&id).await.unwrap();
        assert!(status.is_open);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_users_no_cross_contamination() {
        let reg = Arc::new(registry());

        let mut tasks = Vec::new();
        for i in 0..5 {
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move {
                let user = format!("user-{i}");
                let id = reg
                    .create(
                        CreateExecution::new("worker", format!("thread-{i}"), &user)
                            .with_metadata(serde_json::json!({"owner": user})),
                    )
                    .await
                    .unwrap();

                reg.start(&id).await.unwrap();
                for _ in 0..3 {
                    reg.heartbeat(&id).await.unwrap();
                }
                reg.update_state(
                    &id,
                    ExecutionState::Completed,
                    None,
                    Some(serde_json::json!({"user": user})),
                )
                .await
                .unwrap();
                (id, i)
            }));
        }

        for task in tasks {
            let (id, i) = task.await.unwrap();
            let record = reg.get(&id).await.unwrap();
            let user = format!("user-{i}");
            assert_eq!(record.user_id, user);
            assert_eq!(record.metadata["owner"], user.as_str());
            assert_eq!(record.result, Some(serde_json::json!({"user": user})));
            assert_eq!(record.heartbeat_count, 3);
            assert_eq!(record.state, ExecutionState::Completed);
        }

        let snap = reg.metrics();
        assert_eq!(snap.total, 5);
        assert_eq!(snap.succeeded, 5);
        assert_eq!(snap.active, 0);
    }
}
