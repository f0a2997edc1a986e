//! Background liveness monitor
//!
//! One loop per registry instance with an explicit start/stop lifecycle:
//! `start` spawns the loop, `stop` signals shutdown and joins the task
//! before returning, so nothing leaks past shutdown. Each tick runs the
//! dead/timeout detection scan, transitions flagged records, fires the
//! registered callbacks best-effort, then sweeps expired terminal records.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::record::{ExecutionRecord, ExecutionState};
use crate::registry::{ExecutionRegistry, LivenessReport, LivenessVerdict};

/// Callback invoked for each dead or timed-out record
///
/// Failures are logged per-callback and never abort the monitor loop.
pub type LivenessCallback = Arc<dyn Fn(&ExecutionRecord) -> anyhow::Result<()> + Send + Sync>;

/// Monitor loop configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between detection sweeps
    pub tick_interval: Duration,

    /// How long terminal records are retained before cleanup
    pub retention: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(2),
            retention: Duration::from_secs(3600),
        }
    }
}

impl MonitorConfig {
    /// Load config from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(ms) = std::env::var("AGENTRUN_MONITOR_TICK_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                config.tick_interval = Duration::from_millis(ms);
            }
        }
        if let Ok(secs) = std::env::var("AGENTRUN_RETENTION_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                config.retention = Duration::from_secs(secs);
            }
        }
        config
    }
}

/// Periodic scanner that transitions dead and timed-out executions
pub struct LivenessMonitor {
    registry: Arc<ExecutionRegistry>,
    config: MonitorConfig,
    death_callbacks: Arc<RwLock<Vec<LivenessCallback>>>,
    timeout_callbacks: Arc<RwLock<Vec<LivenessCallback>>>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<ExecutionRegistry>, config: MonitorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry,
            config,
            death_callbacks: Arc::new(RwLock::new(Vec::new())),
            timeout_callbacks: Arc::new(RwLock::new(Vec::new())),
            shutdown,
            handle: Mutex::new(None),
        }
    }

    /// Register a callback for executions found dead
    pub async fn on_death(&self, callback: LivenessCallback) {
        self.death_callbacks.write().await.push(callback);
    }

    /// Register a callback for executions found timed out
    pub async fn on_timeout(&self, callback: LivenessCallback) {
        self.timeout_callbacks.write().await.push(callback);
    }

    /// Start the monitor loop; a no-op if already running
    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }

        let registry = self.registry.clone();
        let config = self.config.clone();
        let death_callbacks = self.death_callbacks.clone();
        let timeout_callbacks = self.timeout_callbacks.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        info!(
            tick_ms = config.tick_interval.as_millis() as u64,
            "Starting liveness monitor"
        );

        *handle = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.tick_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!("Liveness monitor shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        run_sweep(&registry, &config, &death_callbacks, &timeout_callbacks).await;
                    }
                }
            }
        }));
    }

    /// Stop the monitor and join its task
    ///
    /// Mutates no execution records; returns once the loop has exited, so
    /// the background task never outlives this call.
    pub async fn stop(&self) {
        let task = self.handle.lock().await.take();
        if let Some(task) = task {
            let _ = self.shutdown.send(true);
            if task.await.is_err() {
                warn!("Liveness monitor task panicked before shutdown");
            }
            info!("Liveness monitor stopped");
        }
    }

    /// Check whether the loop is currently running
    pub async fn is_running(&self) -> bool {
        self.handle.lock().await.is_some()
    }
}

async fn run_sweep(
    registry: &ExecutionRegistry,
    config: &MonitorConfig,
    death_callbacks: &RwLock<Vec<LivenessCallback>>,
    timeout_callbacks: &RwLock<Vec<LivenessCallback>>,
) {
    let reports = registry.detect_dead_or_timed_out().await;

    for report in reports {
        handle_report(registry, report, death_callbacks, timeout_callbacks).await;
    }

    registry.cleanup(config.retention).await;
}

/// Transition one flagged record and fire the matching callbacks
///
/// The record is re-read after the transition: if the owning caller
/// finished it first, the record is no longer in the monitor's target state
/// and its outcome wins end-to-end, so no callbacks fire.
async fn handle_report(
    registry: &ExecutionRegistry,
    report: LivenessReport,
    death_callbacks: &RwLock<Vec<LivenessCallback>>,
    timeout_callbacks: &RwLock<Vec<LivenessCallback>>,
) {
    let id = report.record.execution_id.clone();
    match report.verdict {
        LivenessVerdict::Dead {
            heartbeat_gap,
            also_timed_out,
        } => {
            let error = format!(
                "worker presumed dead: no heartbeat for {:.1}s (threshold {:.1}s)",
                heartbeat_gap.as_secs_f64(),
                registry.policy().heartbeat_timeout.as_secs_f64(),
            );
            transition(registry, &id, ExecutionState::Dead, error).await;

            let record = match registry.get(&id).await {
                Ok(record) if record.state == ExecutionState::Dead => record,
                _ => return,
            };
            fire_callbacks(death_callbacks, &record, "death").await;
            if also_timed_out {
                fire_callbacks(timeout_callbacks, &record, "timeout").await;
            }
        }
        LivenessVerdict::TimedOut { elapsed } => {
            let error = format!(
                "execution timed out after {:.1}s (budget {:.1}s)",
                elapsed.as_secs_f64(),
                report.record.timeout.as_secs_f64(),
            );
            transition(registry, &id, ExecutionState::TimedOut, error).await;

            if let Ok(record) = registry.get(&id).await {
                if record.state == ExecutionState::TimedOut {
                    fire_callbacks(timeout_callbacks, &record, "timeout").await;
                }
            }
        }
    }
}

async fn transition(
    registry: &ExecutionRegistry,
    execution_id: &str,
    state: ExecutionState,
    error: String,
) {
    match registry
        .update_state(execution_id, state, Some(error), None)
        .await
    {
        Ok(_) => {
            warn!(execution_id = %execution_id, state = %state, "Monitor transitioned execution");
        }
        // The owning caller finished the record between detection and
        // transition; their outcome wins.
        Err(err) if err.is_expected_race() => {
            debug!(execution_id = %execution_id, error = %err, "Monitor transition lost race");
        }
        Err(err) => {
            warn!(execution_id = %execution_id, error = %err, "Monitor transition failed");
        }
    }
}

async fn fire_callbacks(
    callbacks: &RwLock<Vec<LivenessCallback>>,
    record: &ExecutionRecord,
    kind: &str,
) {
    let callbacks = callbacks.read().await.clone();
    for callback in callbacks {
        if let Err(err) = callback(record) {
            warn!(
                execution_id = %record.execution_id,
                kind = kind,
                error = %err,
                "Liveness callback failed"
            );
        }
    }
}
