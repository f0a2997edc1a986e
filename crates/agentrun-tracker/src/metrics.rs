use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use serde::{Deserialize, Serialize};

use crate::record::ExecutionState;

/// Prometheus-side execution metrics
///
/// Updated by the registry on every lifecycle transition; scraped through
/// `registry()`. Label cardinality is kept at zero on purpose.
#[derive(Clone)]
pub struct TrackerMetrics {
    executions_started: IntCounter,
    active_executions: IntGauge,
    executions_succeeded: IntCounter,
    executions_failed: IntCounter,
    executions_timed_out: IntCounter,
    executions_dead: IntCounter,
    executions_cancelled: IntCounter,
    heartbeats: IntCounter,
    breaker_trips: IntCounter,
    execution_duration: Histogram,
    registry: Registry,
}

impl TrackerMetrics {
    /// Create new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let executions_started = IntCounter::new(
            "agentrun_executions_started_total",
            "Total number of executions created",
        )?;
        registry.register(Box::new(executions_started.clone()))?;

        let active_executions = IntGauge::new(
            "agentrun_active_executions",
            "Number of executions not yet in a terminal state",
        )?;
        registry.register(Box::new(active_executions.clone()))?;

        let executions_succeeded = IntCounter::new(
            "agentrun_executions_succeeded_total",
            "Total number of executions that completed successfully",
        )?;
        registry.register(Box::new(executions_succeeded.clone()))?;

        let executions_failed = IntCounter::new(
            "agentrun_executions_failed_total",
            "Total number of executions that failed",
        )?;
        registry.register(Box::new(executions_failed.clone()))?;

        let executions_timed_out = IntCounter::new(
            "agentrun_executions_timed_out_total",
            "Total number of executions that exceeded their wall-clock timeout",
        )?;
        registry.register(Box::new(executions_timed_out.clone()))?;

        let executions_dead = IntCounter::new(
            "agentrun_executions_dead_total",
            "Total number of executions whose workers stopped heartbeating",
        )?;
        registry.register(Box::new(executions_dead.clone()))?;

        let executions_cancelled = IntCounter::new(
            "agentrun_executions_cancelled_total",
            "Total number of cancelled executions",
        )?;
        registry.register(Box::new(executions_cancelled.clone()))?;

        let heartbeats = IntCounter::new(
            "agentrun_heartbeats_total",
            "Total number of heartbeats received",
        )?;
        registry.register(Box::new(heartbeats.clone()))?;

        let breaker_trips = IntCounter::new(
            "agentrun_breaker_trips_total",
            "Total number of circuit breaker open transitions",
        )?;
        registry.register(Box::new(breaker_trips.clone()))?;

        let execution_duration = Histogram::with_opts(
            HistogramOpts::new(
                "agentrun_execution_duration_seconds",
                "Execution duration from creation to terminal state",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )?;
        registry.register(Box::new(execution_duration.clone()))?;

        Ok(Self {
            executions_started,
            active_executions,
            executions_succeeded,
            executions_failed,
            executions_timed_out,
            executions_dead,
            executions_cancelled,
            heartbeats,
            breaker_trips,
            execution_duration,
            registry,
        })
    }

    pub fn execution_started(&self) {
        self.executions_started.inc();
        self.active_executions.inc();
    }

    pub fn heartbeat(&self) {
        self.heartbeats.inc();
    }

    pub fn breaker_opened(&self) {
        self.breaker_trips.inc();
    }

    pub fn execution_finished(&self, state: ExecutionState, duration_ms: i64) {
        match state {
            ExecutionState::Completed => self.executions_succeeded.inc(),
            ExecutionState::Failed => self.executions_failed.inc(),
            ExecutionState::TimedOut => self.executions_timed_out.inc(),
            ExecutionState::Dead => self.executions_dead.inc(),
            ExecutionState::Cancelled => self.executions_cancelled.inc(),
            // Non-terminal transitions do not finish an execution.
            _ => return,
        }
        self.active_executions.dec();
        self.execution_duration.observe(duration_ms as f64 / 1000.0);
    }

    /// Registry for scraping
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for TrackerMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}

/// On-demand counter snapshot derived from the execution registry
///
/// Rates are computed over finished executions; `failure_rate` counts
/// failed, timed-out and dead runs. Cancellations count toward neither
/// rate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub active: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub dead: u64,
    pub cancelled: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
}

impl MetricsSnapshot {
    pub(crate) fn from_counts(
        total: u64,
        succeeded: u64,
        failed: u64,
        timed_out: u64,
        dead: u64,
        cancelled: u64,
    ) -> Self {
        let finished = succeeded + failed + timed_out + dead + cancelled;
        let denominator = finished.max(1) as f64;
        Self {
            total,
            active: total - finished,
            succeeded,
            failed,
            timed_out,
            dead,
            cancelled,
            success_rate: if finished == 0 {
                0.0
            } else {
                succeeded as f64 / denominator
            },
            failure_rate: if finished == 0 {
                0.0
            } else {
                (failed + timed_out + dead) as f64 / denominator
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_rates() {
        let snap = MetricsSnapshot::from_counts(10, 6, 1, 1, 0, 0);
        assert_eq!(snap.active, 2);
        assert!((snap.success_rate - 0.75).abs() < f64::EPSILON);
        assert!((snap.failure_rate - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_no_finished_runs() {
        let snap = MetricsSnapshot::from_counts(3, 0, 0, 0, 0, 0);
        assert_eq!(snap.active, 3);
        assert_eq!(snap.success_rate, 0.0);
        assert_eq!(snap.failure_rate, 0.0);
    }

    #[test]
    fn test_prometheus_counters_update() {
        let metrics = TrackerMetrics::new().unwrap();
        metrics.execution_started();
        metrics.execution_started();
        metrics.execution_finished(ExecutionState::Completed, 1500);
        metrics.execution_finished(ExecutionState::Dead, 45_000);

        let families = metrics.registry().gather();
        let started = families
            .iter()
            .find(|f| f.get_name() == "agentrun_executions_started_total")
            .unwrap();
        assert_eq!(started.get_metric()[0].get_counter().get_value(), 2.0);

        let active = families
            .iter()
            .find(|f| f.get_name() == "agentrun_active_executions")
            .unwrap();
        assert_eq!(active.get_metric()[0].get_gauge().get_value(), 0.0);
    }

    #[test]
    fn test_non_terminal_finish_ignored() {
        let metrics = TrackerMetrics::new().unwrap();
        metrics.execution_started();
        metrics.execution_finished(ExecutionState::Running, 100);

        let families = metrics.registry().gather();
        let active = families
            .iter()
            .find(|f| f.get_name() == "agentrun_active_executions")
            .unwrap();
        assert_eq!(active.get_metric()[0].get_gauge().get_value(), 1.0);
    }
}
