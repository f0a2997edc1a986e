//! Phase state machine: fine-grained progress tracking within a record
//!
//! Transitions are permissive by design. Agent control flow is not fully
//! predictable, so out-of-order transitions are accepted and logged, never
//! rejected. Each transition closes the previous phase's span and opens a
//! new one in the append-only history.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::notify::EventKind;
use crate::record::{ExecutionPhase, ExecutionRecord, PhaseSpan};

/// Nominal progression order, used only to flag out-of-order transitions in
/// the log. Skipping ahead or jumping back is always allowed.
fn nominal_order(phase: ExecutionPhase) -> u8 {
    match phase {
        ExecutionPhase::Created => 0,
        ExecutionPhase::Setup => 1,
        ExecutionPhase::ContextValidation => 2,
        ExecutionPhase::Starting => 3,
        ExecutionPhase::Thinking => 4,
        ExecutionPhase::ToolPreparation => 5,
        ExecutionPhase::ToolExecution => 6,
        ExecutionPhase::LlmInteraction => 7,
        ExecutionPhase::ResultProcessing => 8,
        ExecutionPhase::Completing => 9,
        ExecutionPhase::Completed => 10,
        // Failure can happen at any point.
        ExecutionPhase::Failed => 10,
    }
}

/// Apply a phase transition to a record
///
/// Closes the previous span's duration, appends a history entry, updates
/// `current_phase` and `updated_at`, and returns the externally meaningful
/// event mapped to the new phase, if any.
pub fn apply_phase(
    record: &mut ExecutionRecord,
    new_phase: ExecutionPhase,
    metadata: serde_json::Value,
    now: DateTime<Utc>,
) -> Option<EventKind> {
    let previous = record.current_phase;
    if nominal_order(new_phase) < nominal_order(previous) {
        debug!(
            execution_id = %record.execution_id,
            from = %previous,
            to = %new_phase,
            "Out-of-order phase transition accepted"
        );
    }

    if let Some(span) = record.phase_history.last_mut() {
        if span.exited_at.is_none() {
            span.exited_at = Some(now);
        }
    }

    record.phase_history.push(PhaseSpan {
        phase: new_phase,
        entered_at: now,
        exited_at: None,
        metadata,
    });
    record.current_phase = new_phase;
    record.updated_at = now;

    EventKind::for_phase(new_phase)
}

/// Total time spent in a phase, in milliseconds
///
/// A phase that was never entered reads as `None` ("not entered"), never as
/// zero, so callers can distinguish skipped phases from instant ones. An
/// open span is measured up to `now`.
pub fn phase_duration_ms(
    record: &ExecutionRecord,
    phase: ExecutionPhase,
    now: DateTime<Utc>,
) -> Option<i64> {
    let mut total: Option<i64> = None;
    for span in &record.phase_history {
        if span.phase != phase {
            continue;
        }
        let end = span.exited_at.unwrap_or(now);
        let ms = (end - span.entered_at).num_milliseconds().max(0);
        total = Some(total.unwrap_or(0) + ms);
    }
    total
}

/// Total execution duration in milliseconds, from creation to completion
/// (or to `now` while still running)
pub fn total_duration_ms(record: &ExecutionRecord, now: DateTime<Utc>) -> i64 {
    let end = record.completed_at.unwrap_or(now);
    (end - record.started_at).num_milliseconds().max(0)
}
