//! Structured observability hooks for cell run lifecycle events.
//!
//! - Cell-scoped tracing spans via [`cell_span`]
//! - Emission functions for start, stage completion, finish, gate and publish
//!
//! Everything is emitted at `info!` (warnings at `warn!`) with an `event`
//! field so JSON log consumers can filter on it. Callers pass only
//! redacted text into these functions.

use tracing::{info, warn};

/// Span carrying the cell id for everything logged while a cell runs.
///
/// Attach it to the cell's future with `tracing::Instrument` so it stays
/// correct across `.await` points on a multi-threaded runtime:
///
/// ```ignore
/// pipeline.run(..).instrument(cell_span("amd64-3.7")).await
/// ```
pub fn cell_span(cell_id: &str) -> tracing::Span {
    tracing::info_span!("cellci.cell", cell = %cell_id)
}

/// Emit event: cell run started.
pub fn emit_cell_started(run_id: &str, label: &str) {
    info!(event = "cell.started", run_id = %run_id, label = %label);
}

/// Emit event: cell run finished.
pub fn emit_cell_finished(run_id: &str, duration_ms: u64, total_events: u64, success: bool) {
    info!(
        event = "cell.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        total_events = total_events,
        success = success,
    );
}

/// Emit event: a single event appended to the run.
pub fn emit_event_appended(run_id: &str, event_kind: &str, seq: u64) {
    tracing::debug!(event = "cell.event_appended", run_id = %run_id, kind = %event_kind, seq = seq);
}

/// Emit event: a stage finished with the given exit code.
pub fn emit_stage_finished(stage: &str, exit_code: i32, duration_ms: u64, passed: bool) {
    if passed {
        info!(
            event = "stage.finished",
            stage = %stage,
            exit_code = exit_code,
            duration_ms = duration_ms,
            passed = passed,
        );
    } else {
        warn!(
            event = "stage.finished",
            stage = %stage,
            exit_code = exit_code,
            duration_ms = duration_ms,
            passed = passed,
        );
    }
}

/// Emit event: publish gate evaluated.
pub fn emit_gate_evaluated(branch: &str, passed: bool, violations: usize) {
    info!(
        event = "gate.evaluated",
        branch = %branch,
        passed = passed,
        violations = violations,
    );
}

/// Emit event: one artifact's publish outcome (`uploaded`, `already_exists`, `failed`).
pub fn emit_publish_outcome(filename: &str, outcome: &str) {
    info!(event = "publish.outcome", filename = %filename, outcome = %outcome);
}

/// Emit event: coverage upload failed (non-fatal).
pub fn emit_coverage_upload_failed(error: &dyn std::fmt::Display) {
    warn!(event = "coverage.upload_failed", error = %error);
}

/// Emit event: run finalization error.
pub fn emit_run_finalize_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "cell.finalize_error", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitters_do_not_panic_without_subscriber() {
        emit_cell_started("run-1", "weather@amd64-py3.7");
        emit_event_appended("run-1", "stage_started", 1);
        emit_stage_finished("pytest", 1, 10, false);
        emit_gate_evaluated("master", true, 0);
        emit_publish_outcome("weather-1.0.tar.gz", "already_exists");
        emit_coverage_upload_failed(&"connection refused");
        emit_cell_finished("run-1", 10, 2, true);
    }

    #[test]
    fn test_cell_span_create() {
        let span = cell_span("arm64-3.6");
        let _guard = span.enter();
    }
}
