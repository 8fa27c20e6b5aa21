//! Structured observability hooks for orchestrator runs.
//!
//! - A run-scoped tracing span via [`run_span`]
//! - Emission functions for run, phase and node lifecycle events
//!
//! Events are emitted at `info!` level, failures at `warn!`.

use tracing::{info, warn, Span};

use crate::graph::NodeStatus;

/// Span tagging every event of one run with its `run_id`.
///
/// Attach it to the run future with [`tracing::Instrument::instrument`] so
/// the span follows the future across await points:
///
/// ```ignore
/// run_future.instrument(run_span("run-12345")).await
/// ```
pub fn run_span(run_id: &str) -> Span {
    tracing::info_span!("repomesh.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, max_concurrency: usize) {
    info!(event = "run.started", run_id = %run_id, max_concurrency = max_concurrency);
}

pub fn emit_phase_completed(phase: &str, elapsed_ms: u64) {
    info!(event = "phase.completed", phase = %phase, elapsed_ms = elapsed_ms);
}

/// Emit event: a node reached a final status in this run.
pub fn emit_node_finished(node_id: &str, status: NodeStatus, attempts: u32, duration_ms: u64) {
    if status == NodeStatus::Completed {
        info!(
            event = "node.finished",
            node_id = %node_id,
            status = %status,
            attempts = attempts,
            duration_ms = duration_ms,
        );
    } else {
        warn!(
            event = "node.finished",
            node_id = %node_id,
            status = %status,
            attempts = attempts,
            duration_ms = duration_ms,
        );
    }
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, failed: usize, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        failed = failed,
        success = success,
    );
}

/// Emit event: a run-fatal error aborted the pipeline.
pub fn emit_run_aborted(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.aborted", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_scopes_events() {
        let span = run_span("test-run-id");
        span.in_scope(|| emit_node_finished("n1", NodeStatus::Failed, 2, 10));
    }
}
