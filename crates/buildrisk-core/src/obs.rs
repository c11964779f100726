//! Structured observability hooks for scenario pipeline-run lifecycle events.
//!
//! This module provides:
//! - Run-scoped tracing spans via `RunSpan` RAII guard
//! - Emission functions for key lifecycle events: phase transitions, node
//!   execution, scan dispatch
//!
//! Events are emitted at `info!` level. For JSON output, set
//! `BUILDRISK_LOG_FORMAT=json`.

use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber for a binary entry point.
///
/// * `json` — when `true`, emit newline-delimited JSON log lines.
/// * `level` — default verbosity when `RUST_LOG` is not set.
///
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

/// RAII guard that enters a run-scoped tracing span for the duration of a
/// scenario's pipeline run, tagged with its correlation id.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(correlation_id: &str) -> Self {
        let span = tracing::info_span!("buildrisk.run", correlation_id = %correlation_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: a scenario's pipeline run started.
pub fn emit_run_started(correlation_id: &str, scenario_id: &str) {
    info!(event = "run.started", correlation_id = %correlation_id, scenario_id = %scenario_id);
}

/// Emit event: a pipeline run finished with duration and outcome.
pub fn emit_run_finished(correlation_id: &str, duration_ms: u64, success: bool) {
    info!(
        event = "run.finished",
        correlation_id = %correlation_id,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: one phase (filter/ingest/process/split) transitioned.
pub fn emit_phase_transitioned(correlation_id: &str, phase: &str, status: &str, item_count: u64) {
    info!(
        event = "phase.transitioned",
        correlation_id = %correlation_id,
        phase = %phase,
        status = %status,
        item_count = item_count,
    );
}

/// Emit event: one Feature DAG node executed for one build.
pub fn emit_node_executed(correlation_id: &str, node_name: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "node.executed",
        correlation_id = %correlation_id,
        node_name = %node_name,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

/// Emit event: a scan was dispatched for a commit.
pub fn emit_scan_dispatched(correlation_id: &str, tool: &str, commit_sha: &str) {
    info!(
        event = "scan.dispatched",
        correlation_id = %correlation_id,
        tool = %tool,
        commit_sha = %commit_sha,
    );
}

/// Emit event: a run-finalization error (warning level).
pub fn emit_run_finalize_error(correlation_id: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "run.finalize_error", correlation_id = %correlation_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_span_enter_does_not_panic() {
        let _span = RunSpan::enter("11111111-1111-1111-1111-111111111111");
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
    }
}
