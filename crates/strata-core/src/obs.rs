//! Structured observability hooks for rollup and ingest lifecycle events.
//!
//! This module provides:
//! - Agent-rollup-scoped tracing spans via [`rollup_span`]
//! - Emission functions for bucket rollups, retire races and ingest

use strata_store::MetricKind;
use tracing::{info, warn};

/// Span tagging every event of one cascade pass with its agent rollup id.
///
/// Attach with `tracing::Instrument` so the span follows the future across
/// await points.
pub fn rollup_span(agent_rollup_id: &str, kind: MetricKind) -> tracing::Span {
    tracing::info_span!("strata.rollup", agent_rollup_id = %agent_rollup_id, kind = %kind)
}

/// Emit event: one bucket rolled up into `level`.
pub fn emit_bucket_rolled_up(metric_key: &str, level: usize, capture_time: i64, rows: usize) {
    info!(
        event = "rollup.bucket_rolled_up",
        metric_key = %metric_key,
        level,
        capture_time,
        rows,
    );
}

/// Emit event: a bucket rollup failed and stays pending (warning level).
pub fn emit_bucket_failed(
    metric_key: &str,
    level: usize,
    capture_time: i64,
    error: &dyn std::fmt::Display,
) {
    warn!(
        event = "rollup.bucket_failed",
        metric_key = %metric_key,
        level,
        capture_time,
        error = %error,
    );
}

/// Emit event: another writer changed the queue entry first.
pub fn emit_retire_stale(level: usize, capture_time: i64) {
    info!(event = "rollup.retire_stale", level, capture_time);
}

/// Emit event: agent rows stored at level 0.
pub fn emit_ingest_stored(agent_id: &str, capture_time: i64, rows: usize) {
    info!(
        event = "ingest.stored",
        agent_id = %agent_id,
        capture_time,
        rows,
    );
}
