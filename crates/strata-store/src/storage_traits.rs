//! Storage trait definitions for Strata
//!
//! These traits define the contracts the rollup engine needs from its
//! backends:
//! - `AggregateStore` / `GaugeStore`: per-level row tables (write overwrites)
//! - `NeedsRollupStore`: durable work queue with conditional retire
//! - `AgentRollupStore`: agent rollup registry and metric-name registry
//! - `TracePointStore`: trace points for point queries
//! - `QueryTextStore`: full query text by digest
//! - `BlobStore`: bounded append-only blob store
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::{
    AgentRollupRow, AggregateRow, BlobId, GaugeValueRow, MetricKind, NameFilter, NeedsRollupRow,
    TracePointRow,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Row tables
// ---------------------------------------------------------------------------

/// Aggregate rows, one table per rollup level.
///
/// Guarantees:
/// - Writing a row with an existing key overwrites it (rollups are idempotent).
/// - Reads select capture times in `(from, to]`, ordered by capture time.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Write a bounded batch of rows at `level`.
    async fn write_aggregates(&self, level: usize, rows: Vec<AggregateRow>) -> StorageResult<()>;

    /// Read rows for one agent rollup and transaction type.
    async fn read_aggregates(
        &self,
        level: usize,
        agent_rollup_id: &str,
        transaction_type: &str,
        names: &NameFilter,
        from: i64,
        to: i64,
    ) -> StorageResult<Vec<AggregateRow>>;
}

/// Gauge value rows, one table per rollup level. Same guarantees as [`AggregateStore`].
#[async_trait]
pub trait GaugeStore: Send + Sync {
    async fn write_gauge_values(&self, level: usize, rows: Vec<GaugeValueRow>)
        -> StorageResult<()>;

    async fn read_gauge_values(
        &self,
        level: usize,
        agent_rollup_id: &str,
        gauge_name: &str,
        from: i64,
        to: i64,
    ) -> StorageResult<Vec<GaugeValueRow>>;
}

// ---------------------------------------------------------------------------
// NeedsRollupStore: durable compaction work queue
// ---------------------------------------------------------------------------

/// Needs-rollup entries keyed by `(kind, level, agent_rollup_id, capture_time)`.
///
/// Guarantees:
/// - `upsert` unions `sub_keys` into any existing entry and installs `token`.
/// - `delete_if` / `replace_if` only apply when the stored token equals the
///   expected one, and report whether they applied.
#[async_trait]
pub trait NeedsRollupStore: Send + Sync {
    async fn upsert_needs_rollup(
        &self,
        kind: MetricKind,
        level: usize,
        agent_rollup_id: &str,
        capture_time: i64,
        sub_keys: BTreeSet<String>,
        token: String,
    ) -> StorageResult<()>;

    /// Entries with `after < capture_time <= up_to`, oldest first, at most `limit`.
    async fn read_needs_rollup(
        &self,
        kind: MetricKind,
        level: usize,
        agent_rollup_id: &str,
        after: i64,
        up_to: i64,
        limit: usize,
    ) -> StorageResult<Vec<NeedsRollupRow>>;

    async fn delete_needs_rollup_if(
        &self,
        kind: MetricKind,
        level: usize,
        agent_rollup_id: &str,
        capture_time: i64,
        expected_token: &str,
    ) -> StorageResult<bool>;

    #[allow(clippy::too_many_arguments)]
    async fn replace_needs_rollup_if(
        &self,
        kind: MetricKind,
        level: usize,
        agent_rollup_id: &str,
        capture_time: i64,
        expected_token: &str,
        remaining: BTreeSet<String>,
        new_token: String,
    ) -> StorageResult<bool>;

    /// Number of pending entries for one partition and level.
    async fn count_needs_rollup(
        &self,
        kind: MetricKind,
        level: usize,
        agent_rollup_id: &str,
    ) -> StorageResult<usize>;
}

// ---------------------------------------------------------------------------
// AgentRollupStore: registry
// ---------------------------------------------------------------------------

/// Agent rollup registry.
///
/// Semantics:
/// - `touch` creates the entry or raises `last_capture_time` (never lowers it).
/// - `children` lists direct children; `roots` lists entries without a parent.
#[async_trait]
pub trait AgentRollupStore: Send + Sync {
    async fn touch_agent_rollup(
        &self,
        agent_rollup_id: &str,
        parent_id: Option<&str>,
        capture_time: i64,
    ) -> StorageResult<()>;

    async fn get_agent_rollup(&self, agent_rollup_id: &str)
        -> StorageResult<Option<AgentRollupRow>>;

    async fn children(&self, parent_id: &str) -> StorageResult<Vec<String>>;

    async fn roots(&self) -> StorageResult<Vec<String>>;

    async fn record_metric_name(
        &self,
        kind: MetricKind,
        agent_rollup_id: &str,
        name: &str,
    ) -> StorageResult<()>;

    /// Names in ascending order.
    async fn metric_names(
        &self,
        kind: MetricKind,
        agent_rollup_id: &str,
    ) -> StorageResult<Vec<String>>;
}

// ---------------------------------------------------------------------------
// TracePointStore
// ---------------------------------------------------------------------------

/// Trace points. Several rows may share a trace identity (partial then complete).
#[async_trait]
pub trait TracePointStore: Send + Sync {
    async fn write_trace_point(&self, row: TracePointRow) -> StorageResult<()>;

    /// Points with capture time in `(from, to]`; `transaction_name == None` selects all names.
    async fn read_trace_points(
        &self,
        agent_rollup_id: &str,
        transaction_type: &str,
        transaction_name: Option<&str>,
        from: i64,
        to: i64,
    ) -> StorageResult<Vec<TracePointRow>>;

    /// Remove partial points of a trace captured before `before`.
    async fn delete_partial_trace_points(
        &self,
        agent_rollup_id: &str,
        agent_id: &str,
        trace_id: &str,
        before: i64,
    ) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// QueryTextStore
// ---------------------------------------------------------------------------

/// Full query text addressed by its digest.
#[async_trait]
pub trait QueryTextStore: Send + Sync {
    async fn write_full_query_text(&self, sha: &str, text: &str) -> StorageResult<()>;

    async fn read_full_query_text(&self, sha: &str) -> StorageResult<Option<String>>;
}

/// Everything the engine needs from the column store.
pub trait RollupStore:
    AggregateStore + GaugeStore + NeedsRollupStore + AgentRollupStore + TracePointStore + QueryTextStore
{
}

impl<T> RollupStore for T where
    T: AggregateStore
        + GaugeStore
        + NeedsRollupStore
        + AgentRollupStore
        + TracePointStore
        + QueryTextStore
{
}

// ---------------------------------------------------------------------------
// BlobStore: bounded append-only payload storage
// ---------------------------------------------------------------------------

/// Bounded, append-only blob store.
///
/// Guarantees:
/// - `write` returns a fresh id, strictly greater than every earlier id.
/// - `read` returns the original bytes, or `None` once the blob was evicted.
/// - When full, the oldest blobs are evicted silently.
/// - Ids below `smallest_non_expired_id` are known to be evicted.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn write(&self, bytes: &[u8]) -> StorageResult<BlobId>;

    /// Write a delimited sequence of messages as one blob.
    async fn write_many(&self, messages: &[Vec<u8>]) -> StorageResult<BlobId>;

    async fn read(&self, id: BlobId) -> StorageResult<Option<Vec<u8>>>;

    /// Read a blob written with `write_many`, split back into its messages.
    async fn read_many(&self, id: BlobId) -> StorageResult<Option<Vec<Vec<u8>>>>;

    async fn smallest_non_expired_id(&self) -> StorageResult<BlobId>;
}
