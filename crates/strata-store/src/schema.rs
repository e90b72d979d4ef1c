//! Row definitions for the Strata tables
//!
//! Tables (one physical table per rollup level where noted):
//! - aggregate_rollup_N: transaction aggregates per capture time
//! - gauge_value_rollup_N: weighted gauge values per capture time
//! - needs_rollup: pending compaction work per (kind, level, agent rollup, boundary)
//! - agent_rollup: registry of agent rollup ids, parents and last capture time
//! - metric_name: transaction types and gauge names seen per agent rollup
//! - trace_point: slow/error trace points used by point queries
//! - full_query_text: full query text addressed by digest

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Upper bound on configured rollup levels; one table per level and kind.
pub const MAX_ROLLUP_LEVELS: usize = 8;

const AGGREGATE_TABLES: [&str; MAX_ROLLUP_LEVELS] = [
    "aggregate_rollup_0",
    "aggregate_rollup_1",
    "aggregate_rollup_2",
    "aggregate_rollup_3",
    "aggregate_rollup_4",
    "aggregate_rollup_5",
    "aggregate_rollup_6",
    "aggregate_rollup_7",
];

const GAUGE_TABLES: [&str; MAX_ROLLUP_LEVELS] = [
    "gauge_value_rollup_0",
    "gauge_value_rollup_1",
    "gauge_value_rollup_2",
    "gauge_value_rollup_3",
    "gauge_value_rollup_4",
    "gauge_value_rollup_5",
    "gauge_value_rollup_6",
    "gauge_value_rollup_7",
];

/// Table holding aggregate rows for `level`.
pub fn aggregate_table(level: usize) -> StorageResult<&'static str> {
    AGGREGATE_TABLES
        .get(level)
        .copied()
        .ok_or(StorageError::UnknownRollupLevel { level })
}

/// Table holding gauge rows for `level`.
pub fn gauge_table(level: usize) -> StorageResult<&'static str> {
    GAUGE_TABLES
        .get(level)
        .copied()
        .ok_or(StorageError::UnknownRollupLevel { level })
}

/// Family of rolled-up data; partitions the needs-rollup queue and name registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Transaction aggregates; sub-keys are transaction types.
    Aggregate,
    /// Gauge values; sub-keys are gauge names.
    Gauge,
}

impl MetricKind {
    pub const ALL: [MetricKind; 2] = [MetricKind::Aggregate, MetricKind::Gauge];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Aggregate => "aggregate",
            MetricKind::Gauge => "gauge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aggregate" => Some(MetricKind::Aggregate),
            "gauge" => Some(MetricKind::Gauge),
            _ => None,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque id returned by the bounded blob store. Ids grow monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlobId(pub u64);

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob#{}", self.0)
    }
}

/// Serialized duration histogram, kept opaque at this layer.
///
/// Stored as a hex string so rows stay printable in any backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedHistogram(pub Vec<u8>);

impl EncodedHistogram {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for EncodedHistogram {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for EncodedHistogram {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s)
            .map(EncodedHistogram)
            .map_err(serde::de::Error::custom)
    }
}

/// One node of a timer tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerNode {
    pub name: String,
    /// Extended timers continue a timer of the same name on another thread.
    #[serde(default)]
    pub extended: bool,
    pub total_nanos: f64,
    pub count: u64,
    #[serde(default)]
    pub children: Vec<TimerNode>,
}

/// Per-thread resource totals; absent fields were not captured by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadStats {
    pub cpu_nanos: Option<f64>,
    pub blocked_nanos: Option<f64>,
    pub waited_nanos: Option<f64>,
    pub allocated_bytes: Option<f64>,
}

/// Aggregated executions of one normalized query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEntry {
    pub query_type: String,
    pub truncated_text: String,
    /// Digest of the full text when `truncated_text` was cut.
    pub full_text_sha: Option<String>,
    pub total_duration_nanos: f64,
    pub execution_count: u64,
    pub total_rows: Option<u64>,
}

/// Aggregated executions of one outbound service call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCallEntry {
    pub call_type: String,
    pub text: String,
    pub total_duration_nanos: f64,
    pub execution_count: u64,
}

/// Payload of one aggregate row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredAggregate {
    pub total_duration_nanos: f64,
    pub transaction_count: u64,
    pub error_count: u64,
    #[serde(default)]
    pub async_transactions: bool,
    #[serde(default)]
    pub main_thread_root_timers: Vec<TimerNode>,
    #[serde(default)]
    pub aux_thread_root_timers: Vec<TimerNode>,
    #[serde(default)]
    pub async_timers: Vec<TimerNode>,
    pub main_thread_stats: Option<ThreadStats>,
    pub aux_thread_stats: Option<ThreadStats>,
    #[serde(default)]
    pub duration_histogram: EncodedHistogram,
    #[serde(default)]
    pub queries: Vec<QueryEntry>,
    #[serde(default)]
    pub service_calls: Vec<ServiceCallEntry>,
    pub main_thread_profile: Option<BlobId>,
    pub aux_thread_profile: Option<BlobId>,
}

/// Aggregate row keyed by agent rollup, transaction type, optional name and capture time.
///
/// `transaction_name == None` is the overall row for the transaction type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub agent_rollup_id: String,
    pub transaction_type: String,
    pub transaction_name: Option<String>,
    pub capture_time: i64,
    pub aggregate: StoredAggregate,
}

/// Which aggregate rows a read selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameFilter {
    /// Only the overall row for the transaction type.
    Overall,
    /// Only rows for this transaction name.
    Named(String),
    /// Overall and all named rows.
    All,
}

impl NameFilter {
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some(n) => NameFilter::Named(n.to_string()),
            None => NameFilter::Overall,
        }
    }

    pub fn matches(&self, name: Option<&str>) -> bool {
        match self {
            NameFilter::Overall => name.is_none(),
            NameFilter::Named(n) => name == Some(n.as_str()),
            NameFilter::All => true,
        }
    }
}

/// One gauge sample or rolled-up gauge value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeValueRow {
    pub agent_rollup_id: String,
    pub gauge_name: String,
    pub capture_time: i64,
    pub value: f64,
    /// Milliseconds of wall time the value stands for.
    pub weight: i64,
}

/// Physical needs-rollup entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeedsRollupRow {
    pub kind: MetricKind,
    pub level: usize,
    pub agent_rollup_id: String,
    /// Bucket boundary (inclusive end of the bucket).
    pub capture_time: i64,
    pub sub_keys: BTreeSet<String>,
    /// Rotated on every mutation; guards conditional delete/replace.
    pub token: String,
}

/// Registry entry for an agent or an agent rollup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRollupRow {
    pub agent_rollup_id: String,
    pub parent_id: Option<String>,
    pub last_capture_time: i64,
}

/// Point used by slow-trace and error-trace charts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracePointRow {
    pub agent_rollup_id: String,
    /// Agent that captured the trace; part of the trace identity.
    pub agent_id: String,
    pub trace_id: String,
    pub transaction_type: String,
    pub transaction_name: String,
    pub capture_time: i64,
    pub duration_nanos: i64,
    pub partial: bool,
    pub error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_by_level() {
        assert_eq!(aggregate_table(0).unwrap(), "aggregate_rollup_0");
        assert_eq!(gauge_table(3).unwrap(), "gauge_value_rollup_3");
        assert_eq!(
            aggregate_table(MAX_ROLLUP_LEVELS).unwrap_err(),
            StorageError::UnknownRollupLevel {
                level: MAX_ROLLUP_LEVELS
            }
        );
    }

    #[test]
    fn encoded_histogram_serializes_as_hex() {
        let h = EncodedHistogram(vec![0x1c, 0x84, 0x93, 0x14]);
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, "\"1c849314\"");
        let back: EncodedHistogram = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn name_filter_matching() {
        assert!(NameFilter::Overall.matches(None));
        assert!(!NameFilter::Overall.matches(Some("/a")));
        assert!(NameFilter::Named("/a".into()).matches(Some("/a")));
        assert!(!NameFilter::Named("/a".into()).matches(None));
        assert!(NameFilter::All.matches(Some("/b")));
    }

    #[test]
    fn metric_kind_round_trips_through_str() {
        for kind in MetricKind::ALL {
            assert_eq!(MetricKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MetricKind::parse("trace"), None);
    }
}
