//! Records accepted on the ingest path and shapes returned by queries.

use serde::{Deserialize, Serialize};
use strata_store::{ServiceCallEntry, ThreadStats, TimerNode, TracePointRow};

use crate::histogram::DurationHistogram;
use crate::profile::Profile;

/// Query text longer than this is stored truncated, with the full text
/// addressed by its digest.
pub const QUERY_TEXT_TRUNCATE: usize = 120;

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// One query as reported by an agent, with its full text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingQuery {
    pub query_type: String,
    pub text: String,
    pub total_duration_nanos: f64,
    pub execution_count: u64,
    pub total_rows: Option<u64>,
}

/// Aggregate for one transaction type (and optionally one transaction name)
/// over one agent flush interval.
#[derive(Debug, Clone, Default)]
pub struct IncomingAggregate {
    pub transaction_type: String,
    /// `None` for the overall row of the transaction type.
    pub transaction_name: Option<String>,
    pub total_duration_nanos: f64,
    pub transaction_count: u64,
    pub error_count: u64,
    pub async_transactions: bool,
    pub main_thread_root_timers: Vec<TimerNode>,
    pub aux_thread_root_timers: Vec<TimerNode>,
    pub async_timers: Vec<TimerNode>,
    pub main_thread_stats: Option<ThreadStats>,
    pub aux_thread_stats: Option<ThreadStats>,
    pub duration_histogram: DurationHistogram,
    pub queries: Vec<IncomingQuery>,
    pub service_calls: Vec<ServiceCallEntry>,
    pub main_thread_profile: Option<Profile>,
    pub aux_thread_profile: Option<Profile>,
}

impl IncomingAggregate {
    pub fn overall(transaction_type: impl Into<String>) -> Self {
        Self {
            transaction_type: transaction_type.into(),
            ..Default::default()
        }
    }

    pub fn named(transaction_type: impl Into<String>, transaction_name: impl Into<String>) -> Self {
        Self {
            transaction_type: transaction_type.into(),
            transaction_name: Some(transaction_name.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeValue {
    pub gauge_name: String,
    pub capture_time: i64,
    pub value: f64,
    /// Usually the sampling interval in milliseconds.
    pub weight: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracePoint {
    pub trace_id: String,
    pub transaction_type: String,
    pub transaction_name: String,
    pub capture_time: i64,
    pub duration_nanos: i64,
    /// Captured while the trace was still running.
    pub partial: bool,
    pub error: bool,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Range query over aggregates. The window is `(from, to]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateQuery {
    pub agent_rollup_id: String,
    pub transaction_type: String,
    /// `None` reads the overall rows of the transaction type.
    pub transaction_name: Option<String>,
    pub from: i64,
    pub to: i64,
    pub rollup_level: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub total_duration_nanos: f64,
    pub transaction_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverviewPoint {
    pub capture_time: i64,
    pub total_duration_nanos: f64,
    pub transaction_count: u64,
    pub async_transactions: bool,
    pub main_thread_root_timers: Vec<TimerNode>,
    pub aux_thread_root_timers: Vec<TimerNode>,
    pub async_timers: Vec<TimerNode>,
    pub main_thread_stats: Option<ThreadStats>,
    pub aux_thread_stats: Option<ThreadStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_nanos: u64,
}

/// Percentiles of the merged duration histogram over the whole range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentileSummary {
    pub transaction_count: u64,
    pub values: Vec<PercentileValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputPoint {
    pub capture_time: i64,
    pub transaction_count: u64,
    pub error_count: u64,
}

/// Which thread's profiles to merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileThread {
    Main,
    Aux,
    Both,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TracePointPage {
    pub points: Vec<TracePointRow>,
    /// More points matched than the requested limit.
    pub truncated: bool,
}
