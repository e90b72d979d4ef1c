//! In-memory fakes for the column-store traits
//!
//! `MemoryRollupStore` satisfies every trait bundled in `RollupStore`
//! without external dependencies. `FaultPlan` lets tests make the next
//! N aggregate/gauge reads or writes fail with a transient error.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StorageError;
use crate::schema::*;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// FaultPlan
// ---------------------------------------------------------------------------

/// Countdown of injected transient failures.
#[derive(Debug, Default)]
pub struct FaultPlan {
    failing_reads: AtomicUsize,
    failing_writes: AtomicUsize,
}

impl FaultPlan {
    /// Fail the next `n` row reads (aggregates and gauges).
    pub fn fail_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` row writes (aggregates and gauges).
    pub fn fail_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check(counter: &AtomicUsize, operation: &str) -> StorageResult<()> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(StorageError::Backend(format!(
                "injected failure during {operation}"
            )));
        }
        Ok(())
    }

    fn check_read(&self, operation: &str) -> StorageResult<()> {
        Self::check(&self.failing_reads, operation)
    }

    fn check_write(&self, operation: &str) -> StorageResult<()> {
        Self::check(&self.failing_writes, operation)
    }
}

// ---------------------------------------------------------------------------
// MemoryRollupStore
// ---------------------------------------------------------------------------

type AggregateKey = (String, String, String, i64);
type GaugeKey = (String, String, i64);
type QueueKey = (MetricKind, usize, String, i64);

#[derive(Debug, Default)]
struct Tables {
    aggregates: HashMap<usize, BTreeMap<AggregateKey, AggregateRow>>,
    gauges: HashMap<usize, BTreeMap<GaugeKey, GaugeValueRow>>,
    needs_rollup: BTreeMap<QueueKey, NeedsRollupRow>,
    agent_rollups: BTreeMap<String, AgentRollupRow>,
    metric_names: BTreeMap<(MetricKind, String), BTreeSet<String>>,
    trace_points: Vec<TracePointRow>,
    full_query_texts: HashMap<String, String>,
}

/// In-memory column store backed by ordered maps.
#[derive(Debug, Default)]
pub struct MemoryRollupStore {
    tables: Mutex<Tables>,
    faults: FaultPlan,
}

impl MemoryRollupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failure injection for tests.
    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Total rows stored for a kind and level, across all agent rollups.
    pub fn row_count(&self, kind: MetricKind, level: usize) -> usize {
        let tables = self.tables.lock();
        match kind {
            MetricKind::Aggregate => tables.aggregates.get(&level).map_or(0, |t| t.len()),
            MetricKind::Gauge => tables.gauges.get(&level).map_or(0, |t| t.len()),
        }
    }

    /// Total pending needs-rollup entries across all partitions.
    pub fn needs_rollup_len(&self) -> usize {
        self.tables.lock().needs_rollup.len()
    }
}

fn ensure_level_table(level: usize) -> StorageResult<()> {
    aggregate_table(level).map(|_| ())
}

#[async_trait]
impl AggregateStore for MemoryRollupStore {
    async fn write_aggregates(&self, level: usize, rows: Vec<AggregateRow>) -> StorageResult<()> {
        ensure_level_table(level)?;
        self.faults.check_write("write_aggregates")?;
        let mut tables = self.tables.lock();
        let table = tables.aggregates.entry(level).or_default();
        for row in rows {
            let key = (
                row.agent_rollup_id.clone(),
                row.transaction_type.clone(),
                row.transaction_name.clone().unwrap_or_default(),
                row.capture_time,
            );
            table.insert(key, row);
        }
        Ok(())
    }

    async fn read_aggregates(
        &self,
        level: usize,
        agent_rollup_id: &str,
        transaction_type: &str,
        names: &NameFilter,
        from: i64,
        to: i64,
    ) -> StorageResult<Vec<AggregateRow>> {
        ensure_level_table(level)?;
        self.faults.check_read("read_aggregates")?;
        let tables = self.tables.lock();
        let mut rows: Vec<AggregateRow> = tables
            .aggregates
            .get(&level)
            .map(|t| {
                t.values()
                    .filter(|r| {
                        r.agent_rollup_id == agent_rollup_id
                            && r.transaction_type == transaction_type
                            && r.capture_time > from
                            && r.capture_time <= to
                            && names.matches(r.transaction_name.as_deref())
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|r| r.capture_time);
        Ok(rows)
    }
}

#[async_trait]
impl GaugeStore for MemoryRollupStore {
    async fn write_gauge_values(
        &self,
        level: usize,
        rows: Vec<GaugeValueRow>,
    ) -> StorageResult<()> {
        gauge_table(level)?;
        self.faults.check_write("write_gauge_values")?;
        let mut tables = self.tables.lock();
        let table = tables.gauges.entry(level).or_default();
        for row in rows {
            let key = (
                row.agent_rollup_id.clone(),
                row.gauge_name.clone(),
                row.capture_time,
            );
            table.insert(key, row);
        }
        Ok(())
    }

    async fn read_gauge_values(
        &self,
        level: usize,
        agent_rollup_id: &str,
        gauge_name: &str,
        from: i64,
        to: i64,
    ) -> StorageResult<Vec<GaugeValueRow>> {
        gauge_table(level)?;
        self.faults.check_read("read_gauge_values")?;
        let tables = self.tables.lock();
        Ok(tables
            .gauges
            .get(&level)
            .map(|t| {
                t.values()
                    .filter(|r| {
                        r.agent_rollup_id == agent_rollup_id
                            && r.gauge_name == gauge_name
                            && r.capture_time > from
                            && r.capture_time <= to
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl NeedsRollupStore for MemoryRollupStore {
    async fn upsert_needs_rollup(
        &self,
        kind: MetricKind,
        level: usize,
        agent_rollup_id: &str,
        capture_time: i64,
        sub_keys: BTreeSet<String>,
        token: String,
    ) -> StorageResult<()> {
        let mut tables = self.tables.lock();
        let key = (kind, level, agent_rollup_id.to_string(), capture_time);
        let row = tables
            .needs_rollup
            .entry(key)
            .or_insert_with(|| NeedsRollupRow {
                kind,
                level,
                agent_rollup_id: agent_rollup_id.to_string(),
                capture_time,
                sub_keys: BTreeSet::new(),
                token: String::new(),
            });
        row.sub_keys.extend(sub_keys);
        row.token = token;
        Ok(())
    }

    async fn read_needs_rollup(
        &self,
        kind: MetricKind,
        level: usize,
        agent_rollup_id: &str,
        after: i64,
        up_to: i64,
        limit: usize,
    ) -> StorageResult<Vec<NeedsRollupRow>> {
        if after >= up_to {
            return Ok(Vec::new());
        }
        let tables = self.tables.lock();
        let start = (kind, level, agent_rollup_id.to_string(), after);
        let end = (kind, level, agent_rollup_id.to_string(), up_to);
        Ok(tables
            .needs_rollup
            .range(start..=end)
            .filter(|(k, _)| k.3 > after)
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn delete_needs_rollup_if(
        &self,
        kind: MetricKind,
        level: usize,
        agent_rollup_id: &str,
        capture_time: i64,
        expected_token: &str,
    ) -> StorageResult<bool> {
        let mut tables = self.tables.lock();
        let key = (kind, level, agent_rollup_id.to_string(), capture_time);
        match tables.needs_rollup.get(&key) {
            Some(row) if row.token == expected_token => {
                tables.needs_rollup.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn replace_needs_rollup_if(
        &self,
        kind: MetricKind,
        level: usize,
        agent_rollup_id: &str,
        capture_time: i64,
        expected_token: &str,
        remaining: BTreeSet<String>,
        new_token: String,
    ) -> StorageResult<bool> {
        let mut tables = self.tables.lock();
        let key = (kind, level, agent_rollup_id.to_string(), capture_time);
        match tables.needs_rollup.get_mut(&key) {
            Some(row) if row.token == expected_token => {
                row.sub_keys = remaining;
                row.token = new_token;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_needs_rollup(
        &self,
        kind: MetricKind,
        level: usize,
        agent_rollup_id: &str,
    ) -> StorageResult<usize> {
        let tables = self.tables.lock();
        Ok(tables
            .needs_rollup
            .keys()
            .filter(|(k, l, a, _)| *k == kind && *l == level && a == agent_rollup_id)
            .count())
    }
}

#[async_trait]
impl AgentRollupStore for MemoryRollupStore {
    async fn touch_agent_rollup(
        &self,
        agent_rollup_id: &str,
        parent_id: Option<&str>,
        capture_time: i64,
    ) -> StorageResult<()> {
        let mut tables = self.tables.lock();
        let row = tables
            .agent_rollups
            .entry(agent_rollup_id.to_string())
            .or_insert_with(|| AgentRollupRow {
                agent_rollup_id: agent_rollup_id.to_string(),
                parent_id: parent_id.map(String::from),
                last_capture_time: capture_time,
            });
        row.parent_id = parent_id.map(String::from);
        row.last_capture_time = row.last_capture_time.max(capture_time);
        Ok(())
    }

    async fn get_agent_rollup(
        &self,
        agent_rollup_id: &str,
    ) -> StorageResult<Option<AgentRollupRow>> {
        Ok(self.tables.lock().agent_rollups.get(agent_rollup_id).cloned())
    }

    async fn children(&self, parent_id: &str) -> StorageResult<Vec<String>> {
        let tables = self.tables.lock();
        Ok(tables
            .agent_rollups
            .values()
            .filter(|r| r.parent_id.as_deref() == Some(parent_id))
            .map(|r| r.agent_rollup_id.clone())
            .collect())
    }

    async fn roots(&self) -> StorageResult<Vec<String>> {
        let tables = self.tables.lock();
        Ok(tables
            .agent_rollups
            .values()
            .filter(|r| r.parent_id.is_none())
            .map(|r| r.agent_rollup_id.clone())
            .collect())
    }

    async fn record_metric_name(
        &self,
        kind: MetricKind,
        agent_rollup_id: &str,
        name: &str,
    ) -> StorageResult<()> {
        let mut tables = self.tables.lock();
        tables
            .metric_names
            .entry((kind, agent_rollup_id.to_string()))
            .or_default()
            .insert(name.to_string());
        Ok(())
    }

    async fn metric_names(
        &self,
        kind: MetricKind,
        agent_rollup_id: &str,
    ) -> StorageResult<Vec<String>> {
        let tables = self.tables.lock();
        Ok(tables
            .metric_names
            .get(&(kind, agent_rollup_id.to_string()))
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl TracePointStore for MemoryRollupStore {
    async fn write_trace_point(&self, row: TracePointRow) -> StorageResult<()> {
        let mut tables = self.tables.lock();
        // Same (rollup, agent, trace, capture time) overwrites.
        tables.trace_points.retain(|p| {
            !(p.agent_rollup_id == row.agent_rollup_id
                && p.agent_id == row.agent_id
                && p.trace_id == row.trace_id
                && p.capture_time == row.capture_time)
        });
        tables.trace_points.push(row);
        Ok(())
    }

    async fn read_trace_points(
        &self,
        agent_rollup_id: &str,
        transaction_type: &str,
        transaction_name: Option<&str>,
        from: i64,
        to: i64,
    ) -> StorageResult<Vec<TracePointRow>> {
        let tables = self.tables.lock();
        let mut points: Vec<TracePointRow> = tables
            .trace_points
            .iter()
            .filter(|p| {
                p.agent_rollup_id == agent_rollup_id
                    && p.transaction_type == transaction_type
                    && transaction_name.map_or(true, |n| p.transaction_name == n)
                    && p.capture_time > from
                    && p.capture_time <= to
            })
            .cloned()
            .collect();
        points.sort_by_key(|p| p.capture_time);
        Ok(points)
    }

    async fn delete_partial_trace_points(
        &self,
        agent_rollup_id: &str,
        agent_id: &str,
        trace_id: &str,
        before: i64,
    ) -> StorageResult<()> {
        let mut tables = self.tables.lock();
        tables.trace_points.retain(|p| {
            !(p.partial
                && p.agent_rollup_id == agent_rollup_id
                && p.agent_id == agent_id
                && p.trace_id == trace_id
                && p.capture_time < before)
        });
        Ok(())
    }
}

#[async_trait]
impl QueryTextStore for MemoryRollupStore {
    async fn write_full_query_text(&self, sha: &str, text: &str) -> StorageResult<()> {
        let mut tables = self.tables.lock();
        tables
            .full_query_texts
            .insert(sha.to_string(), text.to_string());
        Ok(())
    }

    async fn read_full_query_text(&self, sha: &str) -> StorageResult<Option<String>> {
        Ok(self.tables.lock().full_query_texts.get(sha).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injected_read_failures_count_down() {
        let store = MemoryRollupStore::new();
        store.faults().fail_reads(1);
        let err = store
            .read_aggregates(0, "a", "Web", &NameFilter::All, 0, 10)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(store
            .read_aggregates(0, "a", "Web", &NameFilter::All, 0, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn read_needs_rollup_respects_bounds() {
        let store = MemoryRollupStore::new();
        for t in [100, 200, 300] {
            store
                .upsert_needs_rollup(
                    MetricKind::Gauge,
                    1,
                    "a",
                    t,
                    BTreeSet::from(["g".to_string()]),
                    format!("tok{t}"),
                )
                .await
                .unwrap();
        }
        let rows = store
            .read_needs_rollup(MetricKind::Gauge, 1, "a", 100, 300, 10)
            .await
            .unwrap();
        let times: Vec<i64> = rows.iter().map(|r| r.capture_time).collect();
        assert_eq!(times, vec![200, 300]);
        assert!(store
            .read_needs_rollup(MetricKind::Aggregate, 1, "a", 0, 300, 10)
            .await
            .unwrap()
            .is_empty());
    }
}
