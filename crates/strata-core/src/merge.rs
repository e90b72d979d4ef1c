//! Merge rules shared by the rollup engine and the read path
//!
//! - counters and durations: sum
//! - gauges: `sum(value * weight) / sum(weight)`, no value when the weight sum is 0
//! - histograms: structural merge
//! - timer trees: merged recursively by `(name, extended)`
//! - queries and service calls: merged by key, summing totals
//!
//! Profile blob references are only collected here; the blobs themselves are
//! merged by [`crate::profile`].

use std::collections::BTreeMap;

use strata_store::{
    BlobId, QueryEntry, ServiceCallEntry, StoredAggregate, ThreadStats, TimerNode,
};

use crate::error::Result;
use crate::histogram::DurationHistogram;

type QueryKey = (String, String, Option<String>);

/// Accumulates aggregates into one.
#[derive(Debug, Default)]
pub struct AggregateMerger {
    total_duration_nanos: f64,
    transaction_count: u64,
    error_count: u64,
    async_transactions: bool,
    main_thread_root_timers: Vec<TimerNode>,
    aux_thread_root_timers: Vec<TimerNode>,
    async_timers: Vec<TimerNode>,
    main_thread_stats: Option<ThreadStats>,
    aux_thread_stats: Option<ThreadStats>,
    histogram: DurationHistogram,
    queries: BTreeMap<QueryKey, QueryEntry>,
    service_calls: BTreeMap<(String, String), ServiceCallEntry>,
    main_thread_profiles: Vec<BlobId>,
    aux_thread_profiles: Vec<BlobId>,
    merged: usize,
}

impl AggregateMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of aggregates merged so far.
    pub fn merged(&self) -> usize {
        self.merged
    }

    pub fn is_empty(&self) -> bool {
        self.merged == 0
    }

    pub fn add(&mut self, aggregate: &StoredAggregate) -> Result<()> {
        self.histogram
            .merge(&DurationHistogram::decode(&aggregate.duration_histogram)?)?;

        self.total_duration_nanos += aggregate.total_duration_nanos;
        self.transaction_count += aggregate.transaction_count;
        self.error_count += aggregate.error_count;
        self.async_transactions |= aggregate.async_transactions;
        merge_timers(
            &mut self.main_thread_root_timers,
            &aggregate.main_thread_root_timers,
        );
        merge_timers(
            &mut self.aux_thread_root_timers,
            &aggregate.aux_thread_root_timers,
        );
        merge_timers(&mut self.async_timers, &aggregate.async_timers);
        merge_thread_stats(&mut self.main_thread_stats, &aggregate.main_thread_stats);
        merge_thread_stats(&mut self.aux_thread_stats, &aggregate.aux_thread_stats);
        for query in &aggregate.queries {
            merge_query(&mut self.queries, query);
        }
        for call in &aggregate.service_calls {
            merge_service_call(&mut self.service_calls, call);
        }
        self.main_thread_profiles
            .extend(aggregate.main_thread_profile.iter().copied());
        self.aux_thread_profiles
            .extend(aggregate.aux_thread_profile.iter().copied());
        self.merged += 1;
        Ok(())
    }

    /// Blob ids of the main and auxiliary thread profiles seen so far.
    pub fn profile_ids(&self) -> (&[BlobId], &[BlobId]) {
        (&self.main_thread_profiles, &self.aux_thread_profiles)
    }

    pub fn histogram(&self) -> &DurationHistogram {
        &self.histogram
    }

    pub fn total_duration_nanos(&self) -> f64 {
        self.total_duration_nanos
    }

    pub fn transaction_count(&self) -> u64 {
        self.transaction_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// Queries merged so far, keyed by `(type, truncated text, digest)`.
    pub fn queries(&self) -> impl Iterator<Item = &QueryEntry> {
        self.queries.values()
    }

    pub fn service_calls(&self) -> impl Iterator<Item = &ServiceCallEntry> {
        self.service_calls.values()
    }

    /// Build the merged aggregate with freshly written profile blobs.
    pub fn finish(
        self,
        main_thread_profile: Option<BlobId>,
        aux_thread_profile: Option<BlobId>,
    ) -> Result<StoredAggregate> {
        Ok(StoredAggregate {
            total_duration_nanos: self.total_duration_nanos,
            transaction_count: self.transaction_count,
            error_count: self.error_count,
            async_transactions: self.async_transactions,
            main_thread_root_timers: self.main_thread_root_timers,
            aux_thread_root_timers: self.aux_thread_root_timers,
            async_timers: self.async_timers,
            main_thread_stats: self.main_thread_stats,
            aux_thread_stats: self.aux_thread_stats,
            duration_histogram: self.histogram.encode()?,
            queries: self.queries.into_values().collect(),
            service_calls: self.service_calls.into_values().collect(),
            main_thread_profile,
            aux_thread_profile,
        })
    }
}

fn merge_timers(target: &mut Vec<TimerNode>, source: &[TimerNode]) {
    for timer in source {
        match target
            .iter_mut()
            .find(|t| t.name == timer.name && t.extended == timer.extended)
        {
            Some(existing) => {
                existing.total_nanos += timer.total_nanos;
                existing.count += timer.count;
                merge_timers(&mut existing.children, &timer.children);
            }
            None => target.push(timer.clone()),
        }
    }
}

fn add_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x + y),
        (x, None) => x,
        (None, y) => y,
    }
}

fn merge_thread_stats(target: &mut Option<ThreadStats>, source: &Option<ThreadStats>) {
    let Some(source) = source else {
        return;
    };
    let merged = match target.take() {
        Some(t) => ThreadStats {
            cpu_nanos: add_opt(t.cpu_nanos, source.cpu_nanos),
            blocked_nanos: add_opt(t.blocked_nanos, source.blocked_nanos),
            waited_nanos: add_opt(t.waited_nanos, source.waited_nanos),
            allocated_bytes: add_opt(t.allocated_bytes, source.allocated_bytes),
        },
        None => source.clone(),
    };
    *target = Some(merged);
}

fn merge_query(target: &mut BTreeMap<QueryKey, QueryEntry>, query: &QueryEntry) {
    let key = (
        query.query_type.clone(),
        query.truncated_text.clone(),
        query.full_text_sha.clone(),
    );
    match target.get_mut(&key) {
        Some(existing) => {
            existing.total_duration_nanos += query.total_duration_nanos;
            existing.execution_count += query.execution_count;
            existing.total_rows = match (existing.total_rows, query.total_rows) {
                (Some(a), Some(b)) => Some(a + b),
                (a, None) => a,
                (None, b) => b,
            };
        }
        None => {
            target.insert(key, query.clone());
        }
    }
}

fn merge_service_call(
    target: &mut BTreeMap<(String, String), ServiceCallEntry>,
    call: &ServiceCallEntry,
) {
    target
        .entry((call.call_type.clone(), call.text.clone()))
        .and_modify(|existing| {
            existing.total_duration_nanos += call.total_duration_nanos;
            existing.execution_count += call.execution_count;
        })
        .or_insert_with(|| call.clone());
}

/// Weighted average of gauge values.
#[derive(Debug, Default, Clone, Copy)]
pub struct GaugeMerger {
    weighted_sum: f64,
    total_weight: i64,
}

impl GaugeMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64, weight: i64) {
        self.weighted_sum += value * weight as f64;
        self.total_weight += weight;
    }

    /// `(value, weight)`, or `None` when no weight was contributed.
    pub fn finish(&self) -> Option<(f64, i64)> {
        if self.total_weight == 0 {
            return None;
        }
        Some((self.weighted_sum / self.total_weight as f64, self.total_weight))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(name: &str, nanos: f64, count: u64, children: Vec<TimerNode>) -> TimerNode {
        TimerNode {
            name: name.to_string(),
            extended: false,
            total_nanos: nanos,
            count,
            children,
        }
    }

    fn aggregate(nanos: f64, count: u64, errors: u64) -> StoredAggregate {
        StoredAggregate {
            total_duration_nanos: nanos,
            transaction_count: count,
            error_count: errors,
            ..Default::default()
        }
    }

    #[test]
    fn sums_counters() {
        let mut merger = AggregateMerger::new();
        merger.add(&aggregate(1234.0, 1, 0)).unwrap();
        merger.add(&aggregate(2345.0, 2, 1)).unwrap();
        let merged = merger.finish(None, None).unwrap();
        assert_eq!(merged.total_duration_nanos, 3579.0);
        assert_eq!(merged.transaction_count, 3);
        assert_eq!(merged.error_count, 1);
    }

    #[test]
    fn timers_merge_recursively_by_name() {
        let mut a = aggregate(0.0, 1, 0);
        a.main_thread_root_timers = vec![timer("http", 10.0, 1, vec![timer("jdbc", 4.0, 2, vec![])])];
        let mut b = aggregate(0.0, 1, 0);
        b.main_thread_root_timers = vec![timer(
            "http",
            20.0,
            1,
            vec![timer("jdbc", 6.0, 1, vec![]), timer("cache", 1.0, 1, vec![])],
        )];

        let mut merger = AggregateMerger::new();
        merger.add(&a).unwrap();
        merger.add(&b).unwrap();
        let merged = merger.finish(None, None).unwrap();

        let root = &merged.main_thread_root_timers[0];
        assert_eq!(merged.main_thread_root_timers.len(), 1);
        assert_eq!(root.total_nanos, 30.0);
        assert_eq!(root.count, 2);
        assert_eq!(root.children[0].total_nanos, 10.0);
        assert_eq!(root.children[0].count, 3);
        assert_eq!(root.children[1].name, "cache");
    }

    #[test]
    fn thread_stats_keep_absent_fields_absent() {
        let mut a = aggregate(0.0, 1, 0);
        a.main_thread_stats = Some(ThreadStats {
            cpu_nanos: Some(5.0),
            ..Default::default()
        });
        let mut b = aggregate(0.0, 1, 0);
        b.main_thread_stats = Some(ThreadStats {
            cpu_nanos: Some(7.0),
            allocated_bytes: Some(100.0),
            ..Default::default()
        });
        let mut merger = AggregateMerger::new();
        merger.add(&a).unwrap();
        merger.add(&b).unwrap();
        let stats = merger.finish(None, None).unwrap().main_thread_stats.unwrap();
        assert_eq!(stats.cpu_nanos, Some(12.0));
        assert_eq!(stats.allocated_bytes, Some(100.0));
        assert_eq!(stats.blocked_nanos, None);
    }

    #[test]
    fn queries_merge_by_key() {
        let query = |text: &str, nanos: f64, rows: Option<u64>| QueryEntry {
            query_type: "SQL".into(),
            truncated_text: text.into(),
            full_text_sha: None,
            total_duration_nanos: nanos,
            execution_count: 1,
            total_rows: rows,
        };
        let mut a = aggregate(0.0, 1, 0);
        a.queries = vec![query("select 1", 10.0, Some(1)), query("select 2", 5.0, None)];
        let mut b = aggregate(0.0, 1, 0);
        b.queries = vec![query("select 1", 20.0, Some(3))];

        let mut merger = AggregateMerger::new();
        merger.add(&a).unwrap();
        merger.add(&b).unwrap();
        let merged = merger.finish(None, None).unwrap();
        assert_eq!(merged.queries.len(), 2);
        assert_eq!(merged.queries[0].total_duration_nanos, 30.0);
        assert_eq!(merged.queries[0].execution_count, 2);
        assert_eq!(merged.queries[0].total_rows, Some(4));
    }

    #[test]
    fn profile_ids_are_collected() {
        let mut a = aggregate(0.0, 1, 0);
        a.main_thread_profile = Some(BlobId(3));
        let mut b = aggregate(0.0, 1, 0);
        b.aux_thread_profile = Some(BlobId(4));
        let mut merger = AggregateMerger::new();
        merger.add(&a).unwrap();
        merger.add(&b).unwrap();
        let (main, aux) = merger.profile_ids();
        assert_eq!(main, &[BlobId(3)]);
        assert_eq!(aux, &[BlobId(4)]);
    }

    #[test]
    fn gauge_weighted_average() {
        let mut merger = GaugeMerger::new();
        merger.add(10.0, 1);
        merger.add(40.0, 2);
        assert_eq!(merger.finish(), Some((30.0, 3)));
    }

    #[test]
    fn gauge_zero_weight_yields_nothing() {
        let mut merger = GaugeMerger::new();
        merger.add(10.0, 0);
        assert_eq!(merger.finish(), None);
        assert_eq!(GaugeMerger::new().finish(), None);
    }

    #[test]
    fn weighted_average_is_associative() {
        let samples = [(1.0, 60_000), (3.0, 60_000), (8.0, 30_000), (2.0, 90_000)];
        let mut direct = GaugeMerger::new();
        for (v, w) in samples {
            direct.add(v, w);
        }

        let mut left = GaugeMerger::new();
        let mut right = GaugeMerger::new();
        for (v, w) in &samples[..2] {
            left.add(*v, *w);
        }
        for (v, w) in &samples[2..] {
            right.add(*v, *w);
        }
        let mut combined = GaugeMerger::new();
        for part in [left, right] {
            let (v, w) = part.finish().unwrap();
            combined.add(v, w);
        }

        let (a, wa) = direct.finish().unwrap();
        let (b, wb) = combined.finish().unwrap();
        assert_eq!(wa, wb);
        assert!((a - b).abs() < 1e-9);
    }
}
