//! Rollup engine: compacts one bucket of one metric into a coarser level
//!
//! A bucket is read completely before anything is written, and the
//! destination rows always overwrite, so re-running a bucket after a crash
//! yields the same rows instead of double counting. Ancestor level 0 is the
//! merge of the children's level-0 rows for the same bucket.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::try_join_all;
use strata_store::{
    AggregateRow, BlobStore, GaugeValueRow, MetricKind, NameFilter, RollupStore,
};
use tracing::debug;

use crate::error::Result;
use crate::gate::{StorageGate, StorageProfile};
use crate::merge::{AggregateMerger, GaugeMerger};
use crate::profile::merge_and_store;

/// Result of compacting one bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketOutcome {
    /// Overall and per-transaction-name rows written for one transaction type.
    Aggregates(Vec<AggregateRow>),
    /// One weighted-average gauge row.
    Gauge(GaugeValueRow),
    /// Nothing contributed to the bucket; no row was written.
    NoData,
}

impl BucketOutcome {
    /// Destination rows written.
    pub fn rows(&self) -> usize {
        match self {
            BucketOutcome::Aggregates(rows) => rows.len(),
            BucketOutcome::Gauge(_) => 1,
            BucketOutcome::NoData => 0,
        }
    }

    pub fn is_written(&self) -> bool {
        !matches!(self, BucketOutcome::NoData)
    }
}

#[derive(Clone)]
pub struct RollupEngine {
    store: Arc<dyn RollupStore>,
    blobs: Arc<dyn BlobStore>,
    gate: StorageGate,
}

impl RollupEngine {
    pub fn new(store: Arc<dyn RollupStore>, blobs: Arc<dyn BlobStore>, gate: StorageGate) -> Self {
        Self { store, blobs, gate }
    }

    /// Merge source rows at `from_level` with capture time in
    /// `(bucket_start, bucket_end]` into one destination row set at
    /// `to_level`, captured at `bucket_end`.
    ///
    /// `metric_key` is the transaction type for aggregates and the gauge name
    /// for gauges. When `to_level == from_level == 0` the sources are the
    /// registered children of `agent_rollup_id`.
    #[allow(clippy::too_many_arguments)]
    pub async fn rollup_one_bucket(
        &self,
        kind: MetricKind,
        agent_rollup_id: &str,
        metric_key: &str,
        from_level: usize,
        to_level: usize,
        bucket_start: i64,
        bucket_end: i64,
    ) -> Result<BucketOutcome> {
        let sources = self.sources(agent_rollup_id, to_level).await?;
        if sources.is_empty() {
            return Ok(BucketOutcome::NoData);
        }
        let bucket = Bucket {
            agent_rollup_id,
            metric_key,
            from_level,
            to_level,
            start: bucket_start,
            end: bucket_end,
        };
        match kind {
            MetricKind::Aggregate => self.rollup_aggregates(&bucket, &sources).await,
            MetricKind::Gauge => self.rollup_gauge(&bucket, &sources).await,
        }
    }

    async fn sources(&self, agent_rollup_id: &str, to_level: usize) -> Result<Vec<String>> {
        if to_level > 0 {
            return Ok(vec![agent_rollup_id.to_string()]);
        }
        let children = self
            .gate
            .run(
                StorageProfile::Rollup,
                "children",
                self.store.children(agent_rollup_id),
            )
            .await?;
        Ok(children)
    }

    async fn rollup_aggregates(
        &self,
        bucket: &Bucket<'_>,
        sources: &[String],
    ) -> Result<BucketOutcome> {
        let reads = sources.iter().map(|source| {
            self.gate.run(
                StorageProfile::Rollup,
                "read_aggregates",
                self.store.read_aggregates(
                    bucket.from_level,
                    source,
                    bucket.metric_key,
                    &NameFilter::All,
                    bucket.start,
                    bucket.end,
                ),
            )
        });
        let source_rows: Vec<AggregateRow> = try_join_all(reads).await?.into_iter().flatten().collect();
        if source_rows.is_empty() {
            return Ok(BucketOutcome::NoData);
        }

        let mut groups: BTreeMap<Option<String>, AggregateMerger> = BTreeMap::new();
        for row in &source_rows {
            groups
                .entry(row.transaction_name.clone())
                .or_default()
                .add(&row.aggregate)?;
        }

        let mut rows = Vec::with_capacity(groups.len());
        for (transaction_name, merger) in groups {
            let (main_ids, aux_ids) = merger.profile_ids();
            let main = merge_and_store(&self.blobs, main_ids).await?;
            let aux = merge_and_store(&self.blobs, aux_ids).await?;
            rows.push(AggregateRow {
                agent_rollup_id: bucket.agent_rollup_id.to_string(),
                transaction_type: bucket.metric_key.to_string(),
                transaction_name,
                capture_time: bucket.end,
                aggregate: merger.finish(main, aux)?,
            });
        }

        debug!(
            agent_rollup_id = %bucket.agent_rollup_id,
            transaction_type = %bucket.metric_key,
            level = bucket.to_level,
            capture_time = bucket.end,
            sources = source_rows.len(),
            rows = rows.len(),
            "aggregate bucket merged"
        );
        self.gate
            .run(
                StorageProfile::Rollup,
                "write_aggregates",
                self.store.write_aggregates(bucket.to_level, rows.clone()),
            )
            .await?;
        Ok(BucketOutcome::Aggregates(rows))
    }

    async fn rollup_gauge(&self, bucket: &Bucket<'_>, sources: &[String]) -> Result<BucketOutcome> {
        let reads = sources.iter().map(|source| {
            self.gate.run(
                StorageProfile::Rollup,
                "read_gauge_values",
                self.store.read_gauge_values(
                    bucket.from_level,
                    source,
                    bucket.metric_key,
                    bucket.start,
                    bucket.end,
                ),
            )
        });
        let mut merger = GaugeMerger::new();
        for row in try_join_all(reads).await?.iter().flatten() {
            merger.add(row.value, row.weight);
        }
        let Some((value, weight)) = merger.finish() else {
            return Ok(BucketOutcome::NoData);
        };

        let row = GaugeValueRow {
            agent_rollup_id: bucket.agent_rollup_id.to_string(),
            gauge_name: bucket.metric_key.to_string(),
            capture_time: bucket.end,
            value,
            weight,
        };
        self.gate
            .run(
                StorageProfile::Rollup,
                "write_gauge_values",
                self.store
                    .write_gauge_values(bucket.to_level, vec![row.clone()]),
            )
            .await?;
        Ok(BucketOutcome::Gauge(row))
    }
}

struct Bucket<'a> {
    agent_rollup_id: &'a str,
    metric_key: &'a str,
    from_level: usize,
    to_level: usize,
    start: i64,
    end: i64,
}
