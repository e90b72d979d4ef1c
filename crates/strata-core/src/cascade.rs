//! Hierarchical cascade driver
//!
//! `rollup(root)` walks the agent rollup tree below `root` children first,
//! so an ancestor only merges its children's level-0 rows after they had a
//! chance to be written in the same pass. Per partition:
//!
//! - a leaf rolls its own rows up through levels `1..N`;
//! - an ancestor first builds its level 0 from its children (queue level 0),
//!   then rolls that up through `1..N` exactly like a leaf.
//!
//! Level `N` only processes boundaries strictly older than the oldest still
//! pending boundary at level `N-1`, so a failed finer bucket never yields an
//! incomplete coarser one. Failures leave the entry pending for the next pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::TryStreamExt;
use strata_store::{MetricKind, RollupStore};
use tracing::{info, warn, Instrument};

use crate::agent_rollup::AgentRollupId;
use crate::clock::Clock;
use crate::config::RollupLevels;
use crate::engine::RollupEngine;
use crate::error::{Result, RollupError};
use crate::gate::{StorageGate, StorageProfile};
use crate::metrics::METRICS;
use crate::obs;
use crate::watermark::RollupWatermarks;
use crate::work_queue::{NeedsRollupEntry, NeedsRollupQueue, Partition, RetireOutcome};

/// Counts for one or more cascade passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupSummary {
    pub agent_rollups: usize,
    pub buckets_rolled_up: usize,
    pub empty_buckets: usize,
    pub failed_buckets: usize,
    pub stale_retires: usize,
    /// Partitions abandoned for this pass (queue or registry unreachable).
    pub partition_errors: usize,
}

impl RollupSummary {
    pub fn absorb(&mut self, other: RollupSummary) {
        self.agent_rollups += other.agent_rollups;
        self.buckets_rolled_up += other.buckets_rolled_up;
        self.empty_buckets += other.empty_buckets;
        self.failed_buckets += other.failed_buckets;
        self.stale_retires += other.stale_retires;
        self.partition_errors += other.partition_errors;
    }

    pub fn is_clean(&self) -> bool {
        self.failed_buckets == 0 && self.partition_errors == 0
    }
}

#[derive(Clone)]
pub struct CascadeDriver {
    store: Arc<dyn RollupStore>,
    queue: NeedsRollupQueue,
    engine: RollupEngine,
    gate: StorageGate,
    levels: RollupLevels,
    clock: Arc<dyn Clock>,
    delay_millis: i64,
    watermarks: Arc<RollupWatermarks>,
}

impl CascadeDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RollupStore>,
        queue: NeedsRollupQueue,
        engine: RollupEngine,
        gate: StorageGate,
        levels: RollupLevels,
        clock: Arc<dyn Clock>,
        delay_millis: i64,
        watermarks: Arc<RollupWatermarks>,
    ) -> Self {
        Self {
            store,
            queue,
            engine,
            gate,
            levels,
            clock,
            delay_millis,
            watermarks,
        }
    }

    /// Roll up `root` and every registered descendant.
    ///
    /// Safe to call redundantly or concurrently; bucket errors are logged,
    /// counted and left pending rather than returned.
    pub async fn rollup(&self, root: &AgentRollupId) -> RollupSummary {
        let mut summary = RollupSummary::default();
        for id in self.post_order(root, &mut summary).await {
            summary.agent_rollups += 1;
            for kind in MetricKind::ALL {
                let span = obs::rollup_span(id.as_str(), kind);
                match self.rollup_partition(&id, kind).instrument(span).await {
                    Ok(partition_summary) => summary.absorb(partition_summary),
                    Err(e) => {
                        warn!(
                            agent_rollup_id = %id,
                            kind = %kind,
                            error = %e,
                            "rollup pass abandoned for partition"
                        );
                        summary.partition_errors += 1;
                    }
                }
            }
        }
        summary
    }

    /// Descendants of `root` (inclusive), every child before its parent.
    async fn post_order(
        &self,
        root: &AgentRollupId,
        summary: &mut RollupSummary,
    ) -> Vec<AgentRollupId> {
        let mut order = vec![root.clone()];
        let mut next = 0;
        while next < order.len() {
            let parent = order[next].clone();
            next += 1;
            if parent.is_leaf() {
                continue;
            }
            let children = self
                .gate
                .run(
                    StorageProfile::Rollup,
                    "children",
                    self.store.children(parent.as_str()),
                )
                .await;
            match children {
                Ok(children) => {
                    for child in children {
                        match AgentRollupId::parse(child) {
                            Ok(id) => order.push(id),
                            Err(e) => warn!(error = %e, "skipping unparseable registry entry"),
                        }
                    }
                }
                Err(e) => {
                    warn!(agent_rollup_id = %parent, error = %e, "could not list children");
                    summary.partition_errors += 1;
                }
            }
        }
        order.reverse();
        order
    }

    async fn rollup_partition(
        &self,
        id: &AgentRollupId,
        kind: MetricKind,
    ) -> Result<RollupSummary> {
        let mut summary = RollupSummary::default();
        let partition = Partition::new(kind, id.as_str());
        let first = if id.is_leaf() { 1 } else { 0 };
        let due = self.clock.now_millis().saturating_sub(self.delay_millis);

        for level in first..self.levels.len() {
            let mut up_to = due;
            if level > first {
                if let Some(oldest) = self.queue.oldest_pending(&partition, level - 1).await? {
                    up_to = up_to.min(oldest - 1);
                }
            }
            self.process_level(id, &partition, level, up_to, &mut summary)
                .await?;
        }
        Ok(summary)
    }

    async fn process_level(
        &self,
        id: &AgentRollupId,
        partition: &Partition,
        level: usize,
        up_to: i64,
        summary: &mut RollupSummary,
    ) -> Result<()> {
        let Some(spec) = self.levels.get(level) else {
            return Ok(());
        };
        let interval = spec.interval_millis;
        let from_level = level.saturating_sub(1);

        let mut pending = self.queue.list_pending(partition, level, up_to);
        while let Some(entry) = pending.try_next().await? {
            let handled = self
                .rollup_entry(id, &entry, from_level, interval, summary)
                .await;
            match self.queue.retire(&entry, &handled).await? {
                RetireOutcome::Deleted => self.watermarks.advance(level, entry.boundary),
                RetireOutcome::Stale => {
                    METRICS.inc_stale_retires();
                    obs::emit_retire_stale(level, entry.boundary);
                    summary.stale_retires += 1;
                }
                RetireOutcome::Rewritten | RetireOutcome::Unchanged => {}
            }
        }
        Ok(())
    }

    /// Roll up every pending sub-key of `entry`; returns the keys that succeeded.
    async fn rollup_entry(
        &self,
        id: &AgentRollupId,
        entry: &NeedsRollupEntry,
        from_level: usize,
        interval: i64,
        summary: &mut RollupSummary,
    ) -> BTreeSet<String> {
        let kind = entry.partition.kind;
        let level = entry.level;
        let mut handled = BTreeSet::new();

        for key in &entry.pending_sub_keys {
            let result = async {
                let outcome = self
                    .engine
                    .rollup_one_bucket(
                        kind,
                        id.as_str(),
                        key,
                        from_level,
                        level,
                        entry.boundary - interval,
                        entry.boundary,
                    )
                    .await?;
                if level == 0 && outcome.is_written() {
                    self.enqueue_above_ancestor_level_zero(id, kind, key, entry.boundary)
                        .await?;
                }
                Ok::<_, RollupError>(outcome)
            }
            .await;

            match result {
                Ok(outcome) if outcome.is_written() => {
                    METRICS.inc_buckets_rolled_up();
                    obs::emit_bucket_rolled_up(key, level, entry.boundary, outcome.rows());
                    summary.buckets_rolled_up += 1;
                    handled.insert(key.clone());
                }
                Ok(_) => {
                    METRICS.inc_empty_buckets();
                    summary.empty_buckets += 1;
                    handled.insert(key.clone());
                }
                Err(e) => {
                    METRICS.inc_failed_buckets();
                    obs::emit_bucket_failed(key, level, entry.boundary, &e);
                    summary.failed_buckets += 1;
                }
            }
        }
        handled
    }

    /// An ancestor's new level-0 row needs its own coarser levels and its
    /// parent's level 0.
    async fn enqueue_above_ancestor_level_zero(
        &self,
        id: &AgentRollupId,
        kind: MetricKind,
        key: &str,
        capture_time: i64,
    ) -> Result<()> {
        let keys = BTreeSet::from([key.to_string()]);
        let own = Partition::new(kind, id.as_str());
        for spec in self.levels.rolled_up() {
            self.queue
                .enqueue(&own, spec.level, spec.boundary_for(capture_time), keys.clone())
                .await?;
        }
        if let Some(parent) = id.parent() {
            let parent = Partition::new(kind, parent.as_str());
            self.queue
                .enqueue(
                    &parent,
                    0,
                    self.levels.finest().boundary_for(capture_time),
                    keys,
                )
                .await?;
        }
        Ok(())
    }

    /// Roll up every registered root.
    pub async fn rollup_all(&self) -> Result<RollupSummary> {
        let roots = self
            .gate
            .run(StorageProfile::Rollup, "roots", self.store.roots())
            .await?;
        let mut summary = RollupSummary::default();
        for root in roots {
            match AgentRollupId::parse(root) {
                Ok(root) => summary.absorb(self.rollup(&root).await),
                Err(e) => warn!(error = %e, "skipping unparseable root"),
            }
        }
        info!(
            agent_rollups = summary.agent_rollups,
            buckets_rolled_up = summary.buckets_rolled_up,
            failed_buckets = summary.failed_buckets,
            "rollup pass complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_store::{
        AggregateRow, AggregateStore, AgentRollupStore, BlobStore, CappedBlobStore,
        MemoryRollupStore, NameFilter, StoredAggregate,
    };

    use crate::clock::ManualClock;
    use crate::config::StrataConfig;

    struct Fixture {
        store: Arc<MemoryRollupStore>,
        queue: NeedsRollupQueue,
        driver: CascadeDriver,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryRollupStore::new());
        let blobs: Arc<dyn BlobStore> = Arc::new(CappedBlobStore::new(1 << 20));
        let gate = StorageGate::default();
        let queue = NeedsRollupQueue::new(store.clone(), gate.clone());
        let engine = RollupEngine::new(store.clone(), blobs, gate.clone());
        let config = StrataConfig::default();
        let levels = config.rollup_levels().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let watermarks = Arc::new(RollupWatermarks::new(levels.len()));
        let driver = CascadeDriver::new(
            store.clone(),
            queue.clone(),
            engine,
            gate,
            levels,
            clock.clone(),
            config.rollup_delay_millis,
            watermarks,
        );
        Fixture {
            store,
            queue,
            driver,
            clock,
        }
    }

    async fn write_leaf_row(f: &Fixture, agent: &str, ct: i64) {
        f.store
            .write_aggregates(
                0,
                vec![AggregateRow {
                    agent_rollup_id: agent.to_string(),
                    transaction_type: "Web".to_string(),
                    transaction_name: None,
                    capture_time: ct,
                    aggregate: StoredAggregate {
                        total_duration_nanos: 10.0,
                        transaction_count: 1,
                        ..Default::default()
                    },
                }],
            )
            .await
            .unwrap();
    }

    fn web() -> BTreeSet<String> {
        BTreeSet::from(["Web".to_string()])
    }

    #[tokio::test]
    async fn leaf_rolls_up_due_buckets_only() {
        let f = fixture();
        let leaf = Partition::new(MetricKind::Aggregate, "a");
        write_leaf_row(&f, "a", 60_000).await;
        write_leaf_row(&f, "a", 360_000).await;
        f.queue.enqueue(&leaf, 1, 300_000, web()).await.unwrap();
        f.queue.enqueue(&leaf, 1, 600_000, web()).await.unwrap();

        f.clock.set(400_000);
        let summary = f.driver.rollup(&AgentRollupId::parse("a").unwrap()).await;
        assert_eq!(summary.buckets_rolled_up, 1);
        assert_eq!(f.queue.count(&leaf, 1).await.unwrap(), 1);

        f.clock.set(700_000);
        f.driver.rollup(&AgentRollupId::parse("a").unwrap()).await;
        assert_eq!(f.queue.count(&leaf, 1).await.unwrap(), 0);
        assert_eq!(f.store.row_count(MetricKind::Aggregate, 1), 2);
    }

    #[tokio::test]
    async fn coarser_level_waits_for_pending_finer_bucket() {
        let f = fixture();
        let leaf = Partition::new(MetricKind::Aggregate, "a");
        write_leaf_row(&f, "a", 60_000).await;
        f.queue.enqueue(&leaf, 1, 300_000, web()).await.unwrap();
        f.queue.enqueue(&leaf, 2, 1_800_000, web()).await.unwrap();

        f.clock.set(10_000_000);
        f.store.faults().fail_reads(1);
        let summary = f.driver.rollup(&AgentRollupId::parse("a").unwrap()).await;
        assert_eq!(summary.failed_buckets, 1);
        assert_eq!(f.queue.count(&leaf, 1).await.unwrap(), 1);
        assert_eq!(f.queue.count(&leaf, 2).await.unwrap(), 1);
        assert_eq!(f.store.row_count(MetricKind::Aggregate, 2), 0);

        let summary = f.driver.rollup(&AgentRollupId::parse("a").unwrap()).await;
        assert!(summary.is_clean());
        assert_eq!(f.queue.count(&leaf, 2).await.unwrap(), 0);
        let level2 = f
            .store
            .read_aggregates(2, "a", "Web", &NameFilter::Overall, 0, 1_800_000)
            .await
            .unwrap();
        assert_eq!(level2[0].aggregate.transaction_count, 1);
    }

    #[tokio::test]
    async fn ancestor_builds_level_zero_from_children_then_cascades() {
        let f = fixture();
        f.store.touch_agent_rollup("g::", None, 60_000).await.unwrap();
        f.store.touch_agent_rollup("g::a", Some("g::"), 60_000).await.unwrap();
        write_leaf_row(&f, "g::a", 60_000).await;
        let parent = Partition::new(MetricKind::Aggregate, "g::");
        f.queue.enqueue(&parent, 0, 60_000, web()).await.unwrap();

        f.clock.set(20_000_000);
        let summary = f.driver.rollup(&AgentRollupId::parse("g::").unwrap()).await;
        assert!(summary.is_clean());
        assert_eq!(summary.agent_rollups, 2);

        for level in 0..4 {
            assert_eq!(f.queue.count(&parent, level).await.unwrap(), 0, "level {level}");
        }
        let level3 = f
            .store
            .read_aggregates(3, "g::", "Web", &NameFilter::Overall, 0, 14_400_000)
            .await
            .unwrap();
        assert_eq!(level3.len(), 1);
        assert_eq!(level3[0].aggregate.transaction_count, 1);
    }

    #[tokio::test]
    async fn empty_bucket_is_retired() {
        let f = fixture();
        let leaf = Partition::new(MetricKind::Gauge, "a");
        f.queue.enqueue(&leaf, 1, 300_000, BTreeSet::from(["heap".to_string()])).await.unwrap();
        f.clock.set(1_000_000);
        let summary = f.driver.rollup(&AgentRollupId::parse("a").unwrap()).await;
        assert_eq!(summary.empty_buckets, 1);
        assert_eq!(f.queue.count(&leaf, 1).await.unwrap(), 0);
    }
}
