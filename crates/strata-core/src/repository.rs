//! Metrics repository: the ingest, query and rollup entry points
//!
//! Ingest writes level-0 rows, queues every coarser level (and the parent's
//! level 0), and refreshes the registry for the agent and all ancestors.
//! Queries route through [`QueryResolver`] so the not yet rolled up tail is
//! always included. Rollup failures never surface on the ingest path.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use strata_store::{
    AggregateRow, BlobStore, GaugeValueRow, MetricKind, NameFilter, QueryEntry, RollupStore,
    ServiceCallEntry, StoredAggregate, TracePointRow,
};
use tracing::{debug, instrument, warn};

use crate::agent_rollup::AgentRollupId;
use crate::cascade::{CascadeDriver, RollupSummary};
use crate::clock::Clock;
use crate::config::{RollupLevels, StrataConfig};
use crate::engine::RollupEngine;
use crate::error::Result;
use crate::gate::{StorageGate, StorageProfile};
use crate::merge::AggregateMerger;
use crate::metrics::METRICS;
use crate::model::{
    AggregateQuery, GaugeValue, IncomingAggregate, IncomingQuery, OverviewPoint, PercentileSummary,
    PercentileValue, ProfileThread, ThroughputPoint, TracePoint, TracePointPage,
    TransactionSummary, QUERY_TEXT_TRUNCATE,
};
use crate::obs;
use crate::profile::{self, Profile};
use crate::rate_limiter::RateLimiter;
use crate::resolver::QueryResolver;
use crate::watermark::RollupWatermarks;
use crate::work_queue::{NeedsRollupQueue, Partition};

type NameKey = (MetricKind, String, String);

pub struct MetricsRepository {
    store: Arc<dyn RollupStore>,
    blobs: Arc<dyn BlobStore>,
    gate: StorageGate,
    levels: RollupLevels,
    queue: NeedsRollupQueue,
    cascade: CascadeDriver,
    resolver: QueryResolver,
    query_text_limiter: RateLimiter<String>,
    name_limiter: RateLimiter<NameKey>,
}

impl MetricsRepository {
    pub fn new(
        store: Arc<dyn RollupStore>,
        blobs: Arc<dyn BlobStore>,
        config: &StrataConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let levels = config.rollup_levels()?;
        let gate = StorageGate::from_config(config);
        let watermarks = Arc::new(RollupWatermarks::new(levels.len()));
        let queue = NeedsRollupQueue::new(Arc::clone(&store), gate.clone());
        let engine = RollupEngine::new(Arc::clone(&store), Arc::clone(&blobs), gate.clone());
        let cascade = CascadeDriver::new(
            Arc::clone(&store),
            queue.clone(),
            engine,
            gate.clone(),
            levels.clone(),
            Arc::clone(&clock),
            config.rollup_delay_millis,
            Arc::clone(&watermarks),
        );
        let resolver = QueryResolver::new(
            Arc::clone(&store),
            gate.clone(),
            levels.clone(),
            Arc::clone(&clock),
            watermarks,
        );
        let window = config.rate_limit_window();
        Ok(Self {
            store,
            blobs,
            gate,
            levels,
            queue,
            cascade,
            resolver,
            query_text_limiter: RateLimiter::new(window, Arc::clone(&clock)),
            name_limiter: RateLimiter::new(window, clock),
        })
    }

    pub fn levels(&self) -> &RollupLevels {
        &self.levels
    }

    // -----------------------------------------------------------------------
    // Ingest
    // -----------------------------------------------------------------------

    /// Persist one agent flush of aggregates at `capture_time`.
    #[instrument(skip(self, aggregates), fields(rows = aggregates.len()))]
    pub async fn store_aggregates(
        &self,
        agent_id: &str,
        capture_time: i64,
        aggregates: Vec<IncomingAggregate>,
    ) -> Result<()> {
        let agent = AgentRollupId::parse(agent_id)?;
        if aggregates.is_empty() {
            return self.touch_registry(&agent, capture_time).await;
        }

        let mut rows = Vec::with_capacity(aggregates.len());
        let mut transaction_types = BTreeSet::new();
        for incoming in aggregates {
            transaction_types.insert(incoming.transaction_type.clone());
            rows.push(self.to_row(&agent, capture_time, incoming).await?);
        }
        let row_count = rows.len();
        self.gate
            .run(
                StorageProfile::Ingest,
                "write_aggregates",
                self.store.write_aggregates(0, rows),
            )
            .await?;

        self.enqueue_ingested(&agent, MetricKind::Aggregate, capture_time, &transaction_types)
            .await?;
        self.touch_registry(&agent, capture_time).await?;
        self.record_names(&agent, MetricKind::Aggregate, &transaction_types)
            .await?;

        METRICS.add_rows_ingested(row_count as u64);
        obs::emit_ingest_stored(agent.as_str(), capture_time, row_count);
        Ok(())
    }

    async fn to_row(
        &self,
        agent: &AgentRollupId,
        capture_time: i64,
        incoming: IncomingAggregate,
    ) -> Result<AggregateRow> {
        let mut queries = Vec::with_capacity(incoming.queries.len());
        for query in incoming.queries {
            queries.push(self.store_query(query).await?);
        }
        let main_thread_profile = match &incoming.main_thread_profile {
            Some(p) => profile::write_profile(self.blobs.as_ref(), p).await?,
            None => None,
        };
        let aux_thread_profile = match &incoming.aux_thread_profile {
            Some(p) => profile::write_profile(self.blobs.as_ref(), p).await?,
            None => None,
        };
        Ok(AggregateRow {
            agent_rollup_id: agent.as_str().to_string(),
            transaction_type: incoming.transaction_type,
            transaction_name: incoming.transaction_name,
            capture_time,
            aggregate: StoredAggregate {
                total_duration_nanos: incoming.total_duration_nanos,
                transaction_count: incoming.transaction_count,
                error_count: incoming.error_count,
                async_transactions: incoming.async_transactions,
                main_thread_root_timers: incoming.main_thread_root_timers,
                aux_thread_root_timers: incoming.aux_thread_root_timers,
                async_timers: incoming.async_timers,
                main_thread_stats: incoming.main_thread_stats,
                aux_thread_stats: incoming.aux_thread_stats,
                duration_histogram: incoming.duration_histogram.encode()?,
                queries,
                service_calls: incoming.service_calls,
                main_thread_profile,
                aux_thread_profile,
            },
        })
    }

    /// Truncate long query text, writing the full text under its digest at
    /// most once per rate-limit window.
    async fn store_query(&self, query: IncomingQuery) -> Result<QueryEntry> {
        let (truncated_text, full_text_sha) =
            if query.text.chars().count() > QUERY_TEXT_TRUNCATE {
                let sha = hex::encode(Sha256::digest(query.text.as_bytes()));
                if self.query_text_limiter.try_acquire(sha.clone()) {
                    let written = self
                        .gate
                        .run(
                            StorageProfile::Ingest,
                            "write_full_query_text",
                            self.store.write_full_query_text(&sha, &query.text),
                        )
                        .await;
                    if let Err(e) = written {
                        self.query_text_limiter.invalidate(&sha);
                        return Err(e.into());
                    }
                } else {
                    METRICS.inc_rate_limited_writes();
                }
                let truncated: String = query.text.chars().take(QUERY_TEXT_TRUNCATE).collect();
                (truncated, Some(sha))
            } else {
                (query.text, None)
            };
        Ok(QueryEntry {
            query_type: query.query_type,
            truncated_text,
            full_text_sha,
            total_duration_nanos: query.total_duration_nanos,
            execution_count: query.execution_count,
            total_rows: query.total_rows,
        })
    }

    /// Persist gauge samples reported by one agent.
    #[instrument(skip(self, values), fields(rows = values.len()))]
    pub async fn store_gauge_values(&self, agent_id: &str, values: Vec<GaugeValue>) -> Result<()> {
        let agent = AgentRollupId::parse(agent_id)?;
        let Some(latest) = values.iter().map(|v| v.capture_time).max() else {
            return Ok(());
        };

        let mut by_capture_time: BTreeMap<i64, BTreeSet<String>> = BTreeMap::new();
        let rows: Vec<GaugeValueRow> = values
            .into_iter()
            .map(|v| {
                by_capture_time
                    .entry(v.capture_time)
                    .or_default()
                    .insert(v.gauge_name.clone());
                GaugeValueRow {
                    agent_rollup_id: agent.as_str().to_string(),
                    gauge_name: v.gauge_name,
                    capture_time: v.capture_time,
                    value: v.value,
                    weight: v.weight,
                }
            })
            .collect();
        let row_count = rows.len();
        self.gate
            .run(
                StorageProfile::Ingest,
                "write_gauge_values",
                self.store.write_gauge_values(0, rows),
            )
            .await?;

        let mut all_names = BTreeSet::new();
        for (capture_time, names) in by_capture_time {
            self.enqueue_ingested(&agent, MetricKind::Gauge, capture_time, &names)
                .await?;
            all_names.extend(names);
        }
        self.touch_registry(&agent, latest).await?;
        self.record_names(&agent, MetricKind::Gauge, &all_names).await?;

        METRICS.add_rows_ingested(row_count as u64);
        obs::emit_ingest_stored(agent.as_str(), latest, row_count);
        Ok(())
    }

    /// Persist a trace point under the agent and every ancestor.
    ///
    /// A complete point supersedes earlier partial captures of the same trace;
    /// removing them is best effort, readers deduplicate anyway.
    pub async fn store_trace_point(&self, agent_id: &str, point: TracePoint) -> Result<()> {
        let agent = AgentRollupId::parse(agent_id)?;
        let mut targets = vec![agent.clone()];
        targets.extend(agent.ancestors());

        for target in &targets {
            let row = TracePointRow {
                agent_rollup_id: target.as_str().to_string(),
                agent_id: agent.as_str().to_string(),
                trace_id: point.trace_id.clone(),
                transaction_type: point.transaction_type.clone(),
                transaction_name: point.transaction_name.clone(),
                capture_time: point.capture_time,
                duration_nanos: point.duration_nanos,
                partial: point.partial,
                error: point.error,
            };
            self.gate
                .run(
                    StorageProfile::Ingest,
                    "write_trace_point",
                    self.store.write_trace_point(row),
                )
                .await?;
        }

        if !point.partial {
            for target in &targets {
                let deleted = self
                    .gate
                    .run(
                        StorageProfile::Ingest,
                        "delete_partial_trace_points",
                        self.store.delete_partial_trace_points(
                            target.as_str(),
                            agent.as_str(),
                            &point.trace_id,
                            point.capture_time,
                        ),
                    )
                    .await;
                if let Err(e) = deleted {
                    warn!(
                        agent_rollup_id = %target,
                        trace_id = %point.trace_id,
                        error = %e,
                        "could not remove partial trace points"
                    );
                }
            }
        }
        self.touch_registry(&agent, point.capture_time).await
    }

    /// Queue levels `1..N` for the agent itself and level 0 for its parent.
    async fn enqueue_ingested(
        &self,
        agent: &AgentRollupId,
        kind: MetricKind,
        capture_time: i64,
        keys: &BTreeSet<String>,
    ) -> Result<()> {
        let own = Partition::new(kind, agent.as_str());
        for spec in self.levels.rolled_up() {
            self.queue
                .enqueue(&own, spec.level, spec.boundary_for(capture_time), keys.clone())
                .await?;
        }
        if let Some(parent) = agent.parent() {
            self.queue
                .enqueue(
                    &Partition::new(kind, parent.as_str()),
                    0,
                    self.levels.finest().boundary_for(capture_time),
                    keys.clone(),
                )
                .await?;
        }
        Ok(())
    }

    async fn touch_registry(&self, agent: &AgentRollupId, capture_time: i64) -> Result<()> {
        let mut current = Some(agent.clone());
        while let Some(id) = current {
            let parent = id.parent();
            self.gate
                .run(
                    StorageProfile::Ingest,
                    "touch_agent_rollup",
                    self.store.touch_agent_rollup(
                        id.as_str(),
                        parent.as_ref().map(AgentRollupId::as_str),
                        capture_time,
                    ),
                )
                .await?;
            current = parent;
        }
        Ok(())
    }

    async fn record_names(
        &self,
        agent: &AgentRollupId,
        kind: MetricKind,
        names: &BTreeSet<String>,
    ) -> Result<()> {
        let mut targets = vec![agent.clone()];
        targets.extend(agent.ancestors());
        for target in &targets {
            for name in names {
                let key = (kind, target.as_str().to_string(), name.clone());
                if !self.name_limiter.try_acquire(key.clone()) {
                    METRICS.inc_rate_limited_writes();
                    continue;
                }
                let recorded = self
                    .gate
                    .run(
                        StorageProfile::Ingest,
                        "record_metric_name",
                        self.store.record_metric_name(kind, target.as_str(), name),
                    )
                    .await;
                if let Err(e) = recorded {
                    self.name_limiter.invalidate(&key);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn rollup_level_for_view(&self, from: i64, to: i64) -> usize {
        self.resolver.rollup_level_for_view(from, to)
    }

    async fn read_rows(&self, query: &AggregateQuery) -> Result<Vec<AggregateRow>> {
        self.resolver
            .read_aggregates(
                &query.agent_rollup_id,
                &query.transaction_type,
                &NameFilter::from_name(query.transaction_name.as_deref()),
                query.from,
                query.to,
                query.rollup_level,
            )
            .await
    }

    async fn merged(&self, query: &AggregateQuery) -> Result<AggregateMerger> {
        let rows = self.read_rows(query).await?;
        let mut merger = AggregateMerger::new();
        for row in &rows {
            merger.add(&row.aggregate)?;
        }
        debug!(rows = rows.len(), level = query.rollup_level, "aggregate rows merged");
        Ok(merger)
    }

    pub async fn read_summary(&self, query: &AggregateQuery) -> Result<TransactionSummary> {
        let merger = self.merged(query).await?;
        Ok(TransactionSummary {
            total_duration_nanos: merger.total_duration_nanos(),
            transaction_count: merger.transaction_count(),
            error_count: merger.error_count(),
        })
    }

    /// One point per stored row, oldest first.
    pub async fn read_overview(&self, query: &AggregateQuery) -> Result<Vec<OverviewPoint>> {
        let rows = self.read_rows(query).await?;
        Ok(rows
            .into_iter()
            .map(|row| OverviewPoint {
                capture_time: row.capture_time,
                total_duration_nanos: row.aggregate.total_duration_nanos,
                transaction_count: row.aggregate.transaction_count,
                async_transactions: row.aggregate.async_transactions,
                main_thread_root_timers: row.aggregate.main_thread_root_timers,
                aux_thread_root_timers: row.aggregate.aux_thread_root_timers,
                async_timers: row.aggregate.async_timers,
                main_thread_stats: row.aggregate.main_thread_stats,
                aux_thread_stats: row.aggregate.aux_thread_stats,
            })
            .collect())
    }

    pub async fn read_percentiles(
        &self,
        query: &AggregateQuery,
        percentiles: &[f64],
    ) -> Result<PercentileSummary> {
        let merger = self.merged(query).await?;
        let histogram = merger.histogram();
        Ok(PercentileSummary {
            transaction_count: histogram.count(),
            values: percentiles
                .iter()
                .map(|p| PercentileValue {
                    percentile: *p,
                    value_nanos: histogram.value_at_percentile(*p),
                })
                .collect(),
        })
    }

    pub async fn read_throughput(&self, query: &AggregateQuery) -> Result<Vec<ThroughputPoint>> {
        let rows = self.read_rows(query).await?;
        Ok(rows
            .iter()
            .map(|row| ThroughputPoint {
                capture_time: row.capture_time,
                transaction_count: row.aggregate.transaction_count,
                error_count: row.aggregate.error_count,
            })
            .collect())
    }

    /// Merge every live profile referenced in the range.
    pub async fn merge_profiles(
        &self,
        query: &AggregateQuery,
        thread: ProfileThread,
    ) -> Result<Profile> {
        let rows = self.read_rows(query).await?;
        let ids: Vec<_> = rows
            .iter()
            .flat_map(|row| {
                let main = matches!(thread, ProfileThread::Main | ProfileThread::Both)
                    .then_some(row.aggregate.main_thread_profile)
                    .flatten();
                let aux = matches!(thread, ProfileThread::Aux | ProfileThread::Both)
                    .then_some(row.aggregate.aux_thread_profile)
                    .flatten();
                main.into_iter().chain(aux)
            })
            .collect();
        profile::merge_profiles(&self.blobs, &ids).await
    }

    /// Queries merged over the range, slowest total first.
    pub async fn merge_queries(&self, query: &AggregateQuery) -> Result<Vec<QueryEntry>> {
        let merger = self.merged(query).await?;
        let mut queries: Vec<QueryEntry> = merger.queries().cloned().collect();
        queries.sort_by(|a, b| b.total_duration_nanos.total_cmp(&a.total_duration_nanos));
        Ok(queries)
    }

    /// Service calls merged over the range, slowest total first.
    pub async fn merge_service_calls(
        &self,
        query: &AggregateQuery,
    ) -> Result<Vec<ServiceCallEntry>> {
        let merger = self.merged(query).await?;
        let mut calls: Vec<ServiceCallEntry> = merger.service_calls().cloned().collect();
        calls.sort_by(|a, b| b.total_duration_nanos.total_cmp(&a.total_duration_nanos));
        Ok(calls)
    }

    pub async fn read_full_query_text(&self, sha: &str) -> Result<Option<String>> {
        Ok(self
            .gate
            .run(
                StorageProfile::Interactive,
                "read_full_query_text",
                self.store.read_full_query_text(sha),
            )
            .await?)
    }

    pub async fn read_gauge_values(
        &self,
        agent_rollup_id: &str,
        gauge_name: &str,
        from: i64,
        to: i64,
        rollup_level: usize,
    ) -> Result<Vec<GaugeValueRow>> {
        self.resolver
            .read_gauge_values(agent_rollup_id, gauge_name, from, to, rollup_level)
            .await
    }

    /// Deduplicated trace points in `(from, to]`, oldest first, at most `limit`.
    pub async fn read_trace_points(
        &self,
        agent_rollup_id: &str,
        transaction_type: &str,
        transaction_name: Option<&str>,
        from: i64,
        to: i64,
        limit: usize,
    ) -> Result<TracePointPage> {
        let mut points = self
            .resolver
            .read_trace_points(agent_rollup_id, transaction_type, transaction_name, from, to)
            .await?;
        let truncated = points.len() > limit;
        points.truncate(limit);
        Ok(TracePointPage { points, truncated })
    }

    pub async fn read_transaction_types(&self, agent_rollup_id: &str) -> Result<Vec<String>> {
        self.metric_names(MetricKind::Aggregate, agent_rollup_id).await
    }

    pub async fn read_gauge_names(&self, agent_rollup_id: &str) -> Result<Vec<String>> {
        self.metric_names(MetricKind::Gauge, agent_rollup_id).await
    }

    async fn metric_names(&self, kind: MetricKind, agent_rollup_id: &str) -> Result<Vec<String>> {
        Ok(self
            .gate
            .run(
                StorageProfile::Interactive,
                "metric_names",
                self.store.metric_names(kind, agent_rollup_id),
            )
            .await?)
    }

    // -----------------------------------------------------------------------
    // Rollup
    // -----------------------------------------------------------------------

    /// Cascade `agent_rollup_id` and everything registered below it.
    pub async fn rollup(&self, agent_rollup_id: &str) -> Result<RollupSummary> {
        let root = AgentRollupId::parse(agent_rollup_id)?;
        Ok(self.cascade.rollup(&root).await)
    }

    pub async fn rollup_all(&self) -> Result<RollupSummary> {
        self.cascade.rollup_all().await
    }

    /// Pending queue entries per level, index = level.
    pub async fn pending_backlog(
        &self,
        kind: MetricKind,
        agent_rollup_id: &str,
    ) -> Result<Vec<usize>> {
        let partition = Partition::new(kind, agent_rollup_id);
        let mut backlog = Vec::with_capacity(self.levels.len());
        for level in 0..self.levels.len() {
            backlog.push(self.queue.count(&partition, level).await?);
        }
        Ok(backlog)
    }

    /// Drop expired rate-limiter keys; returns how many were removed.
    pub fn purge_rate_limiters(&self) -> usize {
        self.query_text_limiter.purge_expired() + self.name_limiter.purge_expired()
    }
}
