//! SurrealDB-backed column store
//!
//! Implements every trait bundled in [`RollupStore`]. Rows are stored under
//! record ids derived from their key, so writes are overwrites and the
//! needs-rollup conditional delete/replace are single-record statements
//! guarded by `WHERE token = $expected`.
//!
//! DB row structs (`Db*`) convert to/from `schema` types at the boundary.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::handle;
use crate::schema::*;
use crate::storage_traits::*;

/// Rows per batched write statement.
const WRITE_CHUNK: usize = 100;

/// SurrealDB-backed implementation of the column-store traits.
#[derive(Clone)]
pub struct SurrealRollupStore {
    db: Surreal<Any>,
}

fn record_key(parts: &[&str]) -> String {
    serde_json::to_string(parts).unwrap_or_else(|_| parts.join("|"))
}

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

// -- DB rows -----------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbAggregate {
    agent_rollup_id: String,
    transaction_type: String,
    /// Empty for the overall row.
    transaction_name: String,
    capture_time: i64,
    /// JSON-encoded `StoredAggregate`.
    payload: String,
}

impl DbAggregate {
    fn from_row(row: &AggregateRow) -> StorageResult<Self> {
        Ok(Self {
            agent_rollup_id: row.agent_rollup_id.clone(),
            transaction_type: row.transaction_type.clone(),
            transaction_name: row.transaction_name.clone().unwrap_or_default(),
            capture_time: row.capture_time,
            payload: serde_json::to_string(&row.aggregate)?,
        })
    }

    fn key(&self) -> String {
        record_key(&[
            &self.agent_rollup_id,
            &self.transaction_type,
            &self.transaction_name,
            &self.capture_time.to_string(),
        ])
    }

    fn into_row(self, table: &str) -> StorageResult<AggregateRow> {
        let aggregate = serde_json::from_str(&self.payload).map_err(|e| StorageError::InvalidRow {
            table: table.to_string(),
            reason: e.to_string(),
        })?;
        Ok(AggregateRow {
            agent_rollup_id: self.agent_rollup_id,
            transaction_type: self.transaction_type,
            transaction_name: (!self.transaction_name.is_empty()).then_some(self.transaction_name),
            capture_time: self.capture_time,
            aggregate,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbGauge {
    agent_rollup_id: String,
    gauge_name: String,
    capture_time: i64,
    value: f64,
    weight: i64,
}

impl From<&GaugeValueRow> for DbGauge {
    fn from(row: &GaugeValueRow) -> Self {
        Self {
            agent_rollup_id: row.agent_rollup_id.clone(),
            gauge_name: row.gauge_name.clone(),
            capture_time: row.capture_time,
            value: row.value,
            weight: row.weight,
        }
    }
}

impl From<DbGauge> for GaugeValueRow {
    fn from(row: DbGauge) -> Self {
        Self {
            agent_rollup_id: row.agent_rollup_id,
            gauge_name: row.gauge_name,
            capture_time: row.capture_time,
            value: row.value,
            weight: row.weight,
        }
    }
}

impl DbGauge {
    fn key(&self) -> String {
        record_key(&[
            &self.agent_rollup_id,
            &self.gauge_name,
            &self.capture_time.to_string(),
        ])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbNeedsRollup {
    kind: String,
    level: i64,
    agent_rollup_id: String,
    capture_time: i64,
    #[serde(default)]
    sub_keys: Vec<String>,
    token: String,
}

impl DbNeedsRollup {
    fn into_row(self) -> StorageResult<NeedsRollupRow> {
        let kind = MetricKind::parse(&self.kind).ok_or_else(|| StorageError::InvalidRow {
            table: "needs_rollup".to_string(),
            reason: format!("unknown kind: {}", self.kind),
        })?;
        let level = usize::try_from(self.level).map_err(|_| StorageError::InvalidRow {
            table: "needs_rollup".to_string(),
            reason: format!("negative level: {}", self.level),
        })?;
        Ok(NeedsRollupRow {
            kind,
            level,
            agent_rollup_id: self.agent_rollup_id,
            capture_time: self.capture_time,
            sub_keys: self.sub_keys.into_iter().collect(),
            token: self.token,
        })
    }
}

fn needs_rollup_key(kind: MetricKind, level: usize, agent_rollup_id: &str, ct: i64) -> String {
    record_key(&[
        kind.as_str(),
        &level.to_string(),
        agent_rollup_id,
        &ct.to_string(),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbAgentRollup {
    agent_rollup_id: String,
    /// Empty for roots.
    parent_id: String,
    last_capture_time: i64,
}

impl From<DbAgentRollup> for AgentRollupRow {
    fn from(row: DbAgentRollup) -> Self {
        Self {
            agent_rollup_id: row.agent_rollup_id,
            parent_id: (!row.parent_id.is_empty()).then_some(row.parent_id),
            last_capture_time: row.last_capture_time,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbMetricName {
    kind: String,
    agent_rollup_id: String,
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbTracePoint {
    agent_rollup_id: String,
    agent_id: String,
    trace_id: String,
    transaction_type: String,
    transaction_name: String,
    capture_time: i64,
    duration_nanos: i64,
    partial: bool,
    error: bool,
}

impl From<TracePointRow> for DbTracePoint {
    fn from(row: TracePointRow) -> Self {
        Self {
            agent_rollup_id: row.agent_rollup_id,
            agent_id: row.agent_id,
            trace_id: row.trace_id,
            transaction_type: row.transaction_type,
            transaction_name: row.transaction_name,
            capture_time: row.capture_time,
            duration_nanos: row.duration_nanos,
            partial: row.partial,
            error: row.error,
        }
    }
}

impl From<DbTracePoint> for TracePointRow {
    fn from(row: DbTracePoint) -> Self {
        Self {
            agent_rollup_id: row.agent_rollup_id,
            agent_id: row.agent_id,
            trace_id: row.trace_id,
            transaction_type: row.transaction_type,
            transaction_name: row.transaction_name,
            capture_time: row.capture_time,
            duration_nanos: row.duration_nanos,
            partial: row.partial,
            error: row.error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbQueryText {
    sha: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct DbCount {
    n: i64,
}

#[derive(Debug, Serialize)]
struct KeyedRow<T> {
    key: String,
    row: T,
}

impl SurrealRollupStore {
    /// Wrap an already-initialized connection.
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `strata/main`, and runs `init_schema`.
    pub async fn in_memory(level_count: usize) -> crate::Result<Self> {
        let db = handle::connect_url("mem://", level_count).await?;
        info!("SurrealRollupStore connected (in-memory)");
        Ok(Self { db })
    }

    /// Create from environment variables.
    ///
    /// Uses the env-var chain of [`handle::connect_from_env`].
    pub async fn from_env(level_count: usize) -> crate::Result<Self> {
        let db = handle::connect_from_env(level_count).await?;
        info!("SurrealRollupStore connected");
        Ok(Self { db })
    }

    // -- private helpers -----------------------------------------------------

    async fn select<T: DeserializeOwned>(
        &self,
        sql: &str,
        binds: Vec<(&'static str, serde_json::Value)>,
    ) -> StorageResult<Vec<T>> {
        let mut query = self.db.query(sql.to_string());
        for bind in binds {
            query = query.bind(bind);
        }
        let mut res = query.await.map_err(backend)?;
        res.take(0).map_err(backend)
    }

    async fn execute(
        &self,
        sql: &str,
        binds: Vec<(&'static str, serde_json::Value)>,
    ) -> StorageResult<()> {
        let mut query = self.db.query(sql.to_string());
        for bind in binds {
            query = query.bind(bind);
        }
        query.await.map_err(backend)?.check().map_err(backend)?;
        Ok(())
    }

    async fn upsert_batch<T: Serialize + Send + 'static>(
        &self,
        table: &'static str,
        rows: Vec<KeyedRow<T>>,
    ) -> StorageResult<()> {
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            let chunk: Vec<KeyedRow<T>> = rows.by_ref().take(WRITE_CHUNK).collect();
            debug!(table, rows = chunk.len(), "writing batch");
            self.db
                .query("FOR $r IN $rows { UPSERT type::thing($tb, $r.key) CONTENT $r.row; }")
                .bind(("tb", table))
                .bind(("rows", chunk))
                .await
                .map_err(backend)?
                .check()
                .map_err(backend)?;
        }
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for SurrealRollupStore {
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn write_aggregates(&self, level: usize, rows: Vec<AggregateRow>) -> StorageResult<()> {
        let table = aggregate_table(level)?;
        let keyed = rows
            .iter()
            .map(|row| {
                let db = DbAggregate::from_row(row)?;
                Ok(KeyedRow { key: db.key(), row: db })
            })
            .collect::<StorageResult<Vec<_>>>()?;
        self.upsert_batch(table, keyed).await
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
        let table = aggregate_table(level)?;
        let mut binds = vec![
            ("tb", table.into()),
            ("agent", agent_rollup_id.into()),
            ("tt", transaction_type.into()),
            ("from", from.into()),
            ("to", to.into()),
        ];
        let name_clause = match names {
            NameFilter::Overall => " AND transaction_name = ''",
            NameFilter::Named(name) => {
                binds.push(("tn", name.as_str().into()));
                " AND transaction_name = $tn"
            }
            NameFilter::All => "",
        };
        let sql = format!(
            "SELECT * FROM type::table($tb) WHERE agent_rollup_id = $agent \
             AND transaction_type = $tt AND capture_time > $from AND capture_time <= $to\
             {name_clause} ORDER BY capture_time ASC"
        );
        let rows: Vec<DbAggregate> = self.select(&sql, binds).await?;
        rows.into_iter().map(|r| r.into_row(table)).collect()
    }
}

#[async_trait]
impl GaugeStore for SurrealRollupStore {
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn write_gauge_values(
        &self,
        level: usize,
        rows: Vec<GaugeValueRow>,
    ) -> StorageResult<()> {
        let table = gauge_table(level)?;
        let keyed = rows
            .iter()
            .map(|row| {
                let db = DbGauge::from(row);
                KeyedRow { key: db.key(), row: db }
            })
            .collect();
        self.upsert_batch(table, keyed).await
    }

    async fn read_gauge_values(
        &self,
        level: usize,
        agent_rollup_id: &str,
        gauge_name: &str,
        from: i64,
        to: i64,
    ) -> StorageResult<Vec<GaugeValueRow>> {
        let table = gauge_table(level)?;
        let rows: Vec<DbGauge> = self
            .select(
                "SELECT * FROM type::table($tb) WHERE agent_rollup_id = $agent \
                 AND gauge_name = $gauge AND capture_time > $from AND capture_time <= $to \
                 ORDER BY capture_time ASC",
                vec![
                    ("tb", table.into()),
                    ("agent", agent_rollup_id.into()),
                    ("gauge", gauge_name.into()),
                    ("from", from.into()),
                    ("to", to.into()),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(GaugeValueRow::from).collect())
    }
}

#[async_trait]
impl NeedsRollupStore for SurrealRollupStore {
    #[instrument(skip(self, sub_keys, token))]
    async fn upsert_needs_rollup(
        &self,
        kind: MetricKind,
        level: usize,
        agent_rollup_id: &str,
        capture_time: i64,
        sub_keys: BTreeSet<String>,
        token: String,
    ) -> StorageResult<()> {
        let keys: Vec<String> = sub_keys.into_iter().collect();
        self.execute(
            "UPSERT type::thing('needs_rollup', $key) SET kind = $kind, level = $level, \
             agent_rollup_id = $agent, capture_time = $ct, \
             sub_keys = array::union(sub_keys ?? [], $keys), token = $next_token",
            vec![
                ("key", needs_rollup_key(kind, level, agent_rollup_id, capture_time).into()),
                ("kind", kind.as_str().into()),
                ("level", (level as i64).into()),
                ("agent", agent_rollup_id.into()),
                ("ct", capture_time.into()),
                ("keys", keys.into()),
                ("next_token", token.into()),
            ],
        )
        .await
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
        let rows: Vec<DbNeedsRollup> = self
            .select(
                "SELECT * FROM needs_rollup WHERE kind = $kind AND level = $level \
                 AND agent_rollup_id = $agent AND capture_time > $after \
                 AND capture_time <= $up_to ORDER BY capture_time ASC LIMIT $limit",
                vec![
                    ("kind", kind.as_str().into()),
                    ("level", (level as i64).into()),
                    ("agent", agent_rollup_id.into()),
                    ("after", after.into()),
                    ("up_to", up_to.into()),
                    ("limit", (limit as i64).into()),
                ],
            )
            .await?;
        rows.into_iter().map(DbNeedsRollup::into_row).collect()
    }

    async fn delete_needs_rollup_if(
        &self,
        kind: MetricKind,
        level: usize,
        agent_rollup_id: &str,
        capture_time: i64,
        expected_token: &str,
    ) -> StorageResult<bool> {
        let deleted: Vec<DbNeedsRollup> = self
            .select(
                "DELETE type::thing('needs_rollup', $key) WHERE token = $expected RETURN BEFORE",
                vec![
                    ("key", needs_rollup_key(kind, level, agent_rollup_id, capture_time).into()),
                    ("expected", expected_token.into()),
                ],
            )
            .await?;
        Ok(!deleted.is_empty())
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
        let remaining: Vec<String> = remaining.into_iter().collect();
        let updated: Vec<DbNeedsRollup> = self
            .select(
                "UPDATE type::thing('needs_rollup', $key) SET sub_keys = $remaining, \
                 token = $new_token WHERE token = $expected RETURN AFTER",
                vec![
                    ("key", needs_rollup_key(kind, level, agent_rollup_id, capture_time).into()),
                    ("remaining", remaining.into()),
                    ("new_token", new_token.into()),
                    ("expected", expected_token.into()),
                ],
            )
            .await?;
        Ok(!updated.is_empty())
    }

    async fn count_needs_rollup(
        &self,
        kind: MetricKind,
        level: usize,
        agent_rollup_id: &str,
    ) -> StorageResult<usize> {
        let counts: Vec<DbCount> = self
            .select(
                "SELECT count() AS n FROM needs_rollup WHERE kind = $kind AND level = $level \
                 AND agent_rollup_id = $agent GROUP ALL",
                vec![
                    ("kind", kind.as_str().into()),
                    ("level", (level as i64).into()),
                    ("agent", agent_rollup_id.into()),
                ],
            )
            .await?;
        Ok(counts
            .first()
            .map(|c| usize::try_from(c.n).unwrap_or(0))
            .unwrap_or(0))
    }
}

#[async_trait]
impl AgentRollupStore for SurrealRollupStore {
    async fn touch_agent_rollup(
        &self,
        agent_rollup_id: &str,
        parent_id: Option<&str>,
        capture_time: i64,
    ) -> StorageResult<()> {
        self.execute(
            "UPSERT type::thing('agent_rollup', $id) SET agent_rollup_id = $id, \
             parent_id = $parent, \
             last_capture_time = math::max([last_capture_time ?? $ct, $ct])",
            vec![
                ("id", agent_rollup_id.into()),
                ("parent", parent_id.unwrap_or_default().into()),
                ("ct", capture_time.into()),
            ],
        )
        .await
    }

    async fn get_agent_rollup(
        &self,
        agent_rollup_id: &str,
    ) -> StorageResult<Option<AgentRollupRow>> {
        let rows: Vec<DbAgentRollup> = self
            .select(
                "SELECT * FROM agent_rollup WHERE agent_rollup_id = $id",
                vec![("id", agent_rollup_id.into())],
            )
            .await?;
        Ok(rows.into_iter().next().map(AgentRollupRow::from))
    }

    async fn children(&self, parent_id: &str) -> StorageResult<Vec<String>> {
        let rows: Vec<DbAgentRollup> = self
            .select(
                "SELECT * FROM agent_rollup WHERE parent_id = $parent ORDER BY agent_rollup_id",
                vec![("parent", parent_id.into())],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.agent_rollup_id).collect())
    }

    async fn roots(&self) -> StorageResult<Vec<String>> {
        let rows: Vec<DbAgentRollup> = self
            .select(
                "SELECT * FROM agent_rollup WHERE parent_id = '' ORDER BY agent_rollup_id",
                Vec::new(),
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.agent_rollup_id).collect())
    }

    async fn record_metric_name(
        &self,
        kind: MetricKind,
        agent_rollup_id: &str,
        name: &str,
    ) -> StorageResult<()> {
        let row = DbMetricName {
            kind: kind.as_str().to_string(),
            agent_rollup_id: agent_rollup_id.to_string(),
            name: name.to_string(),
        };
        let key = record_key(&[kind.as_str(), agent_rollup_id, name]);
        self.upsert_batch("metric_name", vec![KeyedRow { key, row }])
            .await
    }

    async fn metric_names(
        &self,
        kind: MetricKind,
        agent_rollup_id: &str,
    ) -> StorageResult<Vec<String>> {
        let rows: Vec<DbMetricName> = self
            .select(
                "SELECT * FROM metric_name WHERE kind = $kind AND agent_rollup_id = $agent \
                 ORDER BY name ASC",
                vec![
                    ("kind", kind.as_str().into()),
                    ("agent", agent_rollup_id.into()),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.name).collect())
    }
}

#[async_trait]
impl TracePointStore for SurrealRollupStore {
    async fn write_trace_point(&self, row: TracePointRow) -> StorageResult<()> {
        let db = DbTracePoint::from(row);
        let key = record_key(&[
            &db.agent_rollup_id,
            &db.agent_id,
            &db.trace_id,
            &db.capture_time.to_string(),
        ]);
        self.upsert_batch("trace_point", vec![KeyedRow { key, row: db }])
            .await
    }

    async fn read_trace_points(
        &self,
        agent_rollup_id: &str,
        transaction_type: &str,
        transaction_name: Option<&str>,
        from: i64,
        to: i64,
    ) -> StorageResult<Vec<TracePointRow>> {
        let mut binds = vec![
            ("agent", agent_rollup_id.into()),
            ("tt", transaction_type.into()),
            ("from", from.into()),
            ("to", to.into()),
        ];
        let name_clause = match transaction_name {
            Some(name) => {
                binds.push(("tn", name.into()));
                " AND transaction_name = $tn"
            }
            None => "",
        };
        let sql = format!(
            "SELECT * FROM trace_point WHERE agent_rollup_id = $agent \
             AND transaction_type = $tt AND capture_time > $from AND capture_time <= $to\
             {name_clause} ORDER BY capture_time ASC"
        );
        let rows: Vec<DbTracePoint> = self.select(&sql, binds).await?;
        Ok(rows.into_iter().map(TracePointRow::from).collect())
    }

    async fn delete_partial_trace_points(
        &self,
        agent_rollup_id: &str,
        agent_id: &str,
        trace_id: &str,
        before: i64,
    ) -> StorageResult<()> {
        self.execute(
            "DELETE trace_point WHERE partial = true AND agent_rollup_id = $agent \
             AND agent_id = $agent_id AND trace_id = $trace_id AND capture_time < $before",
            vec![
                ("agent", agent_rollup_id.into()),
                ("agent_id", agent_id.into()),
                ("trace_id", trace_id.into()),
                ("before", before.into()),
            ],
        )
        .await
    }
}

#[async_trait]
impl QueryTextStore for SurrealRollupStore {
    async fn write_full_query_text(&self, sha: &str, text: &str) -> StorageResult<()> {
        let row = DbQueryText {
            sha: sha.to_string(),
            text: text.to_string(),
        };
        self.upsert_batch(
            "full_query_text",
            vec![KeyedRow {
                key: sha.to_string(),
                row,
            }],
        )
        .await
    }

    async fn read_full_query_text(&self, sha: &str) -> StorageResult<Option<String>> {
        let rows: Vec<DbQueryText> = self
            .select(
                "SELECT * FROM full_query_text WHERE sha = $sha",
                vec![("sha", sha.into())],
            )
            .await?;
        Ok(rows.into_iter().next().map(|r| r.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keys_do_not_collide_on_separators() {
        assert_ne!(record_key(&["a|b", "c"]), record_key(&["a", "b|c"]));
    }

    #[test]
    fn overall_row_round_trips_through_empty_name() {
        let row = AggregateRow {
            agent_rollup_id: "a".into(),
            transaction_type: "Web".into(),
            transaction_name: None,
            capture_time: 60_000,
            aggregate: StoredAggregate {
                transaction_count: 3,
                ..Default::default()
            },
        };
        let db = DbAggregate::from_row(&row).unwrap();
        assert_eq!(db.transaction_name, "");
        assert_eq!(db.into_row("aggregate_rollup_0").unwrap(), row);
    }
}
