//! Needs-rollup work queue
//!
//! Tracks which bucket boundaries still need compacting, per partition
//! (metric kind + agent rollup id) and level. Every mutation installs a
//! fresh update token; `retire` only applies when the token it read is
//! still current, so a concurrent enqueue or a competing worker makes the
//! retire a no-op and the entry is simply processed again later.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use strata_store::{MetricKind, NeedsRollupRow, RollupStore, StorageError, StorageResult};
use tracing::debug;
use uuid::Uuid;

use crate::gate::{StorageGate, StorageProfile};

/// Entries fetched per store round trip while listing.
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    pub kind: MetricKind,
    pub agent_rollup_id: String,
}

impl Partition {
    pub fn new(kind: MetricKind, agent_rollup_id: impl Into<String>) -> Self {
        Self {
            kind,
            agent_rollup_id: agent_rollup_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeedsRollupEntry {
    pub partition: Partition,
    pub level: usize,
    /// Inclusive end of the bucket.
    pub boundary: i64,
    pub pending_sub_keys: BTreeSet<String>,
    pub update_token: String,
}

impl From<NeedsRollupRow> for NeedsRollupEntry {
    fn from(row: NeedsRollupRow) -> Self {
        Self {
            partition: Partition::new(row.kind, row.agent_rollup_id),
            level: row.level,
            boundary: row.capture_time,
            pending_sub_keys: row.sub_keys,
            update_token: row.token,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireOutcome {
    /// Every pending sub-key was handled; the entry is gone.
    Deleted,
    /// Some sub-keys remain pending under a fresh token.
    Rewritten,
    /// Nothing handled; the entry was left alone.
    Unchanged,
    /// The entry changed since it was read; another writer's view wins.
    Stale,
}

fn new_token() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Clone)]
pub struct NeedsRollupQueue {
    store: Arc<dyn RollupStore>,
    gate: StorageGate,
}

impl NeedsRollupQueue {
    pub fn new(store: Arc<dyn RollupStore>, gate: StorageGate) -> Self {
        Self { store, gate }
    }

    /// Add `sub_keys` to the entry at `(partition, level, boundary)`.
    pub async fn enqueue(
        &self,
        partition: &Partition,
        level: usize,
        boundary: i64,
        sub_keys: BTreeSet<String>,
    ) -> StorageResult<()> {
        if sub_keys.is_empty() {
            return Ok(());
        }
        debug!(
            kind = %partition.kind,
            agent_rollup_id = %partition.agent_rollup_id,
            level,
            capture_time = boundary,
            "enqueue needs rollup"
        );
        self.gate
            .run(
                StorageProfile::Ingest,
                "upsert_needs_rollup",
                self.store.upsert_needs_rollup(
                    partition.kind,
                    level,
                    &partition.agent_rollup_id,
                    boundary,
                    sub_keys,
                    new_token(),
                ),
            )
            .await
    }

    /// Pending entries with boundary `<= up_to`, oldest first.
    ///
    /// Pages through the store lazily; the stream ends after the last page.
    pub fn list_pending(
        &self,
        partition: &Partition,
        level: usize,
        up_to: i64,
    ) -> BoxStream<'static, StorageResult<NeedsRollupEntry>> {
        let store = Arc::clone(&self.store);
        let gate = self.gate.clone();
        let partition = partition.clone();

        stream::try_unfold(Some(i64::MIN), move |after| {
            let store = Arc::clone(&store);
            let gate = gate.clone();
            let partition = partition.clone();
            async move {
                let Some(after) = after else {
                    return Ok::<_, StorageError>(None);
                };
                let rows = gate
                    .run(
                        StorageProfile::Rollup,
                        "read_needs_rollup",
                        store.read_needs_rollup(
                            partition.kind,
                            level,
                            &partition.agent_rollup_id,
                            after,
                            up_to,
                            PAGE_SIZE,
                        ),
                    )
                    .await?;
                if rows.is_empty() {
                    return Ok(None);
                }
                let next = if rows.len() < PAGE_SIZE {
                    None
                } else {
                    rows.last().map(|r| r.capture_time)
                };
                Ok(Some((rows, next)))
            }
        })
        .map_ok(|rows| stream::iter(rows.into_iter().map(|r| Ok(NeedsRollupEntry::from(r)))))
        .try_flatten()
        .boxed()
    }

    /// Oldest pending boundary for `(partition, level)`, if any.
    pub async fn oldest_pending(
        &self,
        partition: &Partition,
        level: usize,
    ) -> StorageResult<Option<i64>> {
        let rows = self
            .gate
            .run(
                StorageProfile::Rollup,
                "read_needs_rollup",
                self.store.read_needs_rollup(
                    partition.kind,
                    level,
                    &partition.agent_rollup_id,
                    i64::MIN,
                    i64::MAX,
                    1,
                ),
            )
            .await?;
        Ok(rows.first().map(|r| r.capture_time))
    }

    /// Retire `handled` sub-keys of `entry`, guarded by its update token.
    pub async fn retire(
        &self,
        entry: &NeedsRollupEntry,
        handled: &BTreeSet<String>,
    ) -> StorageResult<RetireOutcome> {
        if entry.pending_sub_keys.is_disjoint(handled) {
            return Ok(RetireOutcome::Unchanged);
        }
        let remaining: BTreeSet<String> = entry
            .pending_sub_keys
            .difference(handled)
            .cloned()
            .collect();
        let partition = &entry.partition;

        if remaining.is_empty() {
            let applied = self
                .gate
                .run(
                    StorageProfile::Rollup,
                    "delete_needs_rollup_if",
                    self.store.delete_needs_rollup_if(
                        partition.kind,
                        entry.level,
                        &partition.agent_rollup_id,
                        entry.boundary,
                        &entry.update_token,
                    ),
                )
                .await?;
            return Ok(if applied {
                RetireOutcome::Deleted
            } else {
                RetireOutcome::Stale
            });
        }

        let applied = self
            .gate
            .run(
                StorageProfile::Rollup,
                "replace_needs_rollup_if",
                self.store.replace_needs_rollup_if(
                    partition.kind,
                    entry.level,
                    &partition.agent_rollup_id,
                    entry.boundary,
                    &entry.update_token,
                    remaining,
                    new_token(),
                ),
            )
            .await?;
        Ok(if applied {
            RetireOutcome::Rewritten
        } else {
            RetireOutcome::Stale
        })
    }

    /// Pending entries for one partition and level.
    pub async fn count(&self, partition: &Partition, level: usize) -> StorageResult<usize> {
        self.gate
            .run(
                StorageProfile::Interactive,
                "count_needs_rollup",
                self.store
                    .count_needs_rollup(partition.kind, level, &partition.agent_rollup_id),
            )
            .await
    }
}
