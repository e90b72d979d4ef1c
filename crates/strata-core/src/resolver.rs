//! Read-path query resolver
//!
//! Chooses a rollup level for a view and reads a range at that level,
//! stitching in finer data wherever the level has no row yet. A row at
//! capture time `t` covers `(t - interval, t]`; every span of the range not
//! covered by a row (the unrolled tail, or an older bucket still pending) is
//! read from the next finer level, down to level 0. Capture-time windows are
//! `(from, to]` at every level.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use strata_store::{
    AggregateRow, GaugeValueRow, NameFilter, RollupStore, StorageError, TracePointRow,
};
use tracing::debug;

use crate::clock::Clock;
use crate::config::RollupLevels;
use crate::error::Result;
use crate::gate::{StorageGate, StorageProfile};
use crate::watermark::RollupWatermarks;

/// Coarsest level whose view threshold still exceeds the range and whose
/// retention still covers `from`; the coarsest level otherwise.
///
/// An expiration of `0` hours means the level never expires.
pub fn rollup_level_for_view(levels: &RollupLevels, from: i64, to: i64, now: i64) -> usize {
    let range = to - from;
    let age = now - from;
    for level in 0..levels.len().saturating_sub(1) {
        let (Some(current), Some(next)) = (levels.get(level), levels.get(level + 1)) else {
            break;
        };
        let retained = current.expiration_hours == 0 || current.expiration_millis() > age;
        if range < next.view_threshold_millis && retained {
            return level;
        }
    }
    levels.len().saturating_sub(1)
}

/// Keep the latest capture of each `(agent_id, trace_id)`, ordered by capture time.
pub fn dedupe_trace_points(points: Vec<TracePointRow>) -> Vec<TracePointRow> {
    let mut latest: HashMap<(String, String), TracePointRow> = HashMap::new();
    for point in points {
        let key = (point.agent_id.clone(), point.trace_id.clone());
        match latest.get(&key) {
            Some(existing) if existing.capture_time >= point.capture_time => {}
            _ => {
                latest.insert(key, point);
            }
        }
    }
    let mut points: Vec<TracePointRow> = latest.into_values().collect();
    points.sort_by(|a, b| {
        a.capture_time
            .cmp(&b.capture_time)
            .then_with(|| a.trace_id.cmp(&b.trace_id))
    });
    points
}

enum Piece<T> {
    Rows(Vec<T>),
    Span { level: usize, from: i64, to: i64 },
}

/// Split `(lo, hi]` into the coarse rows read at `level` and the spans
/// between them that no coarse bucket covers. A missing bucket (no data, or
/// still pending behind a failed rollup) is read from the next finer level.
fn cover<T, C>(
    part: Vec<T>,
    level: usize,
    interval: i64,
    lo: i64,
    hi: i64,
    capture_time: &C,
) -> Vec<Piece<T>>
where
    C: Fn(&T) -> i64,
{
    let mut pieces = Vec::new();
    let mut run = Vec::new();
    let mut covered = lo;
    for row in part {
        let ct = capture_time(&row);
        let bucket_start = ct - interval;
        if bucket_start > covered {
            if !run.is_empty() {
                pieces.push(Piece::Rows(std::mem::take(&mut run)));
            }
            pieces.push(Piece::Span {
                level: level - 1,
                from: covered,
                to: bucket_start,
            });
        }
        covered = covered.max(ct);
        run.push(row);
    }
    if !run.is_empty() {
        pieces.push(Piece::Rows(run));
    }
    if covered < hi {
        pieces.push(Piece::Span {
            level: level - 1,
            from: covered,
            to: hi,
        });
    }
    pieces
}

#[derive(Clone)]
pub struct QueryResolver {
    store: Arc<dyn RollupStore>,
    gate: StorageGate,
    levels: RollupLevels,
    clock: Arc<dyn Clock>,
    watermarks: Arc<RollupWatermarks>,
}

impl QueryResolver {
    pub fn new(
        store: Arc<dyn RollupStore>,
        gate: StorageGate,
        levels: RollupLevels,
        clock: Arc<dyn Clock>,
        watermarks: Arc<RollupWatermarks>,
    ) -> Self {
        Self {
            store,
            gate,
            levels,
            clock,
            watermarks,
        }
    }

    pub fn levels(&self) -> &RollupLevels {
        &self.levels
    }

    pub fn rollup_level_for_view(&self, from: i64, to: i64) -> usize {
        rollup_level_for_view(&self.levels, from, to, self.clock.now_millis())
    }

    /// Aggregate rows for `(from, to]` starting at `level`.
    pub async fn read_aggregates(
        &self,
        agent_rollup_id: &str,
        transaction_type: &str,
        names: &NameFilter,
        from: i64,
        to: i64,
        level: usize,
    ) -> Result<Vec<AggregateRow>> {
        self.stitch(level, from, to, |r: &AggregateRow| r.capture_time, |l, lo, hi| {
            self.gate.run(
                StorageProfile::Interactive,
                "read_aggregates",
                self.store
                    .read_aggregates(l, agent_rollup_id, transaction_type, names, lo, hi),
            )
        })
        .await
    }

    /// Gauge rows for `(from, to]` starting at `level`.
    pub async fn read_gauge_values(
        &self,
        agent_rollup_id: &str,
        gauge_name: &str,
        from: i64,
        to: i64,
        level: usize,
    ) -> Result<Vec<GaugeValueRow>> {
        self.stitch(level, from, to, |r: &GaugeValueRow| r.capture_time, |l, lo, hi| {
            self.gate.run(
                StorageProfile::Interactive,
                "read_gauge_values",
                self.store
                    .read_gauge_values(l, agent_rollup_id, gauge_name, lo, hi),
            )
        })
        .await
    }

    async fn stitch<T, C, R, Fut>(
        &self,
        level: usize,
        from: i64,
        to: i64,
        capture_time: C,
        read: R,
    ) -> Result<Vec<T>>
    where
        C: Fn(&T) -> i64,
        R: Fn(usize, i64, i64) -> Fut,
        Fut: Future<Output = std::result::Result<Vec<T>, StorageError>>,
    {
        if level >= self.levels.len() {
            return Err(StorageError::UnknownRollupLevel { level }.into());
        }
        let mut rows = Vec::new();
        // Pieces are popped in capture-time order.
        let mut pending = vec![Piece::Span {
            level,
            from,
            to,
        }];
        while let Some(piece) = pending.pop() {
            let (current, lo, hi) = match piece {
                Piece::Rows(part) => {
                    rows.extend(part);
                    continue;
                }
                Piece::Span { level, from, to } => (level, from, to),
            };
            if lo >= hi {
                continue;
            }
            if current == 0 {
                rows.extend(read(0, lo, hi).await?);
                continue;
            }
            if let Some(mark) = self.watermarks.get(current) {
                if lo >= mark {
                    debug!(level = current, cursor = lo, mark, "range is past rolled up data");
                    pending.push(Piece::Span {
                        level: current - 1,
                        from: lo,
                        to: hi,
                    });
                    continue;
                }
            }
            let interval = self
                .levels
                .get(current)
                .map(|l| l.interval_millis)
                .ok_or(StorageError::UnknownRollupLevel { level: current })?;
            let part = read(current, lo, hi).await?;
            let pieces = cover(part, current, interval, lo, hi, &capture_time);
            pending.extend(pieces.into_iter().rev());
        }
        Ok(rows)
    }

    /// Trace points in `(from, to]`, deduplicated by trace identity.
    pub async fn read_trace_points(
        &self,
        agent_rollup_id: &str,
        transaction_type: &str,
        transaction_name: Option<&str>,
        from: i64,
        to: i64,
    ) -> Result<Vec<TracePointRow>> {
        let points = self
            .gate
            .run(
                StorageProfile::Interactive,
                "read_trace_points",
                self.store.read_trace_points(
                    agent_rollup_id,
                    transaction_type,
                    transaction_name,
                    from,
                    to,
                ),
            )
            .await?;
        Ok(dedupe_trace_points(points))
    }
}
