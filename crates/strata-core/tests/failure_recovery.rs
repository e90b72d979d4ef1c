//! Failure handling on the rollup path: transient storage errors, corrupt
//! payloads, stale queue tokens and replays after a crash.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::TryStreamExt;
use strata_core::{
    AggregateQuery, IncomingAggregate, ManualClock, MetricsRepository, NeedsRollupQueue,
    Partition, Profile, ProfileNode, ProfileThread, RetireOutcome, RollupError, StorageGate,
    StrataConfig,
};
use strata_store::{
    AggregateStore, BlobStore, CappedBlobStore, MemoryRollupStore, MetricKind, NameFilter,
};

const DAY: i64 = 86_400_000;

struct Harness {
    repo: MetricsRepository,
    store: Arc<MemoryRollupStore>,
    blobs: Arc<CappedBlobStore>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryRollupStore::new());
    let blobs = Arc::new(CappedBlobStore::new(1 << 20));
    let clock = Arc::new(ManualClock::new(0));
    let repo = MetricsRepository::new(
        store.clone(),
        blobs.clone(),
        &StrataConfig::default(),
        clock.clone(),
    )
    .unwrap();
    Harness {
        repo,
        store,
        blobs,
        clock,
    }
}

fn web(to: i64, level: usize) -> AggregateQuery {
    AggregateQuery {
        agent_rollup_id: "agent".to_string(),
        transaction_type: "Web".to_string(),
        transaction_name: None,
        from: 0,
        to,
        rollup_level: level,
    }
}

fn aggregate(count: u64) -> IncomingAggregate {
    let mut agg = IncomingAggregate::overall("Web");
    agg.total_duration_nanos = 100.0 * count as f64;
    agg.transaction_count = count;
    agg
}

fn profiled(count: u64) -> IncomingAggregate {
    let mut agg = aggregate(count);
    agg.main_thread_profile = Some(Profile {
        roots: vec![ProfileNode {
            frame: "main".to_string(),
            sample_count: count,
            children: vec![],
        }],
    });
    agg
}

#[tokio::test]
async fn transient_failure_leaves_bucket_pending_until_next_pass() {
    let h = harness();
    h.repo.store_aggregates("agent", 60_000, vec![aggregate(2)]).await.unwrap();
    h.clock.set(DAY);

    h.store.faults().fail_reads(1);
    let summary = h.repo.rollup("agent").await.unwrap();
    assert_eq!(summary.failed_buckets, 1);
    assert_eq!(summary.buckets_rolled_up, 0);
    assert_eq!(
        h.repo.pending_backlog(MetricKind::Aggregate, "agent").await.unwrap(),
        vec![0, 1, 1, 1]
    );
    assert_eq!(h.store.row_count(MetricKind::Aggregate, 1), 0);

    // Ingest keeps working while rollups fail.
    h.repo.store_aggregates("agent", 120_000, vec![aggregate(1)]).await.unwrap();

    let summary = h.repo.rollup("agent").await.unwrap();
    assert!(summary.is_clean());
    assert_eq!(
        h.repo.pending_backlog(MetricKind::Aggregate, "agent").await.unwrap(),
        vec![0, 0, 0, 0]
    );
    let rolled = h.repo.read_summary(&web(300_000, 1)).await.unwrap();
    assert_eq!(rolled.transaction_count, 3);
}

#[tokio::test]
async fn failed_write_commits_nothing() {
    let h = harness();
    h.repo.store_aggregates("agent", 60_000, vec![aggregate(1)]).await.unwrap();
    h.clock.set(DAY);
    h.store.faults().fail_writes(1);

    let summary = h.repo.rollup("agent").await.unwrap();
    assert_eq!(summary.failed_buckets, 1);
    assert_eq!(h.store.row_count(MetricKind::Aggregate, 1), 0);

    h.repo.rollup("agent").await.unwrap();
    assert_eq!(h.store.row_count(MetricKind::Aggregate, 1), 1);
}

#[tokio::test]
async fn corrupt_profile_keeps_bucket_in_backlog() {
    let h = harness();
    h.repo.store_aggregates("agent", 60_000, vec![profiled(3)]).await.unwrap();
    let rows = h
        .store
        .read_aggregates(0, "agent", "Web", &NameFilter::Overall, 0, 60_000)
        .await
        .unwrap();
    let blob = rows[0].aggregate.main_thread_profile.unwrap();
    // One well-formed frame whose message is not a profile node.
    let mut bytes = 5u32.to_be_bytes().to_vec();
    bytes.extend_from_slice(b"bogus");
    assert!(h.blobs.corrupt(blob, bytes));

    h.clock.set(DAY);
    for _ in 0..2 {
        let summary = h.repo.rollup("agent").await.unwrap();
        assert_eq!(summary.failed_buckets, 1);
    }
    let backlog = h
        .repo
        .pending_backlog(MetricKind::Aggregate, "agent")
        .await
        .unwrap();
    assert_eq!(backlog[1], 1);
    // The coarser levels wait behind the failed bucket.
    assert_eq!(h.store.row_count(MetricKind::Aggregate, 2), 0);

    let err = h
        .repo
        .merge_profiles(&web(60_000, 0), ProfileThread::Main)
        .await
        .unwrap_err();
    assert!(matches!(err, RollupError::CorruptPayload { .. }));
}

#[tokio::test]
async fn failed_bucket_stays_visible_behind_a_rolled_up_one() {
    let h = harness();
    h.repo.store_aggregates("agent", 60_000, vec![profiled(3)]).await.unwrap();
    let rows = h
        .store
        .read_aggregates(0, "agent", "Web", &NameFilter::Overall, 0, 60_000)
        .await
        .unwrap();
    let blob = rows[0].aggregate.main_thread_profile.unwrap();
    let mut bytes = 5u32.to_be_bytes().to_vec();
    bytes.extend_from_slice(b"bogus");
    assert!(h.blobs.corrupt(blob, bytes));
    h.repo.store_aggregates("agent", 360_000, vec![aggregate(2)]).await.unwrap();

    h.clock.set(1_000_000);
    let summary = h.repo.rollup("agent").await.unwrap();
    assert_eq!(summary.failed_buckets, 1);
    assert_eq!(summary.buckets_rolled_up, 1);

    let raw = h.repo.read_summary(&web(600_000, 0)).await.unwrap();
    let rolled = h.repo.read_summary(&web(600_000, 1)).await.unwrap();
    assert_eq!(raw.transaction_count, 5);
    assert_eq!(rolled.transaction_count, raw.transaction_count);
    assert_eq!(rolled.total_duration_nanos, raw.total_duration_nanos);
}

#[tokio::test]
async fn evicted_profiles_are_skipped_not_fatal() {
    let store = Arc::new(MemoryRollupStore::new());
    let blobs = Arc::new(CappedBlobStore::new(120));
    let clock = Arc::new(ManualClock::new(0));
    let repo = MetricsRepository::new(
        store.clone(),
        blobs.clone(),
        &StrataConfig::default(),
        clock.clone(),
    )
    .unwrap();
    for ct in [60_000, 120_000, 180_000] {
        repo.store_aggregates("agent", ct, vec![profiled(1)]).await.unwrap();
    }
    assert!(blobs.smallest_non_expired_id().await.unwrap().0 > 1);

    clock.set(DAY);
    let summary = repo.rollup("agent").await.unwrap();
    assert!(summary.is_clean(), "{summary:?}");
    let merged = repo
        .merge_profiles(&web(14_400_000, 3), ProfileThread::Both)
        .await
        .unwrap();
    assert!(merged.sample_count() >= 1);
    assert!(merged.sample_count() < 3);
}

#[tokio::test]
async fn stale_token_retire_is_a_no_op() {
    let h = harness();
    h.repo.store_aggregates("agent", 60_000, vec![aggregate(1)]).await.unwrap();

    let queue = NeedsRollupQueue::new(h.store.clone(), StorageGate::default());
    let partition = Partition::new(MetricKind::Aggregate, "agent");
    let entries: Vec<_> = queue
        .list_pending(&partition, 1, i64::MAX)
        .try_collect()
        .await
        .unwrap();
    let entry = entries.into_iter().next().unwrap();

    // A second flush for the same bucket lands while a worker holds the entry.
    h.repo.store_aggregates("agent", 120_000, vec![aggregate(4)]).await.unwrap();
    let handled: BTreeSet<String> = entry.pending_sub_keys.clone();
    assert_eq!(queue.retire(&entry, &handled).await.unwrap(), RetireOutcome::Stale);
    assert_eq!(queue.count(&partition, 1).await.unwrap(), 1);

    h.clock.set(DAY);
    h.repo.rollup("agent").await.unwrap();
    let rolled = h.repo.read_summary(&web(300_000, 1)).await.unwrap();
    assert_eq!(rolled.transaction_count, 5);
}

#[tokio::test]
async fn replay_after_crash_does_not_double_count() {
    let h = harness();
    for ct in [60_000, 120_000] {
        h.repo.store_aggregates("agent", ct, vec![aggregate(1)]).await.unwrap();
    }
    h.clock.set(DAY);
    h.repo.rollup("agent").await.unwrap();
    let first = h.repo.read_summary(&web(1_800_000, 2)).await.unwrap();

    // Simulate a crash between writing the rows and retiring the entries.
    let queue = NeedsRollupQueue::new(h.store.clone(), StorageGate::default());
    let partition = Partition::new(MetricKind::Aggregate, "agent");
    let web_key = BTreeSet::from(["Web".to_string()]);
    queue.enqueue(&partition, 1, 300_000, web_key.clone()).await.unwrap();
    queue.enqueue(&partition, 2, 1_800_000, web_key).await.unwrap();

    let summary = h.repo.rollup("agent").await.unwrap();
    assert_eq!(summary.buckets_rolled_up, 2);
    let second = h.repo.read_summary(&web(1_800_000, 2)).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(second.transaction_count, 2);
    assert_eq!(h.store.row_count(MetricKind::Aggregate, 1), 1);
    assert_eq!(h.store.row_count(MetricKind::Aggregate, 2), 1);
}

#[tokio::test]
async fn query_errors_propagate() {
    let h = harness();
    h.repo.store_aggregates("agent", 60_000, vec![aggregate(1)]).await.unwrap();
    h.store.faults().fail_reads(1);
    let err = h.repo.read_summary(&web(60_000, 0)).await.unwrap_err();
    assert!(err.is_transient());
}
