//! Agent rollup hierarchy: leaf data must show up unchanged at every
//! ancestor, and late child data must reach the ancestor on a later pass.

use std::sync::Arc;

use strata_core::{
    AggregateQuery, GaugeValue, IncomingAggregate, ManualClock, MetricsRepository, StrataConfig,
};
use strata_store::{AgentRollupStore, CappedBlobStore, MemoryRollupStore, MetricKind};

const DAY: i64 = 86_400_000;

fn repository() -> (MetricsRepository, Arc<MemoryRollupStore>, Arc<ManualClock>) {
    let store = Arc::new(MemoryRollupStore::new());
    let clock = Arc::new(ManualClock::new(0));
    let repo = MetricsRepository::new(
        store.clone(),
        Arc::new(CappedBlobStore::new(1 << 20)),
        &StrataConfig::default(),
        clock.clone(),
    )
    .unwrap();
    (repo, store, clock)
}

fn web(agent: &str, to: i64, level: usize) -> AggregateQuery {
    AggregateQuery {
        agent_rollup_id: agent.to_string(),
        transaction_type: "Web".to_string(),
        transaction_name: None,
        from: 0,
        to,
        rollup_level: level,
    }
}

fn aggregate(nanos: f64, count: u64, errors: u64) -> IncomingAggregate {
    let mut agg = IncomingAggregate::overall("Web");
    agg.total_duration_nanos = nanos;
    agg.transaction_count = count;
    agg.error_count = errors;
    agg
}

#[tokio::test]
async fn grandparent_matches_leaf_at_every_level() {
    let (repo, _, clock) = repository();
    for (ct, nanos, count, errors) in [
        (60_000, 1_000.0, 2, 0),
        (90_000, 500.0, 1, 1),
        (420_000, 4_000.0, 4, 2),
    ] {
        repo.store_aggregates("gp::p::leaf", ct, vec![aggregate(nanos, count, errors)])
            .await
            .unwrap();
    }
    clock.set(DAY);
    let summary = repo.rollup_all().await.unwrap();
    assert!(summary.is_clean(), "{summary:?}");
    assert_eq!(summary.agent_rollups, 3);

    for level in 0..4 {
        let to = if level == 3 { 14_400_000 } else { 1_800_000 };
        let leaf = repo.read_summary(&web("gp::p::leaf", to, level)).await.unwrap();
        let grandparent = repo.read_summary(&web("gp::", to, level)).await.unwrap();
        assert_eq!(grandparent, leaf, "level {level}");
        assert_eq!(leaf.transaction_count, 7);
        assert_eq!(leaf.error_count, 3);
        assert_eq!(leaf.total_duration_nanos, 5_500.0);
    }

    for agent in ["gp::", "gp::p::", "gp::p::leaf"] {
        assert_eq!(
            repo.pending_backlog(MetricKind::Aggregate, agent).await.unwrap(),
            vec![0, 0, 0, 0],
            "{agent}"
        );
    }
}

#[tokio::test]
async fn parent_sums_its_children() {
    let (repo, store, clock) = repository();
    repo.store_aggregates("g::a", 60_000, vec![aggregate(100.0, 1, 0)])
        .await
        .unwrap();
    repo.store_aggregates("g::b", 60_000, vec![aggregate(300.0, 3, 1)])
        .await
        .unwrap();
    assert_eq!(store.children("g::").await.unwrap().len(), 2);

    clock.set(DAY);
    repo.rollup("g::").await.unwrap();

    let parent = repo.read_summary(&web("g::", 300_000, 1)).await.unwrap();
    assert_eq!(parent.transaction_count, 4);
    assert_eq!(parent.total_duration_nanos, 400.0);
    assert_eq!(parent.error_count, 1);
}

#[tokio::test]
async fn late_child_data_reaches_ancestor_on_next_pass() {
    let (repo, _, clock) = repository();
    repo.store_aggregates("g::a", 50_000, vec![aggregate(100.0, 1, 0)])
        .await
        .unwrap();
    clock.set(DAY);
    repo.rollup_all().await.unwrap();
    let before = repo.read_summary(&web("g::", 300_000, 1)).await.unwrap();
    assert_eq!(before.transaction_count, 1);

    // Same level-0 bucket, written after the ancestor already rolled it up.
    repo.store_aggregates("g::a", 55_000, vec![aggregate(200.0, 2, 0)])
        .await
        .unwrap();
    repo.rollup_all().await.unwrap();

    let after = repo.read_summary(&web("g::", 300_000, 1)).await.unwrap();
    assert_eq!(after.transaction_count, 3);
    assert_eq!(after.total_duration_nanos, 300.0);
}

#[tokio::test]
async fn ancestor_gauge_is_weighted_across_children() {
    let (repo, _, clock) = repository();
    let heap = |value, weight| GaugeValue {
        gauge_name: "heap".to_string(),
        capture_time: 60_000,
        value,
        weight,
    };
    repo.store_gauge_values("g::a", vec![heap(10.0, 1_000)])
        .await
        .unwrap();
    repo.store_gauge_values("g::b", vec![heap(40.0, 2_000)])
        .await
        .unwrap();
    clock.set(DAY);
    repo.rollup_all().await.unwrap();

    let level0 = repo
        .read_gauge_values("g::", "heap", 0, 60_000, 0)
        .await
        .unwrap();
    assert_eq!(level0.len(), 1);
    assert_eq!(level0[0].value, 30.0);

    let level1 = repo
        .read_gauge_values("g::", "heap", 0, 300_000, 1)
        .await
        .unwrap();
    assert_eq!(level1[0].value, 30.0);
    assert_eq!(level1[0].weight, 3_000);
    assert_eq!(repo.read_gauge_names("g::").await.unwrap(), vec!["heap"]);
}

#[tokio::test]
async fn rollup_of_unknown_root_is_a_no_op() {
    let (repo, _, clock) = repository();
    clock.set(DAY);
    let summary = repo.rollup("nobody::").await.unwrap();
    assert_eq!(summary.buckets_rolled_up, 0);
    assert!(summary.is_clean());
}
