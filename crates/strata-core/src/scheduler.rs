//! Periodic rollup scheduler
//!
//! Runs `rollup_all` on a fixed period until the shutdown channel flips to
//! `true`. Each tick purges expired rate-limiter keys and flushes
//! [`METRICS`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cascade::RollupSummary;
use crate::error::Result;
use crate::metrics::METRICS;
use crate::repository::MetricsRepository;

pub struct RollupScheduler {
    repository: Arc<MetricsRepository>,
    period: Duration,
}

impl RollupScheduler {
    pub fn new(repository: Arc<MetricsRepository>, period: Duration) -> Self {
        Self { repository, period }
    }

    /// One scheduler tick.
    pub async fn tick(&self) -> Result<RollupSummary> {
        let summary = self.repository.rollup_all().await;
        let purged = self.repository.purge_rate_limiters();
        if purged > 0 {
            debug!(purged, "expired rate limiter keys dropped");
        }
        METRICS.flush();
        summary
    }

    /// Tick until `shutdown` reports `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = self.period.as_secs(), "rollup scheduler started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(summary) if !summary.is_clean() => warn!(
                            failed_buckets = summary.failed_buckets,
                            partition_errors = summary.partition_errors,
                            "rollup tick left work pending"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "rollup tick failed"),
                    }
                }
            }
        }
        info!("rollup scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_store::{CappedBlobStore, MemoryRollupStore, MetricKind};

    use crate::clock::ManualClock;
    use crate::config::StrataConfig;
    use crate::model::IncomingAggregate;

    #[tokio::test(start_paused = true)]
    async fn runs_until_shutdown() {
        let store = Arc::new(MemoryRollupStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let repository = Arc::new(
            MetricsRepository::new(
                store,
                Arc::new(CappedBlobStore::new(1 << 20)),
                &StrataConfig::default(),
                clock.clone(),
            )
            .unwrap(),
        );
        let mut agg = IncomingAggregate::overall("Web");
        agg.transaction_count = 1;
        repository
            .store_aggregates("a", 60_000, vec![agg])
            .await
            .unwrap();
        clock.set(1_000_000);

        let (tx, rx) = watch::channel(false);
        let scheduler = RollupScheduler::new(Arc::clone(&repository), Duration::from_secs(60));
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let backlog = repository
            .pending_backlog(MetricKind::Aggregate, "a")
            .await
            .unwrap();
        assert_eq!(backlog[1], 0);
    }
}
