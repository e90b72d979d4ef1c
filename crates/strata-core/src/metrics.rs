//! Global atomic counters for Strata observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a scheduler tick).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations, no locking.
pub struct Metrics {
    rows_ingested: AtomicU64,
    buckets_rolled_up: AtomicU64,
    empty_buckets: AtomicU64,
    failed_buckets: AtomicU64,
    stale_retires: AtomicU64,
    rate_limited_writes: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            rows_ingested: AtomicU64::new(0),
            buckets_rolled_up: AtomicU64::new(0),
            empty_buckets: AtomicU64::new(0),
            failed_buckets: AtomicU64::new(0),
            stale_retires: AtomicU64::new(0),
            rate_limited_writes: AtomicU64::new(0),
        }
    }

    /// Add `n` level-0 rows written by agents.
    pub fn add_rows_ingested(&self, n: u64) {
        self.rows_ingested.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "rows_ingested", n, "counter incremented");
    }

    pub fn inc_buckets_rolled_up(&self) {
        self.buckets_rolled_up.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "buckets_rolled_up", "counter incremented");
    }

    pub fn inc_empty_buckets(&self) {
        self.empty_buckets.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "empty_buckets", "counter incremented");
    }

    pub fn inc_failed_buckets(&self) {
        self.failed_buckets.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "failed_buckets", "counter incremented");
    }

    pub fn inc_stale_retires(&self) {
        self.stale_retires.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "stale_retires", "counter incremented");
    }

    pub fn inc_rate_limited_writes(&self) {
        self.rate_limited_writes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rate_limited_writes", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a scheduler tick)
    /// rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            rows_ingested = self.rows_ingested(),
            buckets_rolled_up = self.buckets_rolled_up(),
            empty_buckets = self.empty_buckets(),
            failed_buckets = self.failed_buckets(),
            stale_retires = self.stale_retires(),
            rate_limited_writes = self.rate_limited_writes(),
        );
    }

    pub fn rows_ingested(&self) -> u64 {
        self.rows_ingested.load(Ordering::Relaxed)
    }

    pub fn buckets_rolled_up(&self) -> u64 {
        self.buckets_rolled_up.load(Ordering::Relaxed)
    }

    pub fn empty_buckets(&self) -> u64 {
        self.empty_buckets.load(Ordering::Relaxed)
    }

    pub fn failed_buckets(&self) -> u64 {
        self.failed_buckets.load(Ordering::Relaxed)
    }

    pub fn stale_retires(&self) -> u64 {
        self.stale_retires.load(Ordering::Relaxed)
    }

    pub fn rate_limited_writes(&self) -> u64 {
        self.rate_limited_writes.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.rows_ingested.store(0, Ordering::Relaxed);
        self.buckets_rolled_up.store(0, Ordering::Relaxed);
        self.empty_buckets.store(0, Ordering::Relaxed);
        self.failed_buckets.store(0, Ordering::Relaxed);
        self.stale_retires.store(0, Ordering::Relaxed);
        self.rate_limited_writes.store(0, Ordering::Relaxed);
    }
}
