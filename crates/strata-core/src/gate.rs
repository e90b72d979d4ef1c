//! Bounded concurrency and per-profile timeouts for storage calls
//!
//! Every storage operation issued by the engine goes through
//! [`StorageGate::run`]: it waits for a semaphore permit, then races the
//! operation against the profile's deadline. A missed deadline becomes
//! `StorageError::Timeout`, which callers treat as transient.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use strata_store::{StorageError, StorageResult};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::config::StrataConfig;

/// Caller class; selects the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageProfile {
    /// Agent writes.
    Ingest,
    /// Bulk rollup reads and writes.
    Rollup,
    /// User-facing queries.
    Interactive,
}

#[derive(Debug, Clone)]
pub struct StorageGate {
    permits: Arc<Semaphore>,
    ingest_timeout: Duration,
    rollup_timeout: Duration,
    interactive_timeout: Duration,
}

impl StorageGate {
    pub fn new(
        max_concurrent: usize,
        ingest_timeout: Duration,
        rollup_timeout: Duration,
        interactive_timeout: Duration,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            ingest_timeout,
            rollup_timeout,
            interactive_timeout,
        }
    }

    pub fn from_config(config: &StrataConfig) -> Self {
        Self::new(
            config.max_concurrent_storage_ops,
            Duration::from_millis(config.ingest_timeout_millis),
            Duration::from_millis(config.rollup_timeout_millis),
            Duration::from_millis(config.interactive_timeout_millis),
        )
    }

    pub fn timeout_for(&self, profile: StorageProfile) -> Duration {
        match profile {
            StorageProfile::Ingest => self.ingest_timeout,
            StorageProfile::Rollup => self.rollup_timeout,
            StorageProfile::Interactive => self.interactive_timeout,
        }
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run one storage operation under a permit and the profile's deadline.
    ///
    /// The deadline covers the wait for a permit as well as the operation.
    pub async fn run<T, F>(
        &self,
        profile: StorageProfile,
        operation: &'static str,
        fut: F,
    ) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        let limit = self.timeout_for(profile);
        let guarded = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            fut.await
        };
        match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => {
                let after_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                warn!(operation, after_ms, ?profile, "storage operation timed out");
                Err(StorageError::Timeout {
                    operation: operation.to_string(),
                    after_ms,
                })
            }
        }
    }
}

impl Default for StorageGate {
    fn default() -> Self {
        Self::from_config(&StrataConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(max: usize) -> StorageGate {
        StorageGate::new(
            max,
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn passes_through_results() {
        let gate = gate(2);
        let value = gate
            .run(StorageProfile::Rollup, "read", async { Ok::<_, StorageError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operation_times_out_as_transient() {
        let gate = gate(1);
        let err = gate
            .run(StorageProfile::Interactive, "read_aggregates", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, StorageError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            err,
            StorageError::Timeout {
                operation: "read_aggregates".into(),
                after_ms: 50,
            }
        );
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permits_bound_concurrency() {
        let gate = gate(1);
        let held = gate.permits.clone().acquire_owned().await.unwrap();
        let err = gate
            .run(StorageProfile::Ingest, "write", async { Ok::<_, StorageError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Timeout { .. }));
        drop(held);
        assert!(gate
            .run(StorageProfile::Ingest, "write", async { Ok::<_, StorageError>(()) })
            .await
            .is_ok());
    }
}
