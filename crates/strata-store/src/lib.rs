//! Strata-Store: persistence layer for the Strata rollup engine
//!
//! Holds every row the rollup engine reads or writes: per-level aggregate
//! and gauge tables, the needs-rollup work queue, the agent rollup
//! registry, trace points and full query text, plus a bounded blob store
//! for large payloads.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: per-row atomicity, overwrite-on-rewrite, conditional queue retire.
//!
//! ## Key Components
//!
//! - `storage_traits`: backend-agnostic async contracts
//! - `SurrealRollupStore`: SurrealDB implementation of the column-store traits
//! - `MemoryRollupStore` / `CappedBlobStore`: in-memory implementations

pub mod capped;
mod error;
pub mod fakes;
pub mod handle;
pub mod migrations;
pub mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use capped::CappedBlobStore;
pub use error::{StateError, StorageError};
pub use fakes::{FaultPlan, MemoryRollupStore};
pub use handle::CloudConfig;
pub use schema::{
    AgentRollupRow, AggregateRow, BlobId, EncodedHistogram, GaugeValueRow, MetricKind, NameFilter,
    NeedsRollupRow, QueryEntry, ServiceCallEntry, StoredAggregate, ThreadStats, TimerNode,
    TracePointRow, MAX_ROLLUP_LEVELS,
};
pub use storage_traits::{
    AgentRollupStore, AggregateStore, BlobStore, GaugeStore, NeedsRollupStore, QueryTextStore,
    RollupStore, StorageResult, TracePointStore,
};
pub use surreal_store::SurrealRollupStore;

/// Result type for strata-store operations
pub type Result<T> = std::result::Result<T, StateError>;
