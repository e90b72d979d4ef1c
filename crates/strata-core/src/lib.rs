//! Strata-Core: rollup engine for Strata
//!
//! Compacts agent-written metric rows into progressively coarser time
//! buckets and keeps every write visible at each ancestor of the agent.
//!
//! ## Layer 1 - Domain
//!
//! - `work_queue`: needs-rollup queue with token-guarded retire
//! - `engine`: one-bucket rollup (sums, weighted averages, histogram and
//!   profile merges)
//! - `cascade`: leaf-to-root cascade with the level ordering gate
//! - `resolver`: rollup level choice and live/rolled-up stitching
//! - `repository`: ingest, query and rollup entry points
//! - `scheduler`: periodic `rollup_all`

pub mod agent_rollup;
pub mod cascade;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod histogram;
pub mod merge;
pub mod metrics;
pub mod model;
pub mod obs;
pub mod profile;
pub mod rate_limiter;
pub mod repository;
pub mod resolver;
pub mod scheduler;
pub mod telemetry;
pub mod watermark;
pub mod work_queue;

pub use agent_rollup::{AgentRollupId, DELIMITER};
pub use cascade::{CascadeDriver, RollupSummary};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ceil_to, LevelSpec, RollupLevel, RollupLevels, StrataConfig};
pub use engine::{BucketOutcome, RollupEngine};
pub use error::{Result, RollupError};
pub use gate::{StorageGate, StorageProfile};
pub use histogram::DurationHistogram;
pub use merge::{AggregateMerger, GaugeMerger};
pub use metrics::METRICS;
pub use model::{
    AggregateQuery, GaugeValue, IncomingAggregate, IncomingQuery, OverviewPoint,
    PercentileSummary, PercentileValue, ProfileThread, ThroughputPoint, TracePoint,
    TracePointPage, TransactionSummary, QUERY_TEXT_TRUNCATE,
};
pub use profile::{Profile, ProfileNode};
pub use rate_limiter::RateLimiter;
pub use repository::MetricsRepository;
pub use resolver::{dedupe_trace_points, rollup_level_for_view, QueryResolver};
pub use scheduler::RollupScheduler;
pub use watermark::RollupWatermarks;
pub use work_queue::{NeedsRollupEntry, NeedsRollupQueue, Partition, RetireOutcome};
