//! Distributed progress tracking for the skysift orchestrator.
//!
//! Image, region and endpoint state lives in a key-value store so that work
//! survives worker restarts: every transition is idempotent or conditional,
//! counters are atomic, and optimistic concurrency resolves races between
//! workers. The [`kv`] module defines the store contract; the table modules
//! wrap it with the record types and operations the handlers use.

pub mod endpoint_stats;
pub mod feature_table;
pub mod job_table;
pub mod kv;
pub mod memory;
pub mod region_table;
pub mod requested_jobs;

pub use endpoint_stats::EndpointStatisticsTable;
pub use feature_table::FeatureTable;
pub use job_table::{ImageJobRecord, JobTable};
pub use kv::{Condition, KvError, KvStore, Mutation, RecordKey};
pub use memory::MemoryKvStore;
pub use region_table::{RegionJobRecord, RegionTable};
pub use requested_jobs::{ImageRequestStatusRecord, RequestedJobsTable};

/// Progress records expire one day after creation. Jobs take minutes, so this
/// leaves room to debug an urgent issue without accumulating state.
pub const RECORD_TTL_SECONDS: i64 = 24 * 60 * 60;
