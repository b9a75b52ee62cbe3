//! Deduplicating tile computation on prioritized worker pools.
//!
//! Calling modes:
//!
//! - [`TileScheduler::compute_one`]: one tile, awaited by the caller
//! - [`TileScheduler::schedule_blocking`]: many tiles, awaited as a whole
//! - [`TileScheduler::schedule_tracked`]: many tiles, reported through a
//!   [`RequestHandle`] and [`TileListener`]s
//! - [`TileScheduler::prefetch`]: fire and forget on a separate pool
//!
//! All modes share the same per-tile deduplication.

mod engine;
mod job;
mod pool;
mod request;

pub use engine::{
    default_worker_count, SchedulerConfig, TileScheduler, DEFAULT_BATCH_SIZE,
    DEFAULT_PREFETCH_WORKERS, OUT_OF_MEMORY_RETRIES,
};
pub use job::{JobId, JobPriority};
pub use request::{RequestHandle, RequestId, TileEvent, TileListener, TileStatus};
