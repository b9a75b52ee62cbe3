//! # tilecache
//!
//! A tiled-image render cache and tile computation scheduler.
//!
//! tilecache sits between an image-processing pipeline, which produces the
//! pixels of a tile on demand, and its consumers (a display, an exporter), which
//! request rectangular tiles. It keeps computed tiles in a byte-bounded memory
//! cache with optional disk overflow and makes sure no tile is ever computed
//! twice concurrently.
//!
//! ## Features
//!
//! - **Byte-bounded LRU**: eviction shrinks the cache to a configurable fraction of capacity
//! - **Disk overflow**: evicted tiles of persistence-worthy images spill to disk and come back on lookup
//! - **Owner reclamation**: dropping the last handle of an image purges its tiles in the background
//! - **Deduplicated computation**: concurrent requests for one tile share one producer call
//! - **Tracked requests**: listeners are notified per tile; overlapping requests share jobs
//! - **Prefetch**: background warming on a separate worker pool
//!
//! ## Architecture
//!
//! - [`raster`] - Image handles, tile producers and pixel buffers
//! - [`cache`] - Tile store, disk tier, reaper and diagnostics
//! - [`scheduler`] - Worker pools, jobs and tracked requests
//! - [`service`] - The [`TileService`] facade wiring everything together
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tilecache::raster::{PixelBuffer, TileLayout};
//! use tilecache::{ServiceConfig, TileService};
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = TileService::start(&ServiceConfig::default()).await.unwrap();
//!
//!     let image = service.open_image(
//!         |x: u32, y: u32| Ok(PixelBuffer::filled(TileLayout::rgb8(256), (x ^ y) as u8)),
//!         true,
//!     );
//!
//!     let request = service
//!         .schedule_tracked(&image, &[(0, 0), (1, 0), (0, 1)], Vec::new())
//!         .unwrap();
//!     request.wait().await;
//!
//!     println!("{:?}", service.stats().await);
//!     service.shutdown().await;
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod raster;
pub mod scheduler;
pub mod service;

// Re-export commonly used types
pub use cache::{
    CacheAction, CacheEvent, CacheObserver, CacheStats, FileOverflow, OverflowStore, Reaper,
    StoreConfig, TileKey, TileStore, TracingObserver,
};
pub use config::{parse_size, CacheArgs, CheckConfig, Cli, Command, RunConfig};
pub use error::{CacheError, ComputeError, OverflowError, ServiceError};
pub use raster::{ImageHandle, OwnerId, PixelBuffer, TileLayout, TileProducer};
pub use scheduler::{
    RequestHandle, RequestId, SchedulerConfig, TileEvent, TileListener, TileScheduler, TileStatus,
};
pub use service::{ServiceConfig, TileService};
