//! Tile service: the cache, scheduler and reaper behind one handle.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           TileService                            │
//! │                                                                  │
//! │   get / put ──────────────► TileStore ◄──────── Reaper           │
//! │                               ▲   │               ▲              │
//! │   compute_one                 │   ▼               │              │
//! │   schedule_blocking ──► cache check ─► TileScheduler             │
//! │   schedule_tracked                       │    │                  │
//! │   prefetch                        primary     prefetch           │
//! │                                     pool        pool             │
//! │                                       └── TileProducer ──┘       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Images are opened through the service so that dropping their last handle
//! purges their tiles in the background. [`TileService::release_image`]
//! purges synchronously instead.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::cache::{CacheStats, Reaper, ReclaimQueue, StoreConfig, TileStore};
use crate::error::{ComputeError, ServiceError};
use crate::raster::{ImageHandle, PixelBuffer, TileProducer};
use crate::scheduler::{RequestHandle, SchedulerConfig, TileListener, TileScheduler};

/// Settings for a [`TileService`].
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
}

/// Cached, deduplicated tile computation for any number of images.
///
/// # Example
///
/// ```
/// use tilecache::raster::{PixelBuffer, TileLayout};
/// use tilecache::{ServiceConfig, TileService};
///
/// #[tokio::main]
/// async fn main() {
///     let service = TileService::start(&ServiceConfig::default()).await.unwrap();
///
///     let image = service.open_image(
///         |x: u32, y: u32| Ok(PixelBuffer::filled(TileLayout::rgb8(64), (x + y) as u8)),
///         false,
///     );
///
///     let tiles = service
///         .schedule_blocking(&image, &[(0, 0), (1, 0)])
///         .await
///         .unwrap();
///     assert_eq!(tiles.len(), 2);
///
///     // Served from the cache this time
///     assert!(service.get(&image, 1, 0).await.is_some());
///
///     service.shutdown().await;
/// }
/// ```
pub struct TileService {
    store: Arc<TileStore>,
    scheduler: TileScheduler,
    queue: ReclaimQueue,
    reaper: Mutex<Option<Reaper>>,
}

impl TileService {
    /// Build the store, start the reaper and the worker pools.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn start(config: &ServiceConfig) -> Result<Self, ServiceError> {
        config.scheduler.validate()?;

        let store = Arc::new(TileStore::open(&config.store).await?);
        let scheduler = TileScheduler::new(&config.scheduler, Some(Arc::clone(&store)))?;
        let reaper = Reaper::spawn(Arc::clone(&store));

        info!(
            "Tile service started: {} bytes of memory, {} worker(s), {} prefetch worker(s), disk tier {}",
            config.store.capacity,
            config.scheduler.workers,
            config.scheduler.prefetch_workers,
            if store.has_overflow() { "on" } else { "off" }
        );

        Ok(Self {
            store,
            scheduler,
            queue: reaper.queue(),
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Register an image. Its tiles are purged once every handle is dropped.
    ///
    /// `persistent` marks evicted tiles as worth spilling to the disk tier.
    pub fn open_image(&self, producer: impl TileProducer, persistent: bool) -> ImageHandle {
        let image = ImageHandle::with_reclaim(Arc::new(producer), self.queue.clone());
        image.set_persistent(persistent);
        debug!("Opened {}", image.id());
        image
    }

    /// Drop a handle and purge the image's tiles from both tiers now.
    ///
    /// Returns the number of tiles removed.
    pub async fn release_image(&self, image: ImageHandle) -> usize {
        let id = image.id();
        // Purge before dropping so the reaper cannot claim the tiles first
        let removed = self.store.remove_all(id).await;
        drop(image);
        debug!("Released {} ({} tile(s) purged)", id, removed);
        removed
    }

    /// Cached tile, if any. Never computes.
    pub async fn get(&self, image: &ImageHandle, x: u32, y: u32) -> Option<Arc<PixelBuffer>> {
        self.store.lookup(image, x, y).await
    }

    /// Cache a tile computed elsewhere.
    pub async fn put(
        &self,
        image: &ImageHandle,
        x: u32,
        y: u32,
        tile: Arc<PixelBuffer>,
        metric: Option<u64>,
    ) {
        self.store.insert(image, x, y, tile, metric).await;
    }

    /// Cached tile, or compute it (deduplicated with concurrent callers).
    pub async fn compute_one(
        &self,
        image: &ImageHandle,
        x: u32,
        y: u32,
    ) -> Result<Arc<PixelBuffer>, ComputeError> {
        if let Some(tile) = self.store.lookup(image, x, y).await {
            return Ok(tile);
        }
        self.scheduler.compute_one(image, x, y).await
    }

    /// Tiles in request order, computing the ones not cached.
    pub async fn schedule_blocking(
        &self,
        image: &ImageHandle,
        coords: &[(u32, u32)],
    ) -> Result<Vec<Arc<PixelBuffer>>, ComputeError> {
        if coords.is_empty() {
            return Err(ComputeError::InvalidRequest(
                "empty tile coordinate list".to_string(),
            ));
        }

        // Uncached tiles are looked up (and counted as misses) by their job
        let mut tiles = Vec::with_capacity(coords.len());
        let mut missing = Vec::new();
        for &(x, y) in coords {
            let cached = if self.store.contains(image.id(), x, y).await {
                self.store.lookup(image, x, y).await
            } else {
                None
            };
            if cached.is_none() {
                missing.push((x, y));
            }
            tiles.push(cached);
        }

        if missing.is_empty() {
            return Ok(tiles.into_iter().flatten().collect());
        }

        let mut computed = self
            .scheduler
            .schedule_blocking(image, &missing)
            .await?
            .into_iter();

        tiles
            .into_iter()
            .map(|cached| {
                cached
                    .or_else(|| computed.next())
                    .ok_or(ComputeError::Shutdown)
            })
            .collect()
    }

    /// Track tiles through listeners; returns immediately.
    pub fn schedule_tracked(
        &self,
        image: &ImageHandle,
        coords: &[(u32, u32)],
        listeners: Vec<Arc<dyn TileListener>>,
    ) -> Result<RequestHandle, ComputeError> {
        self.scheduler.schedule_tracked(image, coords, listeners)
    }

    /// Warm the cache in the background. Cached tiles are skipped.
    pub async fn prefetch(
        &self,
        image: &ImageHandle,
        coords: &[(u32, u32)],
    ) -> Result<(), ComputeError> {
        if coords.is_empty() {
            return Err(ComputeError::InvalidRequest(
                "empty tile coordinate list".to_string(),
            ));
        }

        let mut missing = Vec::with_capacity(coords.len());
        for &(x, y) in coords {
            if !self.store.contains(image.id(), x, y).await {
                missing.push((x, y));
            }
        }

        if missing.is_empty() {
            return Ok(());
        }
        self.scheduler.prefetch(image, &missing)
    }

    /// Cancel tiles of a tracked request (all of them when `coords` is `None`).
    pub fn cancel(&self, request: &RequestHandle, coords: Option<&[(u32, u32)]>) -> usize {
        self.scheduler.cancel(request, coords)
    }

    /// Counters of the tile store.
    pub async fn stats(&self) -> CacheStats {
        self.store.stats().await
    }

    pub fn store(&self) -> &Arc<TileStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &TileScheduler {
        &self.scheduler
    }

    /// Stop the scheduler, then the reaper once pending purges are done.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();

        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reaper) = reaper {
            reaper.shutdown().await;
        }

        info!("Tile service stopped");
    }
}
