//! Bounded tile store with LRU eviction and optional disk overflow.
//!
//! # Capacity
//!
//! The store tracks the byte size of every cached tile. When an insertion
//! pushes usage above capacity, least-recently-used tiles are evicted until
//! usage drops to `capacity * threshold`. Eviction runs before the inserting
//! call returns, so `usage <= capacity` holds whenever no call is in progress.
//!
//! # Disk overflow
//!
//! With an [`OverflowStore`] attached, evicted tiles whose owner is alive and
//! flagged persistence-worthy are written to disk first. A later lookup reads
//! the tile back, removes the disk entry and reinserts the tile into memory.
//! Disk failures are logged and never reach callers.
//!
//! # Reclamation
//!
//! Every key is recorded in a per-owner index covering both tiers, so all
//! tiles of an image can be purged without scanning the cache.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::key::TileKey;
use super::observer::{CacheAction, CacheObserver, EventBuffer, TracingObserver};
use super::overflow::{FileOverflow, OverflowStore};
use crate::error::{CacheError, OverflowError};
use crate::raster::{ImageHandle, OwnerId, PixelBuffer, TileLayout, WeakImage};

/// Default memory capacity: 256MB
pub const DEFAULT_MEMORY_CAPACITY: usize = 256 * 1024 * 1024;

/// Default fraction of capacity the store shrinks to once it overflows.
pub const DEFAULT_EVICTION_THRESHOLD: f64 = 0.75;

/// Fraction of capacity kept in memory by a flush when a disk tier exists.
pub const FLUSH_RETAIN_FRACTION: f64 = 0.1;

// =============================================================================
// Configuration
// =============================================================================

/// Tile store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Memory capacity in bytes (0 disables the store)
    pub capacity: usize,

    /// Fraction of capacity to shrink to when capacity is exceeded
    pub threshold: f64,

    /// Directory for the disk overflow tier
    pub disk_dir: Option<PathBuf>,

    /// Forward every state transition to `tracing`
    pub diagnostics: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MEMORY_CAPACITY,
            threshold: DEFAULT_EVICTION_THRESHOLD,
            disk_dir: None,
            diagnostics: false,
        }
    }
}

// =============================================================================
// Cached Tile
// =============================================================================

/// A computed tile held in memory.
#[derive(Debug, Clone)]
pub struct CachedTile {
    key: TileKey,
    tile: Arc<PixelBuffer>,
    byte_size: usize,
    last_access: u64,
    metric: Option<u64>,
    owner: WeakImage,
}

impl CachedTile {
    fn new(
        key: TileKey,
        tile: Arc<PixelBuffer>,
        stamp: u64,
        metric: Option<u64>,
        owner: WeakImage,
    ) -> Self {
        Self {
            key,
            byte_size: tile.byte_size(),
            tile,
            last_access: stamp,
            metric,
            owner,
        }
    }

    pub fn key(&self) -> TileKey {
        self.key
    }

    pub fn tile(&self) -> &Arc<PixelBuffer> {
        &self.tile
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Store clock value of the last read or insertion.
    pub fn last_access(&self) -> u64 {
        self.last_access
    }

    pub fn metric(&self) -> Option<u64> {
        self.metric
    }

    pub fn owner(&self) -> &WeakImage {
        &self.owner
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of tile store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub usage: usize,
    pub capacity: usize,
    pub threshold: f64,
    pub tile_count: usize,
    pub disk_written: u64,
    pub disk_read: u64,
    pub disk_resident: usize,
}

impl CacheStats {
    /// Memory hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Store State
// =============================================================================

struct StoreState {
    tiles: LruCache<TileKey, CachedTile>,
    usage: usize,
    capacity: usize,
    threshold: f64,
    clock: u64,
    /// Coordinates per owner, across memory and disk
    owners: HashMap<OwnerId, HashSet<(u32, u32)>>,
    /// Layouts of tiles currently resident on disk
    on_disk: HashMap<TileKey, TileLayout>,
    hits: u64,
    misses: u64,
    disk_written: u64,
    disk_read: u64,
}

impl StoreState {
    fn new(capacity: usize, threshold: f64) -> Self {
        Self {
            tiles: LruCache::unbounded(),
            usage: 0,
            capacity,
            threshold,
            clock: 0,
            owners: HashMap::new(),
            on_disk: HashMap::new(),
            hits: 0,
            misses: 0,
            disk_written: 0,
            disk_read: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Usage the store shrinks to after exceeding capacity.
    fn eviction_limit(&self) -> usize {
        (self.capacity as f64 * self.threshold) as usize
    }

    fn register(&mut self, key: TileKey) {
        self.owners
            .entry(key.owner)
            .or_default()
            .insert((key.x, key.y));
    }

    /// Drop `key` from the owner index once neither tier holds it.
    fn forget_if_gone(&mut self, key: &TileKey) {
        if self.tiles.contains(key) || self.on_disk.contains_key(key) {
            return;
        }
        if let Some(coords) = self.owners.get_mut(&key.owner) {
            coords.remove(&(key.x, key.y));
            if coords.is_empty() {
                self.owners.remove(&key.owner);
            }
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            usage: self.usage,
            capacity: self.capacity,
            threshold: self.threshold,
            tile_count: self.tiles.len(),
            disk_written: self.disk_written,
            disk_read: self.disk_read,
            disk_resident: self.on_disk.len(),
        }
    }
}

// =============================================================================
// Tile Store
// =============================================================================

/// Capacity-bounded tile cache shared across tasks via `Arc`.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tilecache::cache::TileStore;
/// use tilecache::raster::{ImageHandle, PixelBuffer, TileLayout};
///
/// #[tokio::main]
/// async fn main() {
///     let store = TileStore::new(1024 * 1024);
///     let image = ImageHandle::new(|_x, _y| Ok(PixelBuffer::filled(TileLayout::rgb8(16), 0)));
///
///     let tile = Arc::new(image.compute_tile(0, 0).unwrap());
///     store.insert(&image, 0, 0, tile.clone(), None).await;
///
///     let cached = store.lookup(&image, 0, 0).await;
///     assert!(Arc::ptr_eq(&cached.unwrap(), &tile));
/// }
/// ```
pub struct TileStore {
    state: Mutex<StoreState>,
    overflow: Option<Arc<dyn OverflowStore>>,
    observer: Option<Arc<dyn CacheObserver>>,
}

impl TileStore {
    /// Create a memory-only store with the default eviction threshold.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::new(capacity, DEFAULT_EVICTION_THRESHOLD)),
            overflow: None,
            observer: None,
        }
    }

    /// Create a memory-only store with a custom eviction threshold.
    pub fn with_threshold(capacity: usize, threshold: f64) -> Result<Self, CacheError> {
        validate_threshold(threshold)?;
        Ok(Self {
            state: Mutex::new(StoreState::new(capacity, threshold)),
            overflow: None,
            observer: None,
        })
    }

    /// Build a store from configuration, opening the disk tier if configured.
    pub async fn open(config: &StoreConfig) -> Result<Self, CacheError> {
        let mut store = Self::with_threshold(config.capacity, config.threshold)?;

        if let Some(ref dir) = config.disk_dir {
            let tier = FileOverflow::open(dir).await?;
            debug!("Disk tier enabled at {}", tier.dir().display());
            store = store.with_overflow(Arc::new(tier));
        }

        if config.diagnostics {
            store = store.with_observer(Arc::new(TracingObserver));
        }

        Ok(store)
    }

    /// Attach a disk overflow tier.
    pub fn with_overflow(mut self, overflow: Arc<dyn OverflowStore>) -> Self {
        self.overflow = Some(overflow);
        self
    }

    /// Attach a diagnostics observer.
    pub fn with_observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Whether a disk tier is attached.
    pub fn has_overflow(&self) -> bool {
        self.overflow.is_some()
    }

    fn events(&self) -> EventBuffer {
        EventBuffer::new(self.observer.is_some())
    }

    /// Store a computed tile.
    ///
    /// Re-inserting a cached key only refreshes its recency (and metric, if
    /// one is given) and counts as a hit. If the store is over capacity
    /// afterwards, least-recently-used tiles are evicted before returning.
    pub async fn insert(
        &self,
        owner: &ImageHandle,
        x: u32,
        y: u32,
        tile: Arc<PixelBuffer>,
        metric: Option<u64>,
    ) {
        let mut events = self.events();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.capacity == 0 {
                return;
            }

            let key = TileKey::new(owner.id(), x, y);
            let stamp = state.tick();

            if let Some(entry) = state.tiles.get_mut(&key) {
                entry.last_access = stamp;
                if metric.is_some() {
                    entry.metric = metric;
                }
                events.push(CacheAction::Updated, key, entry.byte_size, entry.metric);
                state.hits += 1;
            } else {
                self.admit(state, owner, key, tile, metric, stamp, &mut events)
                    .await;
            }
        }
        events.deliver(self.observer.as_ref());
    }

    /// Look up a tile, falling back to the disk tier.
    ///
    /// A memory hit marks the tile most-recently-used. A disk hit moves the
    /// tile back into memory and is counted as a disk read, not a hit.
    pub async fn lookup(&self, owner: &ImageHandle, x: u32, y: u32) -> Option<Arc<PixelBuffer>> {
        let mut events = self.events();
        let found = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.capacity == 0 {
                return None;
            }

            let key = TileKey::new(owner.id(), x, y);
            let stamp = state.tick();

            if let Some(entry) = state.tiles.get_mut(&key) {
                entry.last_access = stamp;
                let tile = entry.tile.clone();
                state.hits += 1;
                Some(tile)
            } else {
                let restored = self.read_back(state, owner, key, stamp, &mut events).await;
                if restored.is_none() {
                    state.misses += 1;
                }
                restored
            }
        };
        events.deliver(self.observer.as_ref());
        found
    }

    /// Whether a tile is in memory, without touching recency or counters.
    pub async fn contains(&self, owner: OwnerId, x: u32, y: u32) -> bool {
        let state = self.state.lock().await;
        state.tiles.contains(&TileKey::new(owner, x, y))
    }

    /// Remove one tile from both tiers.
    ///
    /// Returns `true` if the tile was present in either tier.
    pub async fn remove(&self, owner: OwnerId, x: u32, y: u32) -> bool {
        let mut events = self.events();
        let removed = {
            let mut guard = self.state.lock().await;
            let key = TileKey::new(owner, x, y);
            self.drop_key(&mut guard, key, CacheAction::Removed, &mut events)
                .await
        };
        events.deliver(self.observer.as_ref());
        removed
    }

    /// Remove every tile of an owner from both tiers.
    ///
    /// Returns the number of tiles removed.
    pub async fn remove_all(&self, owner: OwnerId) -> usize {
        self.purge_owner(owner, CacheAction::Removed).await
    }

    /// Purge an unreachable owner's tiles. Used by the reaper.
    pub(crate) async fn reap(&self, owner: OwnerId) -> usize {
        self.purge_owner(owner, CacheAction::Reaped).await
    }

    async fn purge_owner(&self, owner: OwnerId, action: CacheAction) -> usize {
        let mut events = self.events();
        let removed = {
            let mut guard = self.state.lock().await;
            let coords = guard.owners.remove(&owner).unwrap_or_default();
            let mut removed = 0;
            for (x, y) in coords {
                let key = TileKey::new(owner, x, y);
                if self.drop_key(&mut guard, key, action, &mut events).await {
                    removed += 1;
                }
            }
            removed
        };
        events.deliver(self.observer.as_ref());

        if removed > 0 {
            debug!("Purged {} tile(s) of {} ({:?})", removed, owner, action);
        }
        removed
    }

    /// Answer memory pressure.
    ///
    /// Without a disk tier every tile is dropped and usage and hit/miss
    /// counters are reset. With a disk tier the store instead spills down to
    /// [`FLUSH_RETAIN_FRACTION`] of its capacity through the eviction path, so
    /// persistence-worthy tiles move to disk rather than being lost; counters
    /// are kept.
    pub async fn flush(&self) {
        let mut events = self.events();
        {
            let mut guard = self.state.lock().await;
            self.flush_locked(&mut guard, &mut events).await;
        }
        events.deliver(self.observer.as_ref());
    }

    /// Change the memory capacity.
    ///
    /// Zero behaves like [`flush`](Self::flush) and disables the store.
    /// Shrinking below current usage evicts immediately.
    pub async fn set_capacity(&self, capacity: usize) {
        let mut events = self.events();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.capacity = capacity;

            if capacity == 0 {
                self.flush_locked(state, &mut events).await;
            } else if state.usage > capacity {
                let limit = state.eviction_limit();
                self.evict_to(state, limit, CacheAction::Evicted, &mut events)
                    .await;
            }
        }
        events.deliver(self.observer.as_ref());
    }

    /// Change the eviction threshold (0.0 to 1.0).
    pub async fn set_threshold(&self, threshold: f64) -> Result<(), CacheError> {
        validate_threshold(threshold)?;

        let mut events = self.events();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.threshold = threshold;

            if state.usage > state.capacity {
                let limit = state.eviction_limit();
                self.evict_to(state, limit, CacheAction::Evicted, &mut events)
                    .await;
            }
        }
        events.deliver(self.observer.as_ref());
        Ok(())
    }

    /// Snapshot of all counters.
    pub async fn stats(&self) -> CacheStats {
        self.state.lock().await.stats()
    }

    pub async fn hit_count(&self) -> u64 {
        self.state.lock().await.hits
    }

    pub async fn miss_count(&self) -> u64 {
        self.state.lock().await.misses
    }

    /// Bytes currently held in memory.
    pub async fn usage(&self) -> usize {
        self.state.lock().await.usage
    }

    pub async fn capacity(&self) -> usize {
        self.state.lock().await.capacity
    }

    /// Number of tiles held in memory.
    pub async fn tile_count(&self) -> usize {
        self.state.lock().await.tiles.len()
    }

    // -------------------------------------------------------------------------
    // Internals (all called with the state lock held)
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn admit(
        &self,
        state: &mut StoreState,
        owner: &ImageHandle,
        key: TileKey,
        tile: Arc<PixelBuffer>,
        metric: Option<u64>,
        stamp: u64,
        events: &mut EventBuffer,
    ) {
        let entry = CachedTile::new(key, tile, stamp, metric, owner.downgrade());
        let size = entry.byte_size;

        state.tiles.push(key, entry);
        state.usage += size;
        state.register(key);
        events.push(CacheAction::Added, key, size, metric);

        if state.usage > state.capacity {
            let limit = state.eviction_limit();
            self.evict_to(state, limit, CacheAction::Evicted, events)
                .await;
        }
    }

    /// Pop least-recently-used tiles until usage is at most `limit`.
    ///
    /// This is the only capacity-driven removal path.
    async fn evict_to(
        &self,
        state: &mut StoreState,
        limit: usize,
        action: CacheAction,
        events: &mut EventBuffer,
    ) {
        while state.usage > limit {
            let Some((key, entry)) = state.tiles.pop_lru() else {
                break;
            };
            state.usage = state.usage.saturating_sub(entry.byte_size);

            if let Some(ref overflow) = self.overflow {
                if entry.owner.wants_persistence() {
                    match overflow.write(&key, entry.tile.data()).await {
                        Ok(()) => {
                            state.on_disk.insert(key, entry.tile.layout());
                            state.disk_written += 1;
                        }
                        Err(e) => warn!("Skipping disk spill of {}: {}", key, e),
                    }
                }
            }

            state.forget_if_gone(&key);
            events.push(action, key, entry.byte_size, entry.metric);
        }
    }

    /// Move a tile from disk back into memory.
    ///
    /// The disk entry is consumed whether or not the read succeeds.
    async fn read_back(
        &self,
        state: &mut StoreState,
        owner: &ImageHandle,
        key: TileKey,
        stamp: u64,
        events: &mut EventBuffer,
    ) -> Option<Arc<PixelBuffer>> {
        let overflow = self.overflow.as_ref()?;
        let layout = state.on_disk.remove(&key)?;

        let data = match overflow.read(&key).await {
            Ok(Some(data)) => Some(data),
            Ok(None) => {
                warn!("Disk tier lost tile {}", key);
                None
            }
            Err(e) => {
                warn!("Failed to read tile {} from disk: {}", key, e);
                None
            }
        };

        if let Err(e) = overflow.remove(&key).await {
            warn!("Failed to delete disk entry for {}: {}", key, e);
        }

        let tile = data.and_then(|data| {
            let actual = data.len();
            match PixelBuffer::new(layout, data) {
                Ok(tile) => Some(Arc::new(tile)),
                Err(_) => {
                    let err = OverflowError::Corrupt {
                        key,
                        expected: layout.byte_len(),
                        actual,
                    };
                    warn!("{}", err);
                    None
                }
            }
        });

        let Some(tile) = tile else {
            state.forget_if_gone(&key);
            return None;
        };

        state.disk_read += 1;
        self.admit(state, owner, key, tile.clone(), None, stamp, events)
            .await;
        Some(tile)
    }

    /// Remove a key from both tiers. Returns whether either tier held it.
    async fn drop_key(
        &self,
        state: &mut StoreState,
        key: TileKey,
        action: CacheAction,
        events: &mut EventBuffer,
    ) -> bool {
        let mut removed = false;

        if let Some(entry) = state.tiles.pop(&key) {
            state.usage = state.usage.saturating_sub(entry.byte_size);
            events.push(action, key, entry.byte_size, entry.metric);
            removed = true;
        }

        if state.on_disk.remove(&key).is_some() {
            if let Some(ref overflow) = self.overflow {
                if let Err(e) = overflow.remove(&key).await {
                    warn!("Failed to delete disk entry for {}: {}", key, e);
                }
            }
            removed = true;
        }

        state.forget_if_gone(&key);
        removed
    }

    async fn flush_locked(&self, state: &mut StoreState, events: &mut EventBuffer) {
        if self.overflow.is_some() {
            let limit = (state.capacity as f64 * FLUSH_RETAIN_FRACTION) as usize;
            self.evict_to(state, limit, CacheAction::Flushed, events)
                .await;
            return;
        }

        for (key, entry) in state.tiles.iter() {
            events.push(CacheAction::Flushed, *key, entry.byte_size, entry.metric);
        }
        state.tiles.clear();
        state.owners.clear();
        state.usage = 0;
        state.hits = 0;
        state.misses = 0;
    }
}

fn validate_threshold(threshold: f64) -> Result<(), CacheError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(CacheError::InvalidThreshold { threshold })
    }
}

// =============================================================================
// Tests
// =============================================================================
