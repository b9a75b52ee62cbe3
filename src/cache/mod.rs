//! Tile cache.
//!
//! - [`TileStore`]: bounded in-memory LRU with byte accounting and an
//!   optional disk overflow tier
//! - [`OverflowStore`] / [`FileOverflow`]: the disk tier
//! - [`Reaper`]: purges tiles of images that became unreachable
//! - [`CacheObserver`]: diagnostics hook for state transitions

mod key;
mod observer;
mod overflow;
mod reaper;
mod store;

pub use key::{TileKey, ENCODED_KEY_LEN};
pub use observer::{CacheAction, CacheEvent, CacheObserver, TracingObserver};
pub use overflow::{FileOverflow, OverflowStore, TILE_FILE_EXTENSION};
pub use reaper::{Reaper, ReclaimQueue};
pub use store::{
    CacheStats, CachedTile, StoreConfig, TileStore, DEFAULT_EVICTION_THRESHOLD,
    DEFAULT_MEMORY_CAPACITY, FLUSH_RETAIN_FRACTION,
};
