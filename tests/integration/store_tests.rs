//! Tile store integration tests.
//!
//! Tests verify:
//! - Eviction shrinks usage to the threshold, oldest first
//! - Persistence-worthy tiles survive eviction through the disk tier
//! - Observers see every transition, in order

use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use tilecache::cache::TILE_FILE_EXTENSION;
use tilecache::{
    CacheAction, CacheEvent, CacheObserver, ImageHandle, PixelBuffer, StoreConfig, TileLayout,
    TileStore,
};

use super::test_utils::small_tile;

fn image() -> ImageHandle {
    ImageHandle::new(|_: u32, _: u32| Ok(small_tile(0)))
}

/// 20x20 gray tile (400 bytes).
fn tile_400(value: u8) -> Arc<PixelBuffer> {
    Arc::new(PixelBuffer::filled(TileLayout::new(20, 20, 1), value))
}

fn tile_files(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| {
            entry.path().extension().and_then(|ext| ext.to_str()) == Some(TILE_FILE_EXTENSION)
        })
        .count()
}

#[derive(Default)]
struct Recorder(Mutex<Vec<CacheEvent>>);

impl CacheObserver for Recorder {
    fn on_event(&self, event: &CacheEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

// =============================================================================
// Eviction
// =============================================================================

#[tokio::test]
async fn test_eviction_keeps_newest_tile() {
    let store = TileStore::with_threshold(1000, 0.75).unwrap();
    let image = image();

    store.insert(&image, 0, 0, tile_400(1), None).await;
    store.insert(&image, 1, 0, tile_400(2), None).await;
    store.insert(&image, 2, 0, tile_400(3), None).await;

    assert_eq!(store.usage().await, 400);
    assert_eq!(store.tile_count().await, 1);
    assert!(!store.contains(image.id(), 0, 0).await);
    assert!(!store.contains(image.id(), 1, 0).await);
    assert!(store.contains(image.id(), 2, 0).await);
}

#[tokio::test]
async fn test_recent_lookup_protects_tile() {
    // Shrink only back to capacity so a single eviction suffices
    let store = TileStore::with_threshold(1000, 1.0).unwrap();
    let image = image();

    store.insert(&image, 0, 0, tile_400(1), None).await;
    store.insert(&image, 1, 0, tile_400(2), None).await;
    assert!(store.lookup(&image, 0, 0).await.is_some());
    store.insert(&image, 2, 0, tile_400(3), None).await;

    // (1,0) was the least recently used
    assert!(store.contains(image.id(), 0, 0).await);
    assert!(!store.contains(image.id(), 1, 0).await);
    assert!(store.contains(image.id(), 2, 0).await);
    assert_eq!(store.usage().await, 800);
}

#[tokio::test]
async fn test_threshold_can_evict_recent_tiles_too() {
    let store = TileStore::with_threshold(1000, 0.75).unwrap();
    let image = image();

    store.insert(&image, 0, 0, tile_400(1), None).await;
    store.insert(&image, 1, 0, tile_400(2), None).await;
    assert!(store.lookup(&image, 0, 0).await.is_some());
    store.insert(&image, 2, 0, tile_400(3), None).await;

    // 1200 -> 800 after (1,0) is still above 750, so (0,0) goes as well
    assert!(!store.contains(image.id(), 0, 0).await);
    assert!(!store.contains(image.id(), 1, 0).await);
    assert!(store.contains(image.id(), 2, 0).await);
    assert_eq!(store.usage().await, 400);
}

// =============================================================================
// Disk Tier
// =============================================================================

#[tokio::test]
async fn test_evicted_tiles_come_back_from_disk() {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig {
        capacity: 1000,
        threshold: 0.75,
        disk_dir: Some(temp_dir.path().to_path_buf()),
        diagnostics: false,
    };
    let store = TileStore::open(&config).await.unwrap();
    let image = image().persistent(true);

    store.insert(&image, 0, 0, tile_400(1), None).await;
    store.insert(&image, 1, 0, tile_400(2), None).await;
    store.insert(&image, 2, 0, tile_400(3), None).await;

    let stats = store.stats().await;
    assert_eq!(stats.disk_written, 2);
    assert_eq!(stats.disk_resident, 2);
    assert_eq!(tile_files(&temp_dir), 2);

    let restored = store.lookup(&image, 1, 0).await.unwrap();
    assert_eq!(restored.as_ref(), tile_400(2).as_ref());
    assert!(store.contains(image.id(), 1, 0).await);

    let stats = store.stats().await;
    assert_eq!(stats.disk_read, 1);
    assert_eq!(stats.disk_resident, 1);
    assert_eq!(tile_files(&temp_dir), 1);

    assert_eq!(store.remove_all(image.id()).await, 3);
    assert_eq!(tile_files(&temp_dir), 0);
}

#[tokio::test]
async fn test_reopening_discards_stale_entries() {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig {
        capacity: 500,
        threshold: 0.5,
        disk_dir: Some(temp_dir.path().to_path_buf()),
        diagnostics: false,
    };

    {
        let store = TileStore::open(&config).await.unwrap();
        let image = image().persistent(true);
        store.insert(&image, 0, 0, tile_400(1), None).await;
        store.insert(&image, 1, 0, tile_400(2), None).await;
        assert!(tile_files(&temp_dir) > 0);
    }

    let _store = TileStore::open(&config).await.unwrap();
    assert_eq!(tile_files(&temp_dir), 0);
}

// =============================================================================
// Observer
// =============================================================================

#[tokio::test]
async fn test_observer_sees_eviction_in_order() {
    let recorder = Arc::new(Recorder::default());
    let store = TileStore::with_threshold(1000, 0.75)
        .unwrap()
        .with_observer(recorder.clone());
    let image = image();

    store.insert(&image, 0, 0, tile_400(1), Some(7)).await;
    store.insert(&image, 1, 0, tile_400(2), None).await;
    store.insert(&image, 2, 0, tile_400(3), None).await;
    store.remove(image.id(), 2, 0).await;

    let events = recorder.0.lock().unwrap().clone();
    let actions: Vec<CacheAction> = events.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![
            CacheAction::Added,
            CacheAction::Added,
            CacheAction::Added,
            CacheAction::Evicted,
            CacheAction::Evicted,
            CacheAction::Removed,
        ]
    );
    assert_eq!(events[3].key.x, 0);
    assert_eq!(events[3].metric, Some(7));
    assert_eq!(events[4].key.x, 1);
    assert!(events.iter().all(|e| e.byte_size == 400));
}
