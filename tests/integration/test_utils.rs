//! Test utilities for integration tests.
//!
//! Producers that count, record, block or fail on demand, and a listener that
//! records every notification.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tilecache::{
    ComputeError, PixelBuffer, SchedulerConfig, ServiceConfig, StoreConfig, TileEvent,
    TileLayout, TileListener, TileProducer,
};

// =============================================================================
// Tiles
// =============================================================================

/// 8x8 gray tile (64 bytes) filled with `value`.
pub fn small_tile(value: u8) -> PixelBuffer {
    PixelBuffer::filled(TileLayout::new(8, 8, 1), value)
}

/// Tile value used by the producers below.
pub fn tile_value(x: u32, y: u32) -> u8 {
    (x * 16 + y) as u8
}

// =============================================================================
// Producers
// =============================================================================

/// Counts producer invocations.
pub fn counting_producer(calls: Arc<AtomicUsize>) -> impl TileProducer {
    move |x: u32, y: u32| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(small_tile(tile_value(x, y)))
    }
}

/// Sleeps before producing, to widen race windows.
pub fn slow_producer(calls: Arc<AtomicUsize>, delay: Duration) -> impl TileProducer {
    move |x: u32, y: u32| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(delay);
        Ok(small_tile(tile_value(x, y)))
    }
}

/// Records the order tiles are produced in.
pub fn recording_producer(log: Arc<Mutex<Vec<(u32, u32)>>>, gate: Gate) -> impl TileProducer {
    move |x: u32, y: u32| {
        gate.pass();
        log.lock().unwrap().push((x, y));
        Ok(small_tile(tile_value(x, y)))
    }
}

/// Fails for one coordinate and records every call.
pub fn failing_producer(
    log: Arc<Mutex<Vec<(u32, u32)>>>,
    fail_at: (u32, u32),
) -> impl TileProducer {
    move |x: u32, y: u32| -> Result<PixelBuffer, ComputeError> {
        log.lock().unwrap().push((x, y));
        if (x, y) == fail_at {
            return Err(ComputeError::Producer(format!("bad tile ({}, {})", x, y)));
        }
        Ok(small_tile(tile_value(x, y)))
    }
}

/// Reports out-of-memory for the first `failures` calls.
pub fn flaky_producer(calls: Arc<AtomicUsize>, failures: usize) -> impl TileProducer {
    move |x: u32, y: u32| -> Result<PixelBuffer, ComputeError> {
        let attempt = calls.fetch_add(1, Ordering::SeqCst);
        if attempt < failures {
            return Err(ComputeError::OutOfMemory { x, y });
        }
        Ok(small_tile(tile_value(x, y)))
    }
}

// =============================================================================
// Gate
// =============================================================================

/// Blocks producer threads until opened. Stays open afterwards.
#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let (lock, cvar) = &*self.state;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    /// Block the current thread until the gate is open.
    pub fn pass(&self) {
        let (lock, cvar) = &*self.state;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
    }
}

/// Gated producer that counts invocations.
pub fn gated_producer(calls: Arc<AtomicUsize>, gate: Gate) -> impl TileProducer {
    move |x: u32, y: u32| {
        gate.pass();
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(small_tile(tile_value(x, y)))
    }
}

// =============================================================================
// Listener
// =============================================================================

/// What a listener was told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Computed(TileEvent),
    Failed(TileEvent),
    Cancelled(TileEvent),
}

#[derive(Default)]
pub struct RecordingListener {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn computed_at(&self, x: u32, y: u32) -> Vec<TileEvent> {
        self.notices()
            .into_iter()
            .filter_map(|notice| match notice {
                Notice::Computed(event) if event.x == x && event.y == y => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn cancelled_count(&self) -> usize {
        self.notices()
            .iter()
            .filter(|notice| matches!(notice, Notice::Cancelled(_)))
            .count()
    }
}

impl TileListener for RecordingListener {
    fn tile_computed(&self, event: &TileEvent, _tile: &Arc<PixelBuffer>) {
        self.notices.lock().unwrap().push(Notice::Computed(event.clone()));
    }

    fn tile_failed(&self, event: &TileEvent, _error: &ComputeError) {
        self.notices.lock().unwrap().push(Notice::Failed(event.clone()));
    }

    fn tile_cancelled(&self, event: &TileEvent) {
        self.notices.lock().unwrap().push(Notice::Cancelled(event.clone()));
    }
}

// =============================================================================
// Configuration and polling
// =============================================================================

pub fn scheduler_config(workers: usize, batch_size: usize) -> SchedulerConfig {
    SchedulerConfig {
        workers,
        prefetch_workers: 1,
        batch_size,
    }
}

pub fn service_config(workers: usize, batch_size: usize) -> ServiceConfig {
    ServiceConfig {
        store: StoreConfig {
            capacity: 1 << 20,
            ..StoreConfig::default()
        },
        scheduler: scheduler_config(workers, batch_size),
    }
}

/// Poll `condition` every 5ms until it holds or five seconds pass.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
