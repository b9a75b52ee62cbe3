//! Scheduler integration tests.
//!
//! Tests verify:
//! - Concurrent requests for one tile share one producer call
//! - Overlapping tracked requests share jobs and notify listeners once
//! - Cancellation detaches queued tiles without running them
//! - Tracked tiles outrank blocking batches on the primary pool
//! - A batch failure only aborts the rest of its own batch
//! - Shutdown cancels tracked tiles and fails blocked callers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tilecache::{ComputeError, ImageHandle, TileScheduler, TileStatus, TileStore};

use super::test_utils::{
    counting_producer, eventually, failing_producer, gated_producer, recording_producer,
    scheduler_config, slow_producer, tile_value, Gate, Notice, RecordingListener,
};

// =============================================================================
// Deduplication
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_compute_one_calls_producer_once() {
    let scheduler = Arc::new(TileScheduler::new(&scheduler_config(2, 1), None).unwrap());
    let calls = Arc::new(AtomicUsize::new(0));
    let image = ImageHandle::new(slow_producer(calls.clone(), Duration::from_millis(100)));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let scheduler = scheduler.clone();
        let image = image.clone();
        handles.push(tokio::spawn(async move {
            scheduler.compute_one(&image, 4, 2).await
        }));
    }

    let mut tiles = Vec::new();
    for handle in handles {
        tiles.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(tiles.iter().all(|tile| Arc::ptr_eq(tile, &tiles[0])));
    assert_eq!(tiles[0].data()[0], tile_value(4, 2));
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocking_and_tracked_share_one_computation() {
    let scheduler = Arc::new(TileScheduler::new(&scheduler_config(4, 1), None).unwrap());
    let calls = Arc::new(AtomicUsize::new(0));
    let image = ImageHandle::new(slow_producer(calls.clone(), Duration::from_millis(100)));

    let request = scheduler.schedule_tracked(&image, &[(0, 0)], Vec::new()).unwrap();
    let tiles = scheduler.schedule_blocking(&image, &[(0, 0)]).await.unwrap();
    request.wait().await;

    assert_eq!(tiles.len(), 1);
    assert_eq!(request.status(0, 0), Some(TileStatus::Computed));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Tracked Requests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_requests_merge() {
    let scheduler = TileScheduler::new(&scheduler_config(1, 1), None).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Gate::new();
    let image = ImageHandle::new(gated_producer(calls.clone(), gate.clone()));
    let first_listener = RecordingListener::new();
    let second_listener = RecordingListener::new();

    let first = scheduler
        .schedule_tracked(&image, &[(0, 0), (1, 0)], vec![first_listener.clone()])
        .unwrap();
    let second = scheduler
        .schedule_tracked(&image, &[(0, 0), (0, 1)], vec![second_listener.clone()])
        .unwrap();

    // (0,0) is tracked once for both requests
    assert_eq!(scheduler.tracked_tiles(), 3);

    gate.open();
    first.wait().await;
    second.wait().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Each request's listener hears about the shared tile exactly once
    for listener in [&first_listener, &second_listener] {
        let shared = listener.computed_at(0, 0);
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].requests.len(), 2);
        assert!(shared[0].requests.contains(&first.id()));
        assert!(shared[0].requests.contains(&second.id()));
        assert_eq!(listener.notices().len(), 2);
    }

    assert_eq!(first_listener.computed_at(1, 0)[0].requests, vec![first.id()]);
    assert!(first_listener.computed_at(0, 1).is_empty());
    assert_eq!(second_listener.computed_at(0, 1)[0].requests, vec![second.id()]);
    assert!(second_listener.computed_at(1, 0).is_empty());

    assert!(first
        .statuses()
        .iter()
        .chain(second.statuses().iter())
        .all(|(_, status)| *status == TileStatus::Computed));
    assert_eq!(scheduler.tracked_tiles(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_listener_shared_by_merged_requests_is_called_once() {
    let scheduler = TileScheduler::new(&scheduler_config(1, 1), None).unwrap();
    let gate = Gate::new();
    let image = ImageHandle::new(gated_producer(Arc::new(AtomicUsize::new(0)), gate.clone()));
    let listener = RecordingListener::new();

    let first = scheduler
        .schedule_tracked(&image, &[(0, 0), (1, 0)], vec![listener.clone()])
        .unwrap();
    let second = scheduler
        .schedule_tracked(&image, &[(0, 0), (0, 1)], vec![listener.clone()])
        .unwrap();

    gate.open();
    first.wait().await;
    second.wait().await;

    let shared = listener.computed_at(0, 0);
    assert_eq!(shared.len(), 1, "shared tile must be announced once");
    assert_eq!(shared[0].requests.len(), 2);
    assert_eq!(listener.notices().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_before_start_skips_producer() {
    let scheduler = TileScheduler::new(&scheduler_config(1, 1), None).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Gate::new();
    let image = ImageHandle::new(gated_producer(calls.clone(), gate.clone()));

    // Occupy the only worker
    let busy = scheduler.schedule_tracked(&image, &[(0, 0)], Vec::new()).unwrap();
    assert!(eventually(|| scheduler.in_flight() == 1).await);

    let listener = RecordingListener::new();
    let request = scheduler
        .schedule_tracked(&image, &[(1, 0), (2, 0)], vec![listener.clone()])
        .unwrap();
    assert_eq!(scheduler.queued_jobs(), 2);

    assert_eq!(scheduler.cancel(&request, Some(&[(1, 0)])), 1);
    assert_eq!(scheduler.queued_jobs(), 1);
    assert_eq!(request.status(1, 0), Some(TileStatus::Cancelled));
    assert_eq!(request.remaining(), 1);
    assert_eq!(listener.cancelled_count(), 1);

    // Already terminal
    assert_eq!(scheduler.cancel(&request, Some(&[(1, 0)])), 0);
    // Not part of the request
    assert_eq!(scheduler.cancel(&request, Some(&[(9, 9)])), 0);

    gate.open();
    busy.wait().await;
    request.wait().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(request.status(2, 0), Some(TileStatus::Computed));
    assert!(listener.computed_at(1, 0).is_empty());
    assert_eq!(listener.computed_at(2, 0).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_keeps_job_for_other_requests() {
    let scheduler = TileScheduler::new(&scheduler_config(1, 1), None).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Gate::new();
    let image = ImageHandle::new(gated_producer(calls.clone(), gate.clone()));

    let busy = scheduler.schedule_tracked(&image, &[(5, 5)], Vec::new()).unwrap();
    assert!(eventually(|| scheduler.in_flight() == 1).await);

    let keep = RecordingListener::new();
    let drop_listener = RecordingListener::new();
    let kept = scheduler
        .schedule_tracked(&image, &[(3, 3)], vec![keep.clone()])
        .unwrap();
    let dropped = scheduler
        .schedule_tracked(&image, &[(3, 3)], vec![drop_listener.clone()])
        .unwrap();

    assert_eq!(scheduler.cancel(&dropped, None), 1);
    assert!(dropped.is_complete());
    assert_eq!(scheduler.queued_jobs(), 1);

    gate.open();
    busy.wait().await;
    kept.wait().await;

    assert_eq!(kept.status(3, 3), Some(TileStatus::Computed));
    assert_eq!(keep.computed_at(3, 3)[0].requests, vec![kept.id()]);
    assert_eq!(
        drop_listener.notices(),
        vec![Notice::Cancelled(tilecache::TileEvent {
            requests: vec![dropped.id()],
            owner: image.id(),
            x: 3,
            y: 3,
        })]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_tile_reaches_listener() {
    let scheduler = TileScheduler::new(&scheduler_config(2, 1), None).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let image = ImageHandle::new(failing_producer(log, (1, 1)));
    let listener = RecordingListener::new();

    let request = scheduler
        .schedule_tracked(&image, &[(0, 0), (1, 1)], vec![listener.clone()])
        .unwrap();
    request.wait().await;

    assert_eq!(request.status(0, 0), Some(TileStatus::Computed));
    assert_eq!(request.status(1, 1), Some(TileStatus::Failed));
    assert!(listener
        .notices()
        .iter()
        .any(|notice| matches!(notice, Notice::Failed(event) if (event.x, event.y) == (1, 1))));
}

// =============================================================================
// Priority
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tracked_tiles_outrank_blocking_batches() {
    let scheduler = Arc::new(TileScheduler::new(&scheduler_config(1, 1), None).unwrap());
    let log = Arc::new(Mutex::new(Vec::new()));
    let gate = Gate::new();
    let image = ImageHandle::new(recording_producer(log.clone(), gate.clone()));

    let first = scheduler.schedule_tracked(&image, &[(0, 0)], Vec::new()).unwrap();
    assert!(eventually(|| scheduler.in_flight() == 1).await);

    let blocking = {
        let scheduler = scheduler.clone();
        let image = image.clone();
        tokio::spawn(async move { scheduler.schedule_blocking(&image, &[(1, 0)]).await })
    };
    assert!(eventually(|| scheduler.queued_jobs() == 1).await);

    let late = scheduler.schedule_tracked(&image, &[(2, 0)], Vec::new()).unwrap();
    assert_eq!(scheduler.queued_jobs(), 2);

    gate.open();
    first.wait().await;
    late.wait().await;
    blocking.await.unwrap().unwrap();

    assert_eq!(*log.lock().unwrap(), vec![(0, 0), (2, 0), (1, 0)]);
}

// =============================================================================
// Blocking Batches
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_spares_other_batches() {
    let store = Arc::new(TileStore::new(1 << 20));
    let scheduler = TileScheduler::new(&scheduler_config(1, 1), Some(store.clone())).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let image = ImageHandle::new(failing_producer(log.clone(), (1, 0)));

    let result = scheduler
        .schedule_blocking(&image, &[(0, 0), (1, 0), (2, 0)])
        .await;

    assert!(matches!(result, Err(ComputeError::Producer(_))));
    // Every batch ran to completion before the call returned
    assert_eq!(log.lock().unwrap().len(), 3);
    assert!(store.contains(image.id(), 0, 0).await);
    assert!(!store.contains(image.id(), 1, 0).await);
    assert!(store.contains(image.id(), 2, 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_aborts_rest_of_its_batch() {
    let store = Arc::new(TileStore::new(1 << 20));
    let scheduler = TileScheduler::new(&scheduler_config(1, 3), Some(store.clone())).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let image = ImageHandle::new(failing_producer(log.clone(), (1, 0)));

    let result = scheduler
        .schedule_blocking(&image, &[(0, 0), (1, 0), (2, 0)])
        .await;

    assert!(matches!(result, Err(ComputeError::Producer(_))));
    assert_eq!(*log.lock().unwrap(), vec![(0, 0), (1, 0)]);
    assert!(!store.contains(image.id(), 2, 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocking_skips_cached_tiles() {
    let store = Arc::new(TileStore::new(1 << 20));
    let scheduler = TileScheduler::new(&scheduler_config(2, 2), Some(store.clone())).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let image = ImageHandle::new(counting_producer(calls.clone()));

    let coords = [(0, 0), (1, 0), (0, 1), (1, 1)];
    let first = scheduler.schedule_blocking(&image, &coords).await.unwrap();
    let second = scheduler.schedule_blocking(&image, &coords).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    for (a, b) in first.iter().zip(&second) {
        assert!(Arc::ptr_eq(a, b));
    }
    assert_eq!(store.hit_count().await, 4);
}

// =============================================================================
// Prefetch
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_prefetch_warms_store() {
    let store = Arc::new(TileStore::new(1 << 20));
    let scheduler = TileScheduler::new(&scheduler_config(1, 2), Some(store.clone())).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let image = ImageHandle::new(counting_producer(calls.clone()));

    scheduler
        .prefetch(&image, &[(0, 0), (1, 0), (2, 0)])
        .unwrap();

    let id = image.id();
    let mut warmed = false;
    for _ in 0..1000 {
        if store.tile_count().await == 3 {
            warmed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(warmed);
    assert!(store.contains(id, 2, 0).await);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_cancels_tracked_and_fails_blocked_callers() {
    let scheduler = Arc::new(TileScheduler::new(&scheduler_config(1, 1), None).unwrap());
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Gate::new();
    let image = ImageHandle::new(gated_producer(calls.clone(), gate.clone()));
    let listener = RecordingListener::new();

    let request = scheduler
        .schedule_tracked(&image, &[(0, 0), (1, 0)], vec![listener.clone()])
        .unwrap();
    assert!(eventually(|| scheduler.in_flight() == 1).await);

    let blocking = {
        let scheduler = scheduler.clone();
        let image = image.clone();
        tokio::spawn(async move { scheduler.schedule_blocking(&image, &[(7, 7)]).await })
    };
    assert!(eventually(|| scheduler.queued_jobs() == 2).await);

    scheduler.shutdown();

    assert!(request.is_complete());
    assert_eq!(request.status(0, 0), Some(TileStatus::Cancelled));
    assert_eq!(request.status(1, 0), Some(TileStatus::Cancelled));
    assert_eq!(listener.cancelled_count(), 2);
    assert!(matches!(
        blocking.await.unwrap(),
        Err(ComputeError::Shutdown)
    ));

    gate.open();
    assert!(matches!(
        scheduler.compute_one(&image, 0, 0).await,
        Err(ComputeError::Shutdown)
    ));
    assert!(matches!(
        scheduler.schedule_tracked(&image, &[(0, 0)], Vec::new()),
        Err(ComputeError::Shutdown)
    ));
}
