//! Tile scheduler.
//!
//! # Deduplication
//!
//! At most one computation per tile key runs at any time. The first caller
//! for a key installs a `watch` slot in the in-flight map and spawns the
//! computation; every caller (the first included) waits on the slot and gets
//! the same `Arc<PixelBuffer>` or the same error. The slot is filled before
//! the in-flight marker is removed.
//!
//! # Tracked requests
//!
//! Each tracked tile maps to one queued [`Job::Tile`]. A request for a tile
//! that is already tracked joins the existing job instead of queueing another.
//! When the job completes, every joined request is updated under one lock and
//! the union of their listeners is notified once.
//!
//! # Locking
//!
//! Bookkeeping sits behind a `std::sync::Mutex` that is never held across an
//! await. It may be held while queueing on the primary pool (books, then
//! queue), never the other way around. Shutdown closes the pools under it, so
//! a tracked tile is either queued before the close or refused.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use super::job::{BatchJob, BatchOutcome, Job, JobId, TileJob};
use super::pool::WorkerPool;
use super::request::{listener_union, RequestHandle, TileEvent, TileListener, TileStatus};
use crate::cache::{TileKey, TileStore};
use crate::error::ComputeError;
use crate::raster::{ImageHandle, PixelBuffer};

/// Number of extra attempts after an out-of-memory failure.
///
/// The first retry follows releasing the owner's cached tiles, the second a
/// full store flush.
pub const OUT_OF_MEMORY_RETRIES: usize = 2;

/// Default number of tiles per batch job.
pub const DEFAULT_BATCH_SIZE: usize = 1;

/// Default number of prefetch workers.
pub const DEFAULT_PREFETCH_WORKERS: usize = 1;

// =============================================================================
// Configuration
// =============================================================================

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Primary pool size
    pub workers: usize,

    /// Prefetch pool size
    pub prefetch_workers: usize,

    /// Tiles per batch job for blocking and prefetch calls
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            prefetch_workers: DEFAULT_PREFETCH_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl SchedulerConfig {
    /// Check that every count is at least one.
    pub fn validate(&self) -> Result<(), ComputeError> {
        if self.workers == 0 {
            return Err(ComputeError::InvalidRequest(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.prefetch_workers == 0 {
            return Err(ComputeError::InvalidRequest(
                "prefetch_workers must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ComputeError::InvalidRequest(
                "batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One worker per available core.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// =============================================================================
// Shared State
// =============================================================================

type Slot = Option<Result<Arc<PixelBuffer>, ComputeError>>;

struct TrackedTile {
    job: JobId,
    requests: Vec<RequestHandle>,
    started: bool,
}

#[derive(Default)]
struct Books {
    in_flight: HashMap<TileKey, watch::Receiver<Slot>>,
    tracked: HashMap<TileKey, TrackedTile>,
}

/// State shared between the scheduler handle and its jobs.
pub(crate) struct Shared {
    store: Option<Arc<TileStore>>,
    books: Mutex<Books>,
}

/// Removes an in-flight marker when the computing task ends, even if the task
/// is torn down before filling the slot.
struct InFlightGuard {
    shared: Arc<Shared>,
    key: TileKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared.lock_books().in_flight.remove(&self.key);
    }
}

impl Shared {
    pub(crate) fn new(store: Option<Arc<TileStore>>) -> Self {
        Self {
            store,
            books: Mutex::new(Books::default()),
        }
    }

    fn lock_books(&self) -> MutexGuard<'_, Books> {
        self.books.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Compute one tile, joining any computation already running for it.
    pub(crate) async fn compute_one(
        self: &Arc<Self>,
        owner: &ImageHandle,
        x: u32,
        y: u32,
    ) -> Result<Arc<PixelBuffer>, ComputeError> {
        let key = TileKey::new(owner.id(), x, y);

        let (mut slot, computer) = {
            let mut books = self.lock_books();
            match books.in_flight.get(&key) {
                Some(slot) => (slot.clone(), None),
                None => {
                    let (tx, rx) = watch::channel(None);
                    books.in_flight.insert(key, rx.clone());
                    (rx, Some(tx))
                }
            }
        };

        if let Some(tx) = computer {
            let guard = InFlightGuard {
                shared: Arc::clone(self),
                key,
            };
            let owner = owner.clone();
            tokio::spawn(async move {
                let outcome = guard.shared.invoke(&owner, x, y).await;
                tx.send_replace(Some(outcome));
                drop(guard);
            });
        }

        let result = match slot.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Err(ComputeError::Shutdown)),
            // Computing task torn down before producing a result
            Err(_) => Err(ComputeError::Shutdown),
        };
        result
    }

    /// Serve a tile from the attached store, computing it on a miss.
    pub(crate) async fn obtain(
        self: &Arc<Self>,
        owner: &ImageHandle,
        x: u32,
        y: u32,
    ) -> Result<Arc<PixelBuffer>, ComputeError> {
        if let Some(ref store) = self.store {
            if let Some(tile) = store.lookup(owner, x, y).await {
                return Ok(tile);
            }
        }
        self.compute_one(owner, x, y).await
    }

    /// Run the producer with out-of-memory relief and cache the result.
    async fn invoke(
        &self,
        owner: &ImageHandle,
        x: u32,
        y: u32,
    ) -> Result<Arc<PixelBuffer>, ComputeError> {
        let mut attempt = 0;
        let tile = loop {
            match produce(owner, x, y).await {
                Ok(tile) => break Arc::new(tile),
                Err(err) if err.is_out_of_memory() && attempt < OUT_OF_MEMORY_RETRIES => {
                    warn!("{} (attempt {}), releasing cached tiles", err, attempt + 1);
                    self.relieve_memory(owner, attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        if let Some(ref store) = self.store {
            store.insert(owner, x, y, Arc::clone(&tile), None).await;
        }
        Ok(tile)
    }

    async fn relieve_memory(&self, owner: &ImageHandle, attempt: usize) {
        let Some(ref store) = self.store else {
            return;
        };
        if attempt == 0 {
            let released = store.remove_all(owner.id()).await;
            debug!("Released {} cached tile(s) of {}", released, owner.id());
        } else {
            store.flush().await;
            debug!("Flushed tile store");
        }
    }

    /// Mark a tracked tile as started. Returns `false` if nobody wants it.
    pub(crate) fn start_tracked(&self, key: TileKey, job: JobId) -> bool {
        let mut books = self.lock_books();
        match books.tracked.get_mut(&key) {
            Some(tile) if tile.job == job => {
                tile.started = true;
                for request in &tile.requests {
                    request.mark_processing(key.x, key.y);
                }
                true
            }
            _ => false,
        }
    }

    /// Deliver the outcome of a tracked tile to every joined request.
    pub(crate) fn finish_tracked(
        &self,
        key: TileKey,
        job: JobId,
        outcome: Result<Arc<PixelBuffer>, ComputeError>,
    ) {
        let terminal = match outcome {
            Ok(_) => TileStatus::Computed,
            Err(_) => TileStatus::Failed,
        };

        let requests: Vec<RequestHandle> = {
            let mut books = self.lock_books();
            let owned = matches!(books.tracked.get(&key), Some(tile) if tile.job == job);
            if !owned {
                return;
            }
            books
                .tracked
                .remove(&key)
                .map(|tile| tile.requests)
                .unwrap_or_default()
                .into_iter()
                .filter(|request| request.finish(key.x, key.y, terminal))
                .collect()
        };

        if requests.is_empty() {
            return;
        }

        let event = TileEvent {
            requests: requests.iter().map(RequestHandle::id).collect(),
            owner: key.owner,
            x: key.x,
            y: key.y,
        };
        for listener in listener_union(&requests) {
            match outcome {
                Ok(ref tile) => listener.tile_computed(&event, tile),
                Err(ref err) => listener.tile_failed(&event, err),
            }
        }
        for request in &requests {
            request.settle(1);
        }
    }

    /// Cancel every tracked tile. Used on shutdown.
    fn abandon_tracked(&self) {
        let cancelled: Vec<(RequestHandle, TileKey)> = {
            let mut books = self.lock_books();
            books
                .tracked
                .drain()
                .flat_map(|(key, tile)| tile.requests.into_iter().map(move |r| (r, key)))
                .filter(|(request, key)| request.finish(key.x, key.y, TileStatus::Cancelled))
                .collect()
        };

        for (request, key) in cancelled {
            request.announce_cancelled(key.x, key.y);
        }
    }
}

async fn produce(owner: &ImageHandle, x: u32, y: u32) -> Result<PixelBuffer, ComputeError> {
    let owner = owner.clone();
    tokio::task::spawn_blocking(move || owner.compute_tile(x, y))
        .await
        .unwrap_or_else(|e| {
            Err(ComputeError::Producer(format!(
                "tile ({}, {}) producer task failed: {}",
                x, y, e
            )))
        })
}

// =============================================================================
// Tile Scheduler
// =============================================================================

/// Deduplicating, prioritized tile computation.
///
/// Must be created inside a tokio runtime: worker pools are tokio tasks.
pub struct TileScheduler {
    shared: Arc<Shared>,
    primary: WorkerPool,
    prefetch: WorkerPool,
    batch_size: usize,
}

impl TileScheduler {
    /// Start the worker pools. Successful computations are inserted into
    /// `store` when one is given.
    pub fn new(
        config: &SchedulerConfig,
        store: Option<Arc<TileStore>>,
    ) -> Result<Self, ComputeError> {
        config.validate()?;

        debug!(
            "Starting scheduler: {} worker(s), {} prefetch worker(s), batch size {}",
            config.workers, config.prefetch_workers, config.batch_size
        );

        Ok(Self {
            shared: Arc::new(Shared::new(store)),
            primary: WorkerPool::new("primary", config.workers),
            prefetch: WorkerPool::new("prefetch", config.prefetch_workers),
            batch_size: config.batch_size,
        })
    }

    fn ensure_open(&self) -> Result<(), ComputeError> {
        if self.primary.is_closed() {
            Err(ComputeError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Compute one tile on the calling task, deduplicated process-wide.
    ///
    /// Concurrent callers for the same tile share one producer invocation and
    /// receive the same buffer or the same error.
    pub async fn compute_one(
        &self,
        owner: &ImageHandle,
        x: u32,
        y: u32,
    ) -> Result<Arc<PixelBuffer>, ComputeError> {
        self.ensure_open()?;
        self.shared.compute_one(owner, x, y).await
    }

    /// Compute tiles on the primary pool and wait for all of them.
    ///
    /// Tiles are split into batch jobs of the configured size. A failure only
    /// aborts the remaining tiles of its own job. Every job is awaited before
    /// returning; the result holds the tiles in request order or the first
    /// error in job order.
    pub async fn schedule_blocking(
        &self,
        owner: &ImageHandle,
        coords: &[(u32, u32)],
    ) -> Result<Vec<Arc<PixelBuffer>>, ComputeError> {
        self.ensure_open()?;
        if coords.is_empty() {
            return Err(ComputeError::InvalidRequest(
                "empty tile coordinate list".to_string(),
            ));
        }

        let replies: Vec<oneshot::Receiver<BatchOutcome>> = coords
            .chunks(self.batch_size)
            .map(|chunk| {
                let (tx, rx) = oneshot::channel();
                let job = BatchJob::new(
                    Arc::clone(&self.shared),
                    owner.clone(),
                    chunk.to_vec(),
                    Some(tx),
                );
                // A rejected job drops its sender; the wait below sees that
                self.primary.submit(Job::Batch(job));
                rx
            })
            .collect();

        let mut tiles = Vec::with_capacity(coords.len());
        let mut first_error = None;

        for reply in replies {
            match reply.await {
                Ok(Ok(batch)) => tiles.extend(batch),
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(_) => {
                    first_error.get_or_insert(ComputeError::Shutdown);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(tiles),
        }
    }

    /// Queue tiles and return immediately with a handle to track them.
    ///
    /// A tile already tracked for another request joins that request's job.
    pub fn schedule_tracked(
        &self,
        owner: &ImageHandle,
        coords: &[(u32, u32)],
        listeners: Vec<Arc<dyn TileListener>>,
    ) -> Result<RequestHandle, ComputeError> {
        self.ensure_open()?;
        if coords.is_empty() {
            return Err(ComputeError::InvalidRequest(
                "empty tile coordinate list".to_string(),
            ));
        }

        let request = RequestHandle::new(owner.id(), coords, listeners);
        let mut merged = 0usize;
        let mut rejected = Vec::new();

        {
            let mut books = self.shared.lock_books();
            // Pools are closed under this lock, so the answer holds until we unlock
            if self.primary.is_closed() {
                return Err(ComputeError::Shutdown);
            }

            for &(x, y) in request.coords() {
                let key = TileKey::new(owner.id(), x, y);

                if let Some(tile) = books.tracked.get_mut(&key) {
                    tile.requests.push(request.clone());
                    if tile.started {
                        request.mark_processing(x, y);
                    }
                    merged += 1;
                    continue;
                }

                let job = TileJob::new(Arc::clone(&self.shared), owner.clone(), x, y);
                books.tracked.insert(
                    key,
                    TrackedTile {
                        job: job.id(),
                        requests: vec![request.clone()],
                        started: false,
                    },
                );
                if !self.primary.submit(Job::Tile(job)) {
                    books.tracked.remove(&key);
                    if request.finish(x, y, TileStatus::Cancelled) {
                        rejected.push((x, y));
                    }
                }
            }
        }

        for &(x, y) in &rejected {
            request.announce_cancelled(x, y);
        }

        debug!(
            "{} tracks {} tile(s) of {} ({} merged)",
            request.id(),
            request.coords().len(),
            owner.id(),
            merged
        );
        Ok(request)
    }

    /// Queue tiles on the prefetch pool without waiting or notifying.
    ///
    /// Results land in the attached store; failures are only logged.
    pub fn prefetch(&self, owner: &ImageHandle, coords: &[(u32, u32)]) -> Result<(), ComputeError> {
        self.ensure_open()?;
        if coords.is_empty() {
            return Err(ComputeError::InvalidRequest(
                "empty tile coordinate list".to_string(),
            ));
        }

        for chunk in coords.chunks(self.batch_size) {
            let job = BatchJob::new(Arc::clone(&self.shared), owner.clone(), chunk.to_vec(), None);
            self.prefetch.submit(Job::Batch(job));
        }
        Ok(())
    }

    /// Cancel tiles of a tracked request (all of them when `coords` is `None`).
    ///
    /// Each selected tile still pending for `request` is detached from its job
    /// and marked cancelled, and the request's listeners are told. A job no
    /// other request wants is removed from the queue if it has not started;
    /// running jobs are never interrupted. Returns the number of tiles
    /// cancelled.
    pub fn cancel(&self, request: &RequestHandle, coords: Option<&[(u32, u32)]>) -> usize {
        let selected = coords.unwrap_or_else(|| request.coords());
        let mut cancelled = Vec::new();

        {
            let mut books = self.shared.lock_books();
            for &(x, y) in selected {
                if !request.covers(x, y) {
                    continue;
                }
                let key = TileKey::new(request.owner(), x, y);
                let Some(tile) = books.tracked.get_mut(&key) else {
                    continue;
                };

                let before = tile.requests.len();
                tile.requests.retain(|r| r.id() != request.id());
                if tile.requests.len() == before {
                    continue;
                }

                if tile.requests.is_empty() {
                    if !tile.started && self.primary.cancel(tile.job) {
                        debug!("Dequeued {} for {}", tile.job, key);
                    }
                    books.tracked.remove(&key);
                }

                if request.finish(x, y, TileStatus::Cancelled) {
                    cancelled.push((x, y));
                }
            }
        }

        for &(x, y) in &cancelled {
            request.announce_cancelled(x, y);
        }
        cancelled.len()
    }

    /// Resize the primary pool.
    pub fn set_worker_count(&self, workers: usize) -> Result<(), ComputeError> {
        if workers == 0 {
            return Err(ComputeError::InvalidRequest(
                "workers must be at least 1".to_string(),
            ));
        }
        self.primary.resize(workers);
        Ok(())
    }

    /// Resize the prefetch pool.
    pub fn set_prefetch_worker_count(&self, workers: usize) -> Result<(), ComputeError> {
        if workers == 0 {
            return Err(ComputeError::InvalidRequest(
                "prefetch_workers must be at least 1".to_string(),
            ));
        }
        self.prefetch.resize(workers);
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.primary.workers()
    }

    pub fn prefetch_worker_count(&self) -> usize {
        self.prefetch.workers()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Jobs waiting on the primary pool.
    pub fn queued_jobs(&self) -> usize {
        self.primary.queued()
    }

    /// Jobs waiting on the prefetch pool.
    pub fn queued_prefetch_jobs(&self) -> usize {
        self.prefetch.queued()
    }

    /// Tiles currently being computed.
    pub fn in_flight(&self) -> usize {
        self.shared.lock_books().in_flight.len()
    }

    /// Tiles with at least one tracked request waiting on them.
    pub fn tracked_tiles(&self) -> usize {
        self.shared.lock_books().tracked.len()
    }

    /// Stop both pools and cancel every tracked tile.
    ///
    /// Queued jobs are dropped, so blocking callers waiting on them get
    /// [`ComputeError::Shutdown`]. Running jobs finish but their tracked
    /// requests are already cancelled.
    pub fn shutdown(&self) {
        {
            let _books = self.shared.lock_books();
            if self.primary.is_closed() {
                return;
            }
            self.primary.close();
            self.prefetch.close();
        }
        self.shared.abandon_tracked();
        debug!("Scheduler shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.primary.is_closed()
    }
}

impl Drop for TileScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
