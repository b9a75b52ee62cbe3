//! Units of work queued on worker pools.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::engine::Shared;
use crate::cache::TileKey;
use crate::error::ComputeError;
use crate::raster::{ImageHandle, PixelBuffer};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Queue priority. Later variants are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobPriority {
    /// Bulk computation for blocking and prefetch calls
    Batch,
    /// A single tile serving tracked requests
    Tile,
}

/// Result of a batch job, in coordinate order.
pub(crate) type BatchOutcome = Result<Vec<Arc<PixelBuffer>>, ComputeError>;

/// One tile shared by every tracked request that merged into it.
pub(crate) struct TileJob {
    id: JobId,
    owner: ImageHandle,
    x: u32,
    y: u32,
    shared: Arc<Shared>,
}

impl TileJob {
    pub(crate) fn new(shared: Arc<Shared>, owner: ImageHandle, x: u32, y: u32) -> Self {
        Self {
            id: JobId::next(),
            owner,
            x,
            y,
            shared,
        }
    }

    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    async fn execute(self) {
        let key = TileKey::new(self.owner.id(), self.x, self.y);

        // Every request may have been cancelled while the job sat in the queue
        if !self.shared.start_tracked(key, self.id) {
            debug!("{} for {} dropped: no request left", self.id, key);
            return;
        }

        let outcome = self.shared.obtain(&self.owner, self.x, self.y).await;
        self.shared.finish_tracked(key, self.id, outcome);
    }
}

/// Consecutive tiles of one blocking or prefetch call.
///
/// The first failure aborts this job's remaining tiles. Without a reply
/// channel the job is a prefetch: results only land in the store.
pub(crate) struct BatchJob {
    id: JobId,
    owner: ImageHandle,
    coords: Vec<(u32, u32)>,
    shared: Arc<Shared>,
    reply: Option<oneshot::Sender<BatchOutcome>>,
}

impl BatchJob {
    pub(crate) fn new(
        shared: Arc<Shared>,
        owner: ImageHandle,
        coords: Vec<(u32, u32)>,
        reply: Option<oneshot::Sender<BatchOutcome>>,
    ) -> Self {
        Self {
            id: JobId::next(),
            owner,
            coords,
            shared,
            reply,
        }
    }

    async fn execute(self) {
        let mut tiles = Vec::with_capacity(self.coords.len());
        let mut outcome = Ok(());

        for &(x, y) in &self.coords {
            match self.shared.obtain(&self.owner, x, y).await {
                Ok(tile) => tiles.push(tile),
                Err(err) => {
                    if self.reply.is_none() {
                        warn!("Prefetch of {} tile ({}, {}) failed: {}", self.owner.id(), x, y, err);
                    }
                    outcome = Err(err);
                    break;
                }
            }
        }

        debug!(
            "{} finished {}/{} tile(s) of {}",
            self.id,
            tiles.len(),
            self.coords.len(),
            self.owner.id()
        );

        if let Some(reply) = self.reply {
            // The caller may have gone away
            let _ = reply.send(outcome.map(|()| tiles));
        }
    }
}

/// A queued unit of work.
pub(crate) enum Job {
    Tile(TileJob),
    Batch(BatchJob),
}

impl Job {
    pub(crate) fn id(&self) -> JobId {
        match self {
            Job::Tile(job) => job.id,
            Job::Batch(job) => job.id,
        }
    }

    pub(crate) fn priority(&self) -> JobPriority {
        match self {
            Job::Tile(_) => JobPriority::Tile,
            Job::Batch(_) => JobPriority::Batch,
        }
    }

    pub(crate) async fn execute(self) {
        match self {
            Job::Tile(job) => job.execute().await,
            Job::Batch(job) => job.execute().await,
        }
    }
}
