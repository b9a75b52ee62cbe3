//! Background purging of tiles whose owner became unreachable.
//!
//! Images created with a [`ReclaimQueue`] announce themselves on it when
//! their last handle is dropped. The [`Reaper`] task drains the queue and
//! removes every tile of each announced owner from both store tiers.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tilecache::cache::{Reaper, TileStore};
//! use tilecache::raster::{ImageHandle, PixelBuffer, TileLayout};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(TileStore::new(1 << 20));
//!     let reaper = Reaper::spawn(store.clone());
//!
//!     let image = ImageHandle::with_reclaim(
//!         Arc::new(|_x, _y| Ok(PixelBuffer::filled(TileLayout::rgb8(8), 0))),
//!         reaper.queue(),
//!     );
//!     drop(image);
//!
//!     // Pending announcements are processed before shutdown returns
//!     reaper.shutdown().await;
//! }
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::TileStore;
use crate::raster::OwnerId;

/// Sending side of the reclamation queue.
///
/// Cheap to clone. Announcing after the reaper has stopped is a no-op.
#[derive(Debug, Clone)]
pub struct ReclaimQueue {
    tx: mpsc::UnboundedSender<OwnerId>,
}

impl ReclaimQueue {
    /// Announce that `owner` is no longer reachable.
    pub(crate) fn notify(&self, owner: OwnerId) {
        if self.tx.send(owner).is_err() {
            debug!("Reaper stopped; tiles of {} left to eviction", owner);
        }
    }
}

/// Handle to the background reaper task.
pub struct Reaper {
    queue: ReclaimQueue,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Spawn the reaper on the current tokio runtime.
    pub fn spawn(store: Arc<TileStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run(store, rx, shutdown.clone()));

        Self {
            queue: ReclaimQueue { tx },
            shutdown,
            task: Some(task),
        }
    }

    /// Queue to hand to new image handles.
    pub fn queue(&self) -> ReclaimQueue {
        self.queue.clone()
    }

    /// Stop the reaper after draining announcements already queued.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Reaper task failed: {}", e);
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(
    store: Arc<TileStore>,
    mut rx: mpsc::UnboundedReceiver<OwnerId>,
    shutdown: CancellationToken,
) {
    debug!("Reaper started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            owner = rx.recv() => match owner {
                Some(owner) => {
                    store.reap(owner).await;
                }
                // Unreachable while the reaper holds a queue clone
                None => break,
            },
        }
    }

    let mut drained = 0usize;
    while let Ok(owner) = rx.try_recv() {
        store.reap(owner).await;
        drained += 1;
    }

    info!("Reaper stopped ({} pending owner(s) drained)", drained);
}
