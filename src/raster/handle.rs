//! Owning image handles and the tile producer capability.
//!
//! Every image whose tiles pass through the cache is represented by an
//! [`ImageHandle`]. The handle carries a process-unique [`OwnerId`] used in
//! cache keys, the [`TileProducer`] that computes the image's tiles, and a
//! flag telling the cache whether evicted tiles are worth spilling to disk.
//!
//! The cache only ever holds a [`WeakImage`]. When the last handle clone is
//! dropped, the image is announced on its reclamation queue (if any) so the
//! reaper can purge its tiles.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::cache::ReclaimQueue;
use crate::error::ComputeError;

use super::buffer::PixelBuffer;

/// Global counter for owner identities. Starts at 1 and is never reused.
static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an owning image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl OwnerId {
    fn next() -> Self {
        Self(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw identity value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image-{}", self.0)
    }
}

/// Capability that computes the pixels of one tile.
///
/// Implementations must be safe to call concurrently for different tiles and
/// must tolerate being called again after a failure.
pub trait TileProducer: Send + Sync + 'static {
    /// Compute tile `(x, y)`.
    fn compute_tile(&self, x: u32, y: u32) -> Result<PixelBuffer, ComputeError>;
}

impl<F> TileProducer for F
where
    F: Fn(u32, u32) -> Result<PixelBuffer, ComputeError> + Send + Sync + 'static,
{
    fn compute_tile(&self, x: u32, y: u32) -> Result<PixelBuffer, ComputeError> {
        self(x, y)
    }
}

struct ImageInner {
    id: OwnerId,
    producer: Arc<dyn TileProducer>,
    persistent: AtomicBool,
    reclaim: Option<ReclaimQueue>,
}

impl Drop for ImageInner {
    fn drop(&mut self) {
        if let Some(queue) = self.reclaim.take() {
            queue.notify(self.id);
        }
    }
}

/// Shared handle to an owning image.
///
/// Cloning is cheap. The image stays reachable while at least one clone lives.
#[derive(Clone)]
pub struct ImageHandle {
    inner: Arc<ImageInner>,
}

impl ImageHandle {
    /// Create a handle that is not tied to any reaper.
    ///
    /// Tiles of such an image are only purged by explicit removal or eviction.
    pub fn new(producer: impl TileProducer) -> Self {
        Self::build(Arc::new(producer), None)
    }

    /// Create a handle whose last drop enqueues the image on `queue`.
    pub fn with_reclaim(producer: Arc<dyn TileProducer>, queue: ReclaimQueue) -> Self {
        Self::build(producer, Some(queue))
    }

    fn build(producer: Arc<dyn TileProducer>, reclaim: Option<ReclaimQueue>) -> Self {
        Self {
            inner: Arc::new(ImageInner {
                id: OwnerId::next(),
                producer,
                persistent: AtomicBool::new(false),
                reclaim,
            }),
        }
    }

    /// The owner identity used in cache keys.
    pub fn id(&self) -> OwnerId {
        self.inner.id
    }

    /// Whether evicted tiles of this image should be spilled to disk.
    pub fn is_persistent(&self) -> bool {
        self.inner.persistent.load(Ordering::Relaxed)
    }

    /// Mark this image's tiles as worth persisting (or not).
    pub fn set_persistent(&self, persistent: bool) {
        self.inner.persistent.store(persistent, Ordering::Relaxed);
    }

    /// Builder-style variant of [`set_persistent`](Self::set_persistent).
    pub fn persistent(self, persistent: bool) -> Self {
        self.set_persistent(persistent);
        self
    }

    /// Invoke the producer for tile `(x, y)` on the current thread.
    pub fn compute_tile(&self, x: u32, y: u32) -> Result<PixelBuffer, ComputeError> {
        self.inner.producer.compute_tile(x, y)
    }

    /// Non-owning reference to this image.
    pub fn downgrade(&self) -> WeakImage {
        WeakImage {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageHandle")
            .field("id", &self.inner.id)
            .field("persistent", &self.is_persistent())
            .finish()
    }
}

/// Weak back-reference from cached tiles to their owner.
#[derive(Clone)]
pub struct WeakImage {
    id: OwnerId,
    inner: Weak<ImageInner>,
}

impl WeakImage {
    /// Owner identity, available even after the image is gone.
    pub fn id(&self) -> OwnerId {
        self.id
    }

    /// Upgrade to a strong handle if the image is still reachable.
    pub fn upgrade(&self) -> Option<ImageHandle> {
        self.inner.upgrade().map(|inner| ImageHandle { inner })
    }

    /// Whether the owner is reachable and flagged as persistence-worthy.
    pub fn wants_persistence(&self) -> bool {
        self.inner
            .upgrade()
            .map(|inner| inner.persistent.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

impl fmt::Debug for WeakImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakImage")
            .field("id", &self.id)
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
