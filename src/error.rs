use thiserror::Error;

use crate::cache::TileKey;

/// Errors produced while computing a tile.
///
/// All variants are cheap to clone so that one outcome can be handed to every
/// caller waiting on the same tile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    /// The producer ran out of memory while computing the tile.
    ///
    /// The scheduler answers this by releasing cached tiles and retrying.
    #[error("Out of memory while computing tile ({x}, {y})")]
    OutOfMemory { x: u32, y: u32 },

    /// The tile producer reported a failure
    #[error("Tile producer failed: {0}")]
    Producer(String),

    /// Pixel data does not match the declared tile layout
    #[error("Malformed tile: layout requires {expected} bytes, got {actual}")]
    MalformedTile { expected: usize, actual: usize },

    /// The call violates the API contract (empty coordinate list, zero workers, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The tile was cancelled before a result was produced
    #[error("Tile computation cancelled")]
    Cancelled,

    /// The scheduler was shut down before the tile completed
    #[error("Scheduler is shut down")]
    Shutdown,
}

impl ComputeError {
    /// Whether this error is a transient memory exhaustion worth retrying.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, ComputeError::OutOfMemory { .. })
    }
}

/// Errors from the disk overflow tier.
///
/// These never escape the tile store: a failed read is a miss and a failed
/// write is a skipped spill.
#[derive(Debug, Clone, Error)]
pub enum OverflowError {
    /// Filesystem error
    #[error("Disk tier I/O error: {0}")]
    Io(String),

    /// Stored bytes do not match the layout recorded at write time
    #[error("Corrupt disk entry for {key}: expected {expected} bytes, found {actual}")]
    Corrupt {
        key: TileKey,
        expected: usize,
        actual: usize,
    },
}

impl From<std::io::Error> for OverflowError {
    fn from(err: std::io::Error) -> Self {
        OverflowError::Io(err.to_string())
    }
}

/// Errors raised by the tile store API.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Eviction threshold outside of 0.0..=1.0
    #[error("Invalid eviction threshold {threshold}: must be between 0.0 and 1.0")]
    InvalidThreshold { threshold: f64 },

    /// The disk tier could not be opened
    #[error("Disk tier unavailable: {0}")]
    Overflow(#[from] OverflowError),
}

/// Errors raised while starting a [`TileService`](crate::service::TileService).
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The tile store could not be built
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The scheduler configuration was rejected
    #[error(transparent)]
    Scheduler(#[from] ComputeError),
}
