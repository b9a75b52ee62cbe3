//! Disk overflow tier.
//!
//! Tiles evicted from memory whose owner is flagged persistence-worthy are
//! spilled here and read back on a later lookup. The tier is a cache, not a
//! durable store: entries hold raw pixel bytes only and may be discarded at any
//! time without affecting correctness.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use super::key::TileKey;
use crate::error::OverflowError;

/// File extension of tile entries written by [`FileOverflow`].
pub const TILE_FILE_EXTENSION: &str = "tile";

/// Backing store for spilled tiles.
///
/// This abstraction lets the tile store spill to a local directory, a
/// memory-mapped arena or anything else that can hold bytes by key.
#[async_trait]
pub trait OverflowStore: Send + Sync {
    /// Store the raw bytes of a tile, replacing any previous entry.
    async fn write(&self, key: &TileKey, data: &Bytes) -> Result<(), OverflowError>;

    /// Read the raw bytes of a tile. `Ok(None)` if there is no entry.
    async fn read(&self, key: &TileKey) -> Result<Option<Bytes>, OverflowError>;

    /// Delete an entry. Deleting a missing entry is not an error.
    async fn remove(&self, key: &TileKey) -> Result<(), OverflowError>;
}

/// One file per tile in a single directory.
///
/// File names are the hex-encoded tile key. Writes go through a temporary file
/// and a rename so a crash never leaves a truncated entry under a valid name.
pub struct FileOverflow {
    dir: PathBuf,
}

impl FileOverflow {
    /// Open (and create if needed) a disk tier rooted at `dir`.
    ///
    /// Entries left behind by an earlier process are deleted: owner identities
    /// are only unique within one process, so old entries could alias new keys.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, OverflowError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut removed = 0usize;
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_tile_file(&path) {
                fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Discarded {} stale tile(s) from {}", removed, dir.display());
        }

        Ok(Self { dir })
    }

    /// Root directory of this tier.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &TileKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}", key.to_hex(), TILE_FILE_EXTENSION))
    }
}

/// Extension of a write that has not been renamed into place yet.
const PARTIAL_FILE_EXTENSION: &str = "partial";

fn is_tile_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some(TILE_FILE_EXTENSION) | Some(PARTIAL_FILE_EXTENSION)
    )
}

#[async_trait]
impl OverflowStore for FileOverflow {
    async fn write(&self, key: &TileKey, data: &Bytes) -> Result<(), OverflowError> {
        let path = self.path_for(key);
        let partial = path.with_extension(PARTIAL_FILE_EXTENSION);
        fs::write(&partial, data).await?;
        fs::rename(&partial, &path).await?;
        Ok(())
    }

    async fn read(&self, key: &TileKey) -> Result<Option<Bytes>, OverflowError> {
        match fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, key: &TileKey) -> Result<(), OverflowError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
