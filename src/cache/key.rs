use std::fmt;

use crate::raster::OwnerId;

/// Length of the binary key encoding used by the disk tier.
pub const ENCODED_KEY_LEN: usize = 16;

/// Cache key for a computed tile.
///
/// Owner identities are never reused within a process, so two distinct tiles
/// can never share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    /// Owning image
    pub owner: OwnerId,

    /// Tile X index (0-indexed from left)
    pub x: u32,

    /// Tile Y index (0-indexed from top)
    pub y: u32,
}

impl TileKey {
    /// Create a new cache key.
    pub fn new(owner: OwnerId, x: u32, y: u32) -> Self {
        Self { owner, x, y }
    }

    /// Big-endian binary encoding: owner (8 bytes), x (4 bytes), y (4 bytes).
    pub fn encode(&self) -> [u8; ENCODED_KEY_LEN] {
        let mut out = [0u8; ENCODED_KEY_LEN];
        out[..8].copy_from_slice(&self.owner.get().to_be_bytes());
        out[8..12].copy_from_slice(&self.x.to_be_bytes());
        out[12..].copy_from_slice(&self.y.to_be_bytes());
        out
    }

    /// Hex form of [`encode`](Self::encode), used as a file stem.
    pub fn to_hex(&self) -> String {
        hex::encode(self.encode())
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@({}, {})", self.owner, self.x, self.y)
    }
}
