//! Owning images and their pixel data.
//!
//! - [`ImageHandle`]: shared handle to an image; its identity keys the cache
//! - [`TileProducer`]: the capability that computes one tile of an image
//! - [`PixelBuffer`]: immutable pixels of a computed tile

mod buffer;
mod handle;

pub use buffer::{PixelBuffer, TileLayout};
pub use handle::{ImageHandle, OwnerId, TileProducer, WeakImage};
