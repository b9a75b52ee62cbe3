//! Immutable pixel buffers for computed tiles.

use bytes::Bytes;
use image::RgbImage;
use serde::Serialize;

use crate::error::ComputeError;

/// Geometry of a tile's pixel data.
///
/// The byte size used for cache accounting is derived from the layout, not
/// from whatever allocation happens to back the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TileLayout {
    /// Tile width in pixels
    pub width: u32,

    /// Tile height in pixels
    pub height: u32,

    /// Bytes per pixel (1 = gray8, 3 = rgb8, 4 = rgba8, ...)
    pub bytes_per_pixel: u32,
}

impl TileLayout {
    /// Create a new layout.
    pub fn new(width: u32, height: u32, bytes_per_pixel: u32) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel,
        }
    }

    /// Layout of a square RGB8 tile.
    pub fn rgb8(size: u32) -> Self {
        Self::new(size, size, 3)
    }

    /// Number of bytes a buffer with this layout occupies.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel as usize
    }
}

/// Pixel data of one computed tile.
///
/// Buffers are shared as `Arc<PixelBuffer>` between the cache, blocked callers
/// and listeners. Nobody gets a mutable view once a buffer has been handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    layout: TileLayout,
    data: Bytes,
}

impl PixelBuffer {
    /// Wrap raw pixel bytes.
    ///
    /// Fails with [`ComputeError::MalformedTile`] if the byte count does not
    /// match the layout.
    pub fn new(layout: TileLayout, data: impl Into<Bytes>) -> Result<Self, ComputeError> {
        let data = data.into();
        let expected = layout.byte_len();
        if data.len() != expected {
            return Err(ComputeError::MalformedTile {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { layout, data })
    }

    /// A buffer with every byte set to `value`.
    pub fn filled(layout: TileLayout, value: u8) -> Self {
        Self {
            layout,
            data: Bytes::from(vec![value; layout.byte_len()]),
        }
    }

    /// Convert an RGB image into a tile buffer.
    pub fn from_rgb_image(image: RgbImage) -> Self {
        let layout = TileLayout::new(image.width(), image.height(), 3);
        Self {
            layout,
            data: Bytes::from(image.into_raw()),
        }
    }

    /// View this buffer as an RGB image.
    ///
    /// Returns `None` unless the buffer has 3 bytes per pixel.
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        if self.layout.bytes_per_pixel != 3 {
            return None;
        }
        RgbImage::from_raw(self.layout.width, self.layout.height, self.data.to_vec())
    }

    /// The buffer layout.
    pub fn layout(&self) -> TileLayout {
        self.layout
    }

    /// Raw pixel bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Size in bytes used for cache capacity accounting.
    pub fn byte_size(&self) -> usize {
        self.layout.byte_len()
    }
}
