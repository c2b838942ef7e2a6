//! Decoded bitmaps.
//!
//! Pixels are RGBA8 behind an `Arc<[u8]>`: the cache holds the owning
//! reference and snapshots hand out clones that live for one read.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use image::error::{ParameterError, ParameterErrorKind};
use image::{ImageError, ImageResult, RgbaImage};

#[derive(Clone, PartialEq, Eq)]
pub struct DecodedBitmap {
    width: u32,
    height: u32,
    pixels: Arc<[u8]>,
}

impl DecodedBitmap {
    /// Wrap RGBA8 pixels (`width * height * 4` bytes).
    pub fn new(width: u32, height: u32, pixels: impl Into<Arc<[u8]>>) -> Self {
        Self {
            width,
            height,
            pixels: pixels.into(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Whether two bitmaps share one pixel buffer.
    pub fn shares_pixels(&self, other: &DecodedBitmap) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }

    /// Copy into an [`RgbaImage`]; `None` when the buffer does not match the
    /// dimensions.
    pub fn to_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.pixels.to_vec())
    }

    /// Write the bitmap as a PNG file.
    pub fn save_png(&self, path: &Path) -> ImageResult<()> {
        let image = self.to_image().ok_or_else(|| {
            ImageError::Parameter(ParameterError::from_kind(
                ParameterErrorKind::DimensionMismatch,
            ))
        })?;
        image.save_with_format(path, image::ImageFormat::Png)
    }
}

impl fmt::Debug for DecodedBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedBitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_image_checks_dimensions() {
        let bitmap = DecodedBitmap::new(2, 1, vec![255, 0, 0, 255, 0, 255, 0, 255]);
        let image = bitmap.to_image().unwrap();
        assert_eq!(image.get_pixel(1, 0).0, [0, 255, 0, 255]);

        let short = DecodedBitmap::new(4, 4, vec![0u8; 8]);
        assert!(short.to_image().is_none());
    }

    #[test]
    fn test_save_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        DecodedBitmap::new(2, 2, vec![128u8; 16]).save_png(&path).unwrap();

        let loaded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(loaded.dimensions(), (2, 2));
    }

    #[test]
    fn test_clones_share_pixels() {
        let a = DecodedBitmap::new(1, 1, vec![1, 2, 3, 4]);
        let b = a.clone();
        assert!(a.shares_pixels(&b));
        assert!(!a.shares_pixels(&DecodedBitmap::new(1, 1, vec![1, 2, 3, 4])));
    }
}
