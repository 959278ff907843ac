//! Tile codec: raw bytes to RGBA rasters and back
//!
//! Tiles are stored as PNG, so encoding then decoding gives back the exact
//! same pixels.

use std::io::Cursor;
use std::path::Path;

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbaImage};
use log::debug;

use crate::error::{MapError, Result};

/// Limits checked against the image header before a full decode
#[derive(Clone, Copy, Debug)]
pub struct DecodeLimits {
    pub max_pixels: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_pixels: 64 * 1024 * 1024,
        }
    }
}

/// Read just the dimensions from an encoded image
pub fn probe_size(bytes: &[u8]) -> Result<(u32, u32)> {
    let size = imagesize::blob_size(bytes)
        .map_err(|e| MapError::InvalidSource(format!("unreadable image header: {e}")))?;
    Ok((size.width as u32, size.height as u32))
}

pub fn decode(bytes: &[u8], limits: DecodeLimits) -> Result<RgbaImage> {
    if bytes.is_empty() {
        return Err(MapError::InvalidSource("empty image data".into()));
    }

    // Formats imagesize cannot probe still go through the decoder below.
    if let Ok((width, height)) = probe_size(bytes) {
        let pixels = u64::from(width) * u64::from(height);
        if pixels > limits.max_pixels {
            return Err(MapError::InvalidSource(format!(
                "image is too large ({width}x{height})"
            )));
        }
    }

    let image = image::load_from_memory(bytes)?;
    let rgba = image.to_rgba8();
    if rgba.width() == 0 || rgba.height() == 0 {
        return Err(MapError::InvalidSource("image has no pixels".into()));
    }

    debug!("Decoded {}x{} image", rgba.width(), rgba.height());
    Ok(rgba)
}

pub fn encode_png(raster: &RgbaImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    PngEncoder::new(&mut buffer)
        .write_image(
            raster.as_raw(),
            raster.width(),
            raster.height(),
            ExtendedColorType::Rgba8,
        )
        .map_err(|e| MapError::transform(format!("PNG encoding failed: {e}")))?;
    Ok(buffer.into_inner())
}

pub fn read_file(path: &Path) -> Result<RgbaImage> {
    let bytes = std::fs::read(path).map_err(|e| MapError::persistence(path, e))?;
    decode(&bytes, DecodeLimits::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn gradient(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 7) as u8, (y * 13) as u8, ((x + y) * 3) as u8, (x % 2 * 255) as u8])
        })
    }

    #[test]
    fn png_round_trip_is_pixel_identical() {
        let original = gradient(37, 21);
        let bytes = encode_png(&original).unwrap();
        let decoded = decode(&bytes, DecodeLimits::default()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn probe_reads_header_only() {
        let bytes = encode_png(&gradient(40, 10)).unwrap();
        assert_eq!(probe_size(&bytes).unwrap(), (40, 10));
    }

    #[test]
    fn rejects_garbage() {
        let err = decode(b"definitely not an image", DecodeLimits::default()).unwrap_err();
        assert!(matches!(err, MapError::InvalidSource(_)), "got {err:?}");
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(
            decode(&[], DecodeLimits::default()),
            Err(MapError::InvalidSource(_))
        ));
    }

    #[test]
    fn enforces_pixel_limit() {
        let bytes = encode_png(&gradient(64, 64)).unwrap();
        let err = decode(&bytes, DecodeLimits { max_pixels: 100 }).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
