//! Frame container passed between pipeline stages.
//!
//! A `Frame` is owned by exactly one stage for one iteration: the source hands it to
//! the producer, the producer draws on it and hands it to the consumer, and the
//! consumer drops it after encoding. Nothing retains frames across iterations.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::time::Instant;

/// JPEG quality used for the live stream.
pub const STREAM_JPEG_QUALITY: u8 = 80;

/// RGB24 frame with its dimensions and capture instant.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    captured_at: Instant,
}

impl Frame {
    /// Wrap an RGB24 buffer. The buffer length must equal `width * height * 3`.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = expected_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self::from_raw_parts(data, width, height))
    }

    /// Wrap a buffer without validating its length.
    ///
    /// Used by sources that already know the layout; encoding rejects
    /// mismatched buffers later.
    pub fn from_raw_parts(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
        }
    }

    /// Solid-colour frame, mostly useful for tests and placeholders.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let len = expected_len(width, height)?;
        let mut data = Vec::with_capacity(len);
        for _ in 0..(len / 3) {
            data.extend_from_slice(&rgb);
        }
        Ok(Self::from_raw_parts(data, width, height))
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Colour of the pixel at (x, y), if inside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        self.data
            .get(idx..idx + 3)
            .map(|p| [p[0], p[1], p[2]])
    }

    /// Set one pixel; coordinates outside the frame are ignored.
    pub fn put_pixel(&mut self, x: i32, y: i32, rgb: [u8; 3]) {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        if let Some(p) = self.data.get_mut(idx..idx + 3) {
            p.copy_from_slice(&rgb);
        }
    }

    /// Borrow the pixels as an `image` buffer (copies).
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }

    /// Compress the frame to JPEG at the given quality (1..=100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let expected = expected_len(self.width, self.height)?;
        if self.data.len() != expected || expected == 0 {
            return Err(anyhow!(
                "cannot encode {}x{} frame from {} bytes",
                self.width,
                self.height,
                self.data.len()
            ));
        }
        let mut out = Vec::with_capacity(self.data.len() / 8);
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode(
                &self.data,
                self.width,
                self.height,
                image::ExtendedColorType::Rgb8,
            )
            .context("JPEG encode failed")?;
        Ok(out)
    }

    /// Decode a JPEG (or any format `image` was built with) into a frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes).context("decode jpeg")?;
        let rgb = image.into_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Self::from_raw_parts(rgb.into_raw(), width, height))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Pixel contents are never printed.
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

fn expected_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_mismatched_length() {
        assert!(Frame::new(vec![0u8; 10], 2, 2).is_err());
        assert!(Frame::new(vec![0u8; 12], 2, 2).is_ok());
    }

    #[test]
    fn put_pixel_ignores_out_of_bounds() -> Result<()> {
        let mut frame = Frame::filled(4, 4, [0, 0, 0])?;
        frame.put_pixel(-1, 0, [255, 0, 0]);
        frame.put_pixel(4, 0, [255, 0, 0]);
        frame.put_pixel(1, 2, [255, 0, 0]);
        assert_eq!(frame.pixel(1, 2), Some([255, 0, 0]));
        assert_eq!(frame.pixel(0, 0), Some([0, 0, 0]));
        assert_eq!(frame.pixel(4, 4), None);
        Ok(())
    }

    #[test]
    fn jpeg_encode_then_decode_keeps_dimensions() -> Result<()> {
        let frame = Frame::filled(32, 16, [10, 200, 30])?;
        let jpeg = frame.encode_jpeg(STREAM_JPEG_QUALITY)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = Frame::decode(&jpeg)?;
        assert_eq!((decoded.width, decoded.height), (32, 16));
        Ok(())
    }

    #[test]
    fn encode_rejects_truncated_buffer() {
        let frame = Frame::from_raw_parts(vec![0u8; 5], 4, 4);
        assert!(frame.encode_jpeg(80).is_err());
    }
}
