//! Decoded world-camera frames

use std::sync::Arc;

/// Number of colour channels in every published frame
pub const FRAME_CHANNELS: u8 = 3;

/// Most recent decoded world-camera frame
///
/// Pixels are row-major and RGB-ordered. The buffer is shared via `Arc` so that
/// snapshot readers never copy pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Channels per pixel (always [`FRAME_CHANNELS`])
    pub channels: u8,

    /// Pixel bytes, `width * height * channels` long
    pub data: Arc<[u8]>,
}

impl FrameBuffer {
    /// Byte length a frame of the given dimensions must have.
    ///
    /// Returns `None` on arithmetic overflow.
    pub fn expected_len(width: u32, height: u32) -> Option<usize> {
        (width as usize).checked_mul(height as usize)?.checked_mul(FRAME_CHANNELS as usize)
    }

    /// Build a frame from wire-order (BGR) pixels.
    ///
    /// Returns `None` unless `bgr.len()` equals `width * height * 3`. The channel
    /// order is swapped so the stored buffer is RGB.
    pub fn from_bgr(width: u32, height: u32, bgr: &[u8]) -> Option<Self> {
        if Self::expected_len(width, height)? != bgr.len() {
            return None;
        }

        let mut rgb = bgr.to_vec();
        for pixel in rgb.chunks_exact_mut(FRAME_CHANNELS as usize) {
            pixel.swap(0, 2);
        }

        Some(Self { width, height, channels: FRAME_CHANNELS, data: rgb.into() })
    }

    /// Byte length of the pixel buffer
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the frame has no pixels (zero width or height)
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// RGB value at `(x, y)`, or `None` when out of bounds
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * FRAME_CHANNELS as usize;
        let px = self.data.get(offset..offset + 3)?;
        Some([px[0], px[1], px[2]])
    }
}
