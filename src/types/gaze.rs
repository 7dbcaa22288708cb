//! Gaze coordinates and exponential smoothing

use super::FrameBuffer;

/// Smoothing factor used by the reference overlay
pub const DEFAULT_SMOOTHING_ALPHA: f64 = 0.03;

/// Normalized gaze coordinate
///
/// Components are conceptually in `[0, 1]` (origin at the bottom-left of the world
/// camera image, as reported by the tracker) but are never clamped.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GazePoint {
    pub x: f64,
    pub y: f64,
}

impl GazePoint {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Project onto the pixel grid of `frame`: `(x * width, y * height)`.
    pub fn to_pixel(self, frame: &FrameBuffer) -> (f64, f64) {
        (self.x * frame.width as f64, self.y * frame.height as f64)
    }
}

/// Exponential moving average over raw gaze samples.
///
/// `smoothed = alpha * sample + (1 - alpha) * smoothed_prev`, starting at `(0, 0)`.
/// A small alpha means heavy smoothing and a slow response.
#[derive(Debug, Clone)]
pub struct GazeSmoother {
    alpha: f64,
    current: GazePoint,
}

impl GazeSmoother {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, current: GazePoint::default() }
    }

    /// Fold one raw sample in and return the new smoothed point.
    pub fn update(&mut self, sample: GazePoint) -> GazePoint {
        let a = self.alpha;
        self.current = GazePoint {
            x: a * sample.x + (1.0 - a) * self.current.x,
            y: a * sample.y + (1.0 - a) * self.current.y,
        };
        self.current
    }

    pub fn current(&self) -> GazePoint {
        self.current
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

impl Default for GazeSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTHING_ALPHA)
    }
}
