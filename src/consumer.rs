//! Capabilities exposed to display layers
//!
//! A display layer needs a video source it can start, read and stop, and a point to draw
//! on top of the frames. [`CaptureSession`] provides both; other sources (a recorded
//! session, a test pattern) can implement the same traits.

use std::sync::Arc;

use crate::session::{CaptureSession, TeardownReport};
use crate::types::FrameBuffer;
use crate::Result;

/// A source of video frames with an explicit lifecycle
#[async_trait::async_trait]
pub trait VideoSource: Send {
    async fn connect(&mut self) -> Result<()>;

    async fn start_capture(&mut self) -> Result<()>;

    /// Release all resources. Never fails; see [`TeardownReport`].
    async fn terminate(&mut self) -> TeardownReport;

    /// Latest frame snapshot, `None` until the first frame arrives
    fn latest_frame(&self) -> Option<Arc<FrameBuffer>>;
}

/// Something that marks a position on the current frame
pub trait GazeTarget {
    /// Target in pixel coordinates of the latest frame
    fn target(&self) -> Option<(f64, f64)>;
}

#[async_trait::async_trait]
impl VideoSource for CaptureSession {
    async fn connect(&mut self) -> Result<()> {
        CaptureSession::connect(self).await
    }

    async fn start_capture(&mut self) -> Result<()> {
        CaptureSession::start_capture(self)
    }

    async fn terminate(&mut self) -> TeardownReport {
        CaptureSession::terminate(self).await
    }

    fn latest_frame(&self) -> Option<Arc<FrameBuffer>> {
        CaptureSession::latest_frame(self)
    }
}

impl GazeTarget for CaptureSession {
    fn target(&self) -> Option<(f64, f64)> {
        self.gaze_pixel()
    }
}
