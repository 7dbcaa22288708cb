//! Supervised capture interface for the Pupil eye-tracking service.
//!
//! Gazelink launches Pupil Capture as a child process, negotiates its data port over the
//! ZeroMQ control channel and turns the published stream into two snapshots: the latest
//! world-camera frame (RGB) and an exponentially smoothed gaze point.
//!
//! # Features
//!
//! - **Process supervision**: stale instances are reaped, the capture program runs in its
//!   own process group and is killed as a unit
//! - **Fail-fast setup**: port conflicts, launch failures and silent services surface as
//!   typed [`CaptureError`]s, with everything acquired so far released
//! - **Torn-free snapshots**: readers always see a complete frame and gaze value
//! - **Streams**: frame and gaze updates as `Stream`s, optionally throttled
//!
//! ## Example
//!
//! ```rust,no_run
//! use gazelink::{CaptureConfig, CaptureSession};
//!
//! #[tokio::main]
//! async fn main() -> gazelink::Result<()> {
//!     let mut session = CaptureSession::new(CaptureConfig::default())?;
//!     session.connect().await?;
//!     session.start_capture()?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     if let Some(frame) = session.latest_frame() {
//!         println!("{}x{} frame, gaze at {:?}", frame.width, frame.height, session.gaze_pixel());
//!     }
//!
//!     session.terminate().await;
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod config;
mod error;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Process and transport
pub mod channel;
pub mod probe;
pub mod provider;
pub mod supervisor;

// Stream processing
pub mod demux;
pub mod driver;
pub mod stream;

// Consumer-facing API
pub mod consumer;
pub mod session;

// Core exports
pub use error::*;
pub use types::*;

// Main API exports
pub use config::CaptureConfig;
pub use consumer::{GazeTarget, VideoSource};
pub use demux::{Demultiplexer, Dispatch};
pub use driver::{LoopExit, LoopSummary};
pub use probe::is_port_in_use;
pub use session::{CaptureSession, TeardownReport};
