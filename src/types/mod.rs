//! Core types for capture data representation.
//!
//! - [`FrameBuffer`] is a validated, RGB-ordered world-camera frame shared via `Arc`
//! - [`GazePoint`] and [`GazeSmoother`] hold the normalized gaze and its EMA filter
//! - [`Multipart`], [`TopicMessage`] and [`FieldValue`] model the wire messages
//! - [`ConnectionState`] is the session lifecycle
//! - [`UpdateRate`] controls consumer stream throttling
//!
//! ## Usage Example
//!
//! ```rust
//! use gazelink::types::{FrameBuffer, GazePoint, GazeSmoother};
//!
//! // 1x1 frame, wire order is BGR
//! let frame = FrameBuffer::from_bgr(1, 1, &[10, 20, 30]).unwrap();
//! assert_eq!(frame.pixel(0, 0), Some([30, 20, 10]));
//!
//! let mut smoother = GazeSmoother::new(0.5);
//! let gaze = smoother.update(GazePoint::new(1.0, 1.0));
//! assert_eq!(gaze.to_pixel(&frame), (0.5, 0.5));
//! ```

mod frame;
mod gaze;
mod message;
mod state;
mod update_rate;

pub use frame::{FRAME_CHANNELS, FrameBuffer};
pub use gaze::{DEFAULT_SMOOTHING_ALPHA, GazePoint, GazeSmoother};
pub use message::{
    FieldMap, FieldValue, Multipart, TopicKind, TopicMessage, decode_fields, encode_fields,
};
pub use state::ConnectionState;
pub use update_rate::UpdateRate;
