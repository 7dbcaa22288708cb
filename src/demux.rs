//! Stream demultiplexer
//!
//! Turns raw multi-part messages into typed updates:
//!
//! | Topic         | Required fields                               | Result                    |
//! |---------------|-----------------------------------------------|---------------------------|
//! | `frame.world` | int `width`, int `height`, one trailing part  | [`Dispatch::Frame`]       |
//! | `pupil.*`     | `norm_pos`: 2 numbers                         | [`Dispatch::Gaze`] (EMA)  |
//! | anything else | -                                             | [`Dispatch::Ignored`]     |
//!
//! Anything that fails validation becomes [`Dispatch::Dropped`]. The demultiplexer never
//! returns an error: one corrupt message must not end a capture session.

use tracing::trace;

use crate::CaptureError;
use crate::types::{
    FieldValue, FrameBuffer, GazePoint, GazeSmoother, Multipart, TopicKind, TopicMessage,
};

/// What one message turned into
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// A validated world frame, ready to publish
    Frame(FrameBuffer),

    /// The new smoothed gaze point
    Gaze(GazePoint),

    /// Topic of no interest
    Ignored,

    /// Failed validation; the payload is discarded
    Dropped(String),
}

/// Classifies, decodes and validates stream messages; owns the gaze filter
#[derive(Debug, Clone)]
pub struct Demultiplexer {
    smoother: GazeSmoother,
}

impl Demultiplexer {
    pub fn new(smoothing_alpha: f64) -> Self {
        Self { smoother: GazeSmoother::new(smoothing_alpha) }
    }

    /// Current smoothed gaze
    pub fn gaze(&self) -> GazePoint {
        self.smoother.current()
    }

    /// Decode and dispatch one raw message.
    pub fn handle(&mut self, raw: Multipart) -> Dispatch {
        match TopicMessage::decode(raw) {
            Ok(message) => self.dispatch(&message),
            Err(e) => dropped(e),
        }
    }

    /// Dispatch an already-decoded message.
    pub fn dispatch(&mut self, message: &TopicMessage) -> Dispatch {
        match message.kind() {
            TopicKind::WorldFrame => match decode_world_frame(message) {
                Ok(frame) => Dispatch::Frame(frame),
                Err(e) => dropped(e),
            },
            TopicKind::Pupil => match norm_pos(message) {
                Ok(sample) => Dispatch::Gaze(self.smoother.update(sample)),
                Err(e) => dropped(e),
            },
            TopicKind::Other => {
                trace!(topic = %message.topic, "Ignoring topic");
                Dispatch::Ignored
            }
        }
    }
}

fn dropped(error: CaptureError) -> Dispatch {
    trace!(%error, "Dropping message");
    Dispatch::Dropped(error.to_string())
}

/// Validate a `frame.world` message and build its RGB frame.
pub fn decode_world_frame(message: &TopicMessage) -> crate::Result<FrameBuffer> {
    let topic = message.topic.as_str();
    let width = dimension(message, "width")?;
    let height = dimension(message, "height")?;

    let payload = message
        .trailing
        .first()
        .ok_or_else(|| CaptureError::malformed(topic, "no pixel payload part"))?;

    let expected = FrameBuffer::expected_len(width, height)
        .ok_or_else(|| CaptureError::malformed(topic, "frame dimensions overflow"))?;
    if expected != payload.len() {
        return Err(CaptureError::malformed(
            topic,
            format!(
                "{width}x{height}x3 needs {expected} bytes, payload has {}",
                payload.len()
            ),
        ));
    }

    FrameBuffer::from_bgr(width, height, payload)
        .ok_or_else(|| CaptureError::malformed(topic, "payload length mismatch"))
}

fn dimension(message: &TopicMessage, name: &str) -> crate::Result<u32> {
    let value = message
        .field(name)
        .ok_or_else(|| CaptureError::malformed(&message.topic, format!("missing '{name}'")))?;
    match value {
        FieldValue::Int(_) | FieldValue::UInt(_) => value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| CaptureError::malformed(&message.topic, format!("'{name}' out of range"))),
        other => Err(CaptureError::malformed(
            &message.topic,
            format!("'{name}' is {}, expected int", other.kind()),
        )),
    }
}

/// Extract the raw `norm_pos` gaze sample.
pub fn norm_pos(message: &TopicMessage) -> crate::Result<GazePoint> {
    let topic = message.topic.as_str();
    let value =
        message.field("norm_pos").ok_or_else(|| CaptureError::malformed(topic, "missing 'norm_pos'"))?;

    match value.as_array() {
        Some([x, y]) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => Ok(GazePoint::new(x, y)),
            _ => Err(CaptureError::malformed(topic, "'norm_pos' has non-numeric components")),
        },
        Some(items) => Err(CaptureError::malformed(
            topic,
            format!("'norm_pos' has {} elements, expected 2", items.len()),
        )),
        None => Err(CaptureError::malformed(
            topic,
            format!("'norm_pos' is {}, expected array", value.kind()),
        )),
    }
}
