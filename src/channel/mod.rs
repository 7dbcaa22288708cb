//! ZeroMQ channels to the capture service
//!
//! - [`ControlChannel`]: REQ socket for port negotiation and notifications
//! - [`SubscriberChannel`]: SUB socket feeding the capture loop

pub mod control;
pub mod subscriber;

pub use control::ControlChannel;
pub use subscriber::SubscriberChannel;

use std::time::Duration;

use crate::{CaptureError, Result};

/// Run `fut` under an optional deadline, mapping expiry to [`CaptureError::ControlTimeout`].
pub(crate) async fn bounded<F, T>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match timeout {
        Some(duration) => tokio::time::timeout(duration, fut)
            .await
            .map_err(|_| CaptureError::ControlTimeout { duration })?,
        None => fut.await,
    }
}
