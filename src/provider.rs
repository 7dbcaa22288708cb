//! Provider trait for stream message sources

use crate::Result;
use crate::types::Multipart;

/// Trait for sources of raw stream messages
///
/// The capture loop owns exactly one provider and pulls from it until the provider
/// ends or the session is cancelled. Implementations only move bytes; decoding and
/// validation belong to the [`Demultiplexer`](crate::demux::Demultiplexer).
#[async_trait::async_trait]
pub trait Provider: Send + 'static {
    /// Receive the next multi-part message
    ///
    /// Returns:
    /// - `Ok(Some(message))` - Message received, all parts collected
    /// - `Ok(None)` - Channel torn down (normal termination)
    /// - `Err(e)` - Transport error; the loop may retry
    ///
    /// Must be cancel-safe: the loop drops this future when the session stops.
    async fn next_message(&mut self) -> Result<Option<Multipart>>;

    /// Release the underlying channel without waiting for undelivered data
    async fn close(&mut self);
}
