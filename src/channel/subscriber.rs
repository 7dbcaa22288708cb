//! Subscribe-only streaming channel

use std::time::Duration;
use tracing::{debug, info};
use zeromq::{Socket, SocketRecv, SubSocket};

use super::bounded;
use crate::provider::Provider;
use crate::types::Multipart;
use crate::{CaptureError, Result};

/// SUB connection to the capture service's data port
///
/// Delivery is best-effort with no acknowledgment or backpressure: messages the loop does
/// not keep up with are buffered by the transport up to its own limits.
pub struct SubscriberChannel {
    socket: Option<SubSocket>,
    endpoint: String,
}

impl SubscriberChannel {
    /// Connect to `tcp://host:port` and subscribe to every prefix in `subscriptions`.
    pub async fn connect(
        host: &str,
        port: u16,
        subscriptions: &[String],
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let endpoint = format!("tcp://{host}:{port}");
        let mut socket = SubSocket::new();

        bounded(timeout, async {
            socket.connect(&endpoint).await.map_err(|e| {
                CaptureError::transport_with_source(format!("connect to {endpoint}"), e)
            })?;
            for prefix in subscriptions {
                socket.subscribe(prefix).await.map_err(|e| {
                    CaptureError::transport_with_source(format!("subscribe to '{prefix}'"), e)
                })?;
            }
            Ok(())
        })
        .await?;

        info!(endpoint, ?subscriptions, "Streaming channel subscribed");
        Ok(Self { socket: Some(socket), endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }
}

#[async_trait::async_trait]
impl Provider for SubscriberChannel {
    async fn next_message(&mut self) -> Result<Option<Multipart>> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(None);
        };

        let message = socket.recv().await.map_err(|e| {
            CaptureError::transport_with_source(format!("receive from {}", self.endpoint), e)
        })?;
        Ok(Some(Multipart::new(message.into_vec())))
    }

    async fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            for error in socket.close().await {
                debug!(endpoint = %self.endpoint, error = %error, "Error while closing streaming socket");
            }
            debug!(endpoint = %self.endpoint, "Streaming channel closed");
        }
    }
}
