//! Request/reply control channel
//!
//! Pupil Capture's remote plugin answers two kinds of request on its control port:
//!
//! ```text
//! "SUB_PORT"                         -> "<port>"
//! "notify.<subject>", msgpack{...}   -> acknowledgment string
//! ```
//!
//! A REQ socket strictly alternates send and receive, so a request whose reply timed out
//! leaves the channel unusable. That only happens during setup or teardown, both of
//! which end the session anyway.

use bytes::Bytes;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use super::bounded;
use crate::types::{FieldMap, FieldValue, encode_fields};
use crate::{CaptureError, Result};

/// Literal request for the streaming port
pub const SUB_PORT_REQUEST: &str = "SUB_PORT";

/// Notification subject asking the capture service to shut down
pub const SHOULD_STOP_SUBJECT: &str = "service_process.should_stop";

/// First retry delay while the capture service starts up
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Retry delay ceiling
const MAX_BACKOFF: Duration = Duration::from_millis(1600);

/// REQ connection to the capture service's control port
pub struct ControlChannel {
    socket: Option<ReqSocket>,
    endpoint: String,
    reply_timeout: Option<Duration>,
}

impl ControlChannel {
    /// Connect once to `endpoint`, bounded by `timeout`.
    pub async fn connect(endpoint: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut socket = ReqSocket::new();
        bounded(timeout, async {
            socket.connect(endpoint).await.map_err(|e| {
                CaptureError::transport_with_source(format!("connect to {endpoint}"), e)
            })
        })
        .await?;

        debug!(endpoint, "Control channel connected");
        Ok(Self { socket: Some(socket), endpoint: endpoint.to_string(), reply_timeout: timeout })
    }

    /// Connect to `endpoint`, retrying with exponential backoff until `timeout` expires.
    ///
    /// The capture service needs a moment after launch before it listens. `abort` is
    /// raced against every attempt and every backoff sleep; when it completes, its error
    /// is returned instead (for example when the launched process has already exited).
    pub async fn connect_with_retry<A>(
        endpoint: &str,
        timeout: Option<Duration>,
        abort: A,
    ) -> Result<Self>
    where
        A: Future<Output = CaptureError>,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let expired = || CaptureError::ControlTimeout { duration: timeout.unwrap_or_default() };
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0u32;
        tokio::pin!(abort);

        loop {
            attempt += 1;
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining.is_some_and(|r| r.is_zero()) {
                return Err(expired());
            }

            let result = tokio::select! {
                biased;
                error = &mut abort => return Err(error),
                result = Self::connect(endpoint, remaining) => result,
            };

            match result {
                Ok(mut channel) => {
                    channel.reply_timeout = timeout;
                    if attempt > 1 {
                        info!(endpoint, attempt, "Control channel connected after retries");
                    }
                    return Ok(channel);
                }
                Err(CaptureError::ControlTimeout { .. }) => return Err(expired()),
                Err(e) => {
                    trace!(endpoint, attempt, error = %e, "Control endpoint not ready");
                }
            }

            let sleep_for = match deadline {
                Some(d) => backoff.min(d.saturating_duration_since(Instant::now())),
                None => backoff,
            };
            tokio::select! {
                biased;
                error = &mut abort => return Err(error),
                _ = tokio::time::sleep(sleep_for) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Ask the capture service which port publishes the data stream.
    pub async fn request_sub_port(&mut self) -> Result<u16> {
        let reply = self.request(ZmqMessage::from(SUB_PORT_REQUEST)).await?;
        let text = first_frame_text(&reply)?;
        let port = text.trim().parse::<u16>().map_err(|_| {
            CaptureError::transport(format!("non-numeric SUB_PORT reply: {text:?}"))
        })?;

        info!(port, "Negotiated streaming port");
        Ok(port)
    }

    /// Send a `notify.<subject>` notification and return the acknowledgment.
    ///
    /// `subject` is added to `fields` before encoding.
    pub async fn notify(&mut self, subject: &str, mut fields: FieldMap) -> Result<String> {
        fields.insert("subject".to_string(), FieldValue::Str(subject.to_string()));
        let payload = encode_fields(&fields).map_err(|e| {
            CaptureError::transport_with_source(format!("encode notification {subject}"), e)
        })?;

        let mut message = ZmqMessage::from(format!("notify.{subject}"));
        message.push_back(Bytes::from(payload));

        let reply = self.request(message).await?;
        let ack = first_frame_text(&reply)?.to_string();
        debug!(subject, ack = %ack, "Notification acknowledged");
        Ok(ack)
    }

    /// Close the socket. Returns whether a socket was open.
    ///
    /// Undelivered requests are discarded rather than flushed.
    pub async fn close(&mut self) -> bool {
        let Some(socket) = self.socket.take() else {
            return false;
        };
        for error in socket.close().await {
            debug!(endpoint = %self.endpoint, error = %error, "Error while closing control socket");
        }
        debug!(endpoint = %self.endpoint, "Control channel closed");
        true
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request(&mut self, message: ZmqMessage) -> Result<ZmqMessage> {
        let endpoint = self.endpoint.clone();
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| CaptureError::transport(format!("control channel {endpoint} is closed")))?;

        bounded(self.reply_timeout, async move {
            socket.send(message).await.map_err(|e| {
                CaptureError::transport_with_source(format!("send to {endpoint}"), e)
            })?;
            socket.recv().await.map_err(|e| {
                CaptureError::transport_with_source(format!("receive from {endpoint}"), e)
            })
        })
        .await
    }
}

fn first_frame_text(message: &ZmqMessage) -> Result<&str> {
    let frame = message.get(0).ok_or_else(|| CaptureError::transport("empty control reply"))?;
    std::str::from_utf8(frame).map_err(|_| CaptureError::transport("control reply is not UTF-8"))
}
