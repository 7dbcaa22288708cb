//! Test utilities: message builders, a scripted provider and a fake capture service
//!
//! The fake service speaks the real wire protocol over real ZeroMQ sockets, so channel and
//! session tests exercise the same code paths as a live Pupil Capture instance.

#![cfg(any(test, feature = "benchmark"))]

use bytes::Bytes;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use zeromq::{Endpoint, PubSocket, RepSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::Result;
use crate::channel::control::SUB_PORT_REQUEST;
use crate::provider::Provider;
use crate::types::{FieldMap, FieldValue, Multipart, encode_fields};

/// Acknowledgment text the fake service replies to every notification
pub const NOTIFICATION_ACK: &str = "Notification received";

/// Interval between repeated publications of the scripted stream
const PUBLISH_INTERVAL: Duration = Duration::from_millis(10);

/// Poll interval while waiting for a gate file to appear
const GATE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A localhost TCP port that was free a moment ago.
pub fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Build `[topic, msgpack(fields), trailing...]`.
pub fn message_with_fields(
    topic: &str,
    fields: &[(&str, FieldValue)],
    trailing: Vec<Bytes>,
) -> Multipart {
    let map: FieldMap = fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
    let payload = encode_fields(&map).expect("encode fields");

    let mut parts = vec![Bytes::copy_from_slice(topic.as_bytes()), Bytes::from(payload)];
    parts.extend(trailing);
    Multipart::new(parts)
}

/// A `pupil.*`-style message carrying `norm_pos = [x, y]`.
pub fn pupil_message(topic: &str, x: f64, y: f64) -> Multipart {
    message_with_fields(
        topic,
        &[
            ("topic", FieldValue::from(topic)),
            ("norm_pos", FieldValue::Array(vec![FieldValue::Float(x), FieldValue::Float(y)])),
            ("confidence", FieldValue::Float(1.0)),
        ],
        vec![],
    )
}

/// A `frame.world` message with the given dimensions and BGR payload.
pub fn world_frame_message(width: u32, height: u32, bgr: &[u8]) -> Multipart {
    message_with_fields(
        "frame.world",
        &[
            ("topic", FieldValue::from("frame.world")),
            ("width", FieldValue::Int(width.into())),
            ("height", FieldValue::Int(height.into())),
            ("format", FieldValue::from("bgr")),
        ],
        vec![Bytes::copy_from_slice(bgr)],
    )
}

fn to_zmq(message: &Multipart) -> Option<ZmqMessage> {
    let (first, rest) = message.parts.split_first()?;
    let mut zmq = ZmqMessage::from(first.clone());
    for part in rest {
        zmq.push_back(part.clone());
    }
    Some(zmq)
}

/// Provider fed from a channel
///
/// Items sent through the paired sender are returned in order; dropping every sender ends
/// the stream with `Ok(None)`.
pub struct ScriptedProvider {
    rx: mpsc::UnboundedReceiver<Result<Multipart>>,
    closed: Arc<AtomicBool>,
}

impl ScriptedProvider {
    pub fn channel() -> (Self, mpsc::UnboundedSender<Result<Multipart>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx, closed: Arc::new(AtomicBool::new(false)) }, tx)
    }

    /// A provider that yields `messages` and then ends.
    pub fn from_messages(messages: Vec<Multipart>) -> Self {
        let (provider, tx) = Self::channel();
        for message in messages {
            let _ = tx.send(Ok(message));
        }
        provider
    }

    /// Flag set once the loop closes the provider
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    async fn next_message(&mut self) -> Result<Option<Multipart>> {
        match self.rx.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.rx.close();
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// How the fake service sets up its control port
#[derive(Debug, Clone, Default)]
pub struct FakeServiceOptions {
    /// Fixed control port; an ephemeral one when `None`
    pub control_port: Option<u16>,

    /// Bind the control port only once this file exists
    pub gate: Option<PathBuf>,

    /// Receive control requests but never reply
    pub mute: bool,
}

/// In-process stand-in for Pupil Capture's remote plugin
///
/// Answers `SUB_PORT` with its publisher port, acknowledges `notify.*` requests and
/// publishes a scripted message set over and over until dropped.
pub struct FakeCaptureService {
    control_port: u16,
    pub_port: u16,
    notifications: Arc<Mutex<Vec<String>>>,
    script: watch::Sender<Vec<Multipart>>,
    cancel: CancellationToken,
}

impl FakeCaptureService {
    /// Start on an ephemeral control port, answering immediately.
    pub async fn start() -> Self {
        Self::start_with(FakeServiceOptions::default()).await
    }

    pub async fn start_with(options: FakeServiceOptions) -> Self {
        let cancel = CancellationToken::new();
        let notifications = Arc::new(Mutex::new(Vec::new()));

        let mut publisher = PubSocket::new();
        let pub_port = tcp_port(publisher.bind("tcp://127.0.0.1:0").await.expect("bind publisher"));
        let (script, script_rx) = watch::channel(Vec::new());
        tokio::spawn(publish_loop(publisher, script_rx, cancel.clone()));

        let control_port = match (options.control_port, &options.gate) {
            (Some(port), Some(gate)) => {
                let responder = Responder {
                    pub_port,
                    mute: options.mute,
                    notifications: Arc::clone(&notifications),
                };
                tokio::spawn(gated_control_loop(gate.clone(), port, responder, cancel.clone()));
                port
            }
            (port, _) => {
                let mut socket = RepSocket::new();
                let endpoint = format!("tcp://127.0.0.1:{}", port.unwrap_or(0));
                let port = tcp_port(socket.bind(&endpoint).await.expect("bind control"));
                let responder = Responder {
                    pub_port,
                    mute: options.mute,
                    notifications: Arc::clone(&notifications),
                };
                tokio::spawn(responder.serve(socket, cancel.clone()));
                port
            }
        };

        Self { control_port, pub_port, notifications, script, cancel }
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn control_endpoint(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.control_port)
    }

    pub fn pub_port(&self) -> u16 {
        self.pub_port
    }

    /// Subjects of every notification received so far
    pub async fn notifications(&self) -> Vec<String> {
        self.notifications.lock().await.clone()
    }

    /// Replace the published message set. Each message is re-sent every few milliseconds.
    pub fn publish_repeatedly(&self, messages: Vec<Multipart>) {
        self.script.send_replace(messages);
    }

    /// Stop serving and release both ports.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for FakeCaptureService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn tcp_port(endpoint: Endpoint) -> u16 {
    match endpoint {
        Endpoint::Tcp(_, port) => port,
        other => panic!("expected a TCP endpoint, got {other:?}"),
    }
}

async fn publish_loop(
    mut socket: PubSocket,
    script: watch::Receiver<Vec<Multipart>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(PUBLISH_INTERVAL) => {}
        }
        let messages = script.borrow().clone();
        for message in messages.iter().filter_map(to_zmq) {
            if socket.send(message).await.is_err() {
                break;
            }
        }
    }
    let _ = socket.close().await;
}

async fn gated_control_loop(
    gate: PathBuf,
    port: u16,
    responder: Responder,
    cancel: CancellationToken,
) {
    while !gate.exists() {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(GATE_POLL_INTERVAL) => {}
        }
    }

    let mut socket = RepSocket::new();
    if socket.bind(&format!("tcp://127.0.0.1:{port}")).await.is_ok() {
        responder.serve(socket, cancel).await;
    }
}

struct Responder {
    pub_port: u16,
    mute: bool,
    notifications: Arc<Mutex<Vec<String>>>,
}

impl Responder {
    async fn serve(self, mut socket: RepSocket, cancel: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = socket.recv() => match request {
                    Ok(request) => request,
                    Err(_) => break,
                },
            };
            if self.mute {
                continue;
            }

            let command = request
                .get(0)
                .and_then(|frame| std::str::from_utf8(frame).ok())
                .unwrap_or_default()
                .to_string();

            let reply = if command == SUB_PORT_REQUEST {
                self.pub_port.to_string()
            } else if let Some(subject) = command.strip_prefix("notify.") {
                self.notifications.lock().await.push(subject.to_string());
                NOTIFICATION_ACK.to_string()
            } else {
                format!("Unknown command: {command}")
            };

            if socket.send(ZmqMessage::from(reply)).await.is_err() {
                break;
            }
        }
        let _ = socket.close().await;
    }
}
