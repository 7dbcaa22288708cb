//! Lifecycle states of a capture session

use std::fmt;

/// Connection state of a [`CaptureSession`](crate::CaptureSession).
///
/// ```text
/// Unconnected -> Connecting -> Streaming -> Terminating -> Terminated
///                    |                          ^              |
///                    +------ (any failure) -----+              |
///                    ^                                         |
///                    +------------ connect() (fresh) ----------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, nothing launched yet
    Unconnected,
    /// `connect()` in progress
    Connecting,
    /// Process running, control negotiated, stream subscribed
    Streaming,
    /// Teardown in progress
    Terminating,
    /// All resources released
    Terminated,
}

impl ConnectionState {
    /// Whether `connect()` may be called in this state.
    pub fn can_connect(self) -> bool {
        matches!(self, ConnectionState::Unconnected | ConnectionState::Terminated)
    }

    /// Whether the session holds live resources.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Streaming | ConnectionState::Terminating
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unconnected => "unconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Terminating => "terminating",
            ConnectionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}
