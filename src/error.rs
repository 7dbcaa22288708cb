//! Error types for the capture interface.
//!
//! Every fallible operation in gazelink returns [`CaptureError`]. The variants follow the
//! lifecycle of a capture session, and each one carries enough context to decide what to
//! do next:
//!
//! ## Error Categories
//!
//! - **Setup Errors**: port conflicts, spawn failures, early process exit, control timeouts
//! - **Transport Errors**: ZeroMQ socket failures during negotiation or teardown
//! - **Message Errors**: malformed stream messages (dropped by the capture loop, never raised)
//! - **Supervision Warnings**: stale processes that could not be signaled
//! - **Usage Errors**: lifecycle misuse and invalid configuration
//!
//! ## Propagation Policy
//!
//! Setup errors propagate out of [`connect`](crate::CaptureSession::connect) after the
//! session has torn itself down. Message errors are absorbed by the capture loop. Errors
//! raised while terminating are logged and never stop the remaining teardown steps.
//!
//! ```rust
//! use gazelink::CaptureError;
//!
//! let error = CaptureError::PortInUse { port: 50020 };
//! assert!(error.is_fatal());
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

use crate::types::ConnectionState;

/// Result type alias for capture operations.
pub type Result<T, E = CaptureError> = std::result::Result<T, E>;

/// Main error type for capture operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CaptureError {
    #[error("Control port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("Failed to launch capture program '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Capture program exited during startup ({status})")]
    ProcessExited { status: ExitStatus },

    #[error("Transport failure: {context}")]
    Transport {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("No reply on the control channel within {duration:?}")]
    ControlTimeout { duration: Duration },

    #[error("Malformed '{topic}' message: {reason}")]
    Malformed { topic: String, reason: String },

    #[error("Could not reap process {pid}: {reason}")]
    ProcessReap { pid: u32, reason: String },

    #[error("Cannot {operation} while session is {state}")]
    InvalidState { operation: &'static str, state: ConnectionState },

    #[error("Invalid configuration: {reason}")]
    Config {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CaptureError {
    /// Returns whether this error aborts the operation that raised it.
    ///
    /// Malformed messages and reap warnings are recorded and skipped; everything else
    /// ends the current `connect()` attempt.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CaptureError::Malformed { .. } | CaptureError::ProcessReap { .. })
    }

    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            CaptureError::PortInUse { .. } => true,
            CaptureError::Transport { .. } => true,
            CaptureError::ControlTimeout { .. } => true,
            CaptureError::ProcessExited { .. } => true,
            CaptureError::ProcessReap { .. } => true,
            CaptureError::Spawn { .. } => false,
            CaptureError::Malformed { .. } => false,
            CaptureError::InvalidState { .. } => false,
            CaptureError::Config { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            CaptureError::PortInUse { .. } => vec![
                "Close any Pupil Capture instance started outside gazelink",
                "Check which process owns the control port",
                "Configure a different control port",
            ],
            CaptureError::Spawn { .. } => vec![
                "Check the capture program path",
                "Verify the program is executable",
                "Check the configured arguments",
            ],
            CaptureError::ProcessExited { .. } => vec![
                "Run the capture program by hand to see its output",
                "Check that the eye-tracking hardware is connected",
            ],
            CaptureError::Transport { .. } => vec![
                "Verify the capture service is listening on the control port",
                "Check local firewall rules for loopback traffic",
                "Retry the connection",
            ],
            CaptureError::ControlTimeout { .. } => vec![
                "Increase control_timeout_ms",
                "Check that the capture service finished starting up",
            ],
            CaptureError::Malformed { .. } => vec![
                "Check the capture service version",
                "Verify the stream topics match the expected format",
            ],
            CaptureError::ProcessReap { .. } => {
                vec!["Terminate the stale process manually", "Check process permissions"]
            }
            CaptureError::InvalidState { .. } => vec![
                "Call connect() before start_capture()",
                "Create a new session after terminate()",
            ],
            CaptureError::Config { .. } => {
                vec!["Check the configuration file syntax", "Compare against the defaults"]
            }
        }
    }

    /// Helper constructor for spawn failures.
    pub fn spawn_failed(program: impl Into<String>, source: std::io::Error) -> Self {
        CaptureError::Spawn { program: program.into(), source }
    }

    /// Helper constructor for transport errors.
    pub fn transport(context: impl Into<String>) -> Self {
        CaptureError::Transport { context: context.into(), source: None }
    }

    /// Helper constructor for transport errors with source.
    pub fn transport_with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        CaptureError::Transport { context: context.into(), source: Some(Box::new(source)) }
    }

    /// Helper constructor for malformed stream messages.
    pub fn malformed(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        CaptureError::Malformed { topic: topic.into(), reason: reason.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        CaptureError::Config { reason: reason.into(), source: None }
    }

    /// Helper constructor for configuration errors with source.
    pub fn config_with_source(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        CaptureError::Config { reason: reason.into(), source: Some(Box::new(source)) }
    }
}

impl From<zeromq::ZmqError> for CaptureError {
    fn from(err: zeromq::ZmqError) -> Self {
        CaptureError::Transport { context: "ZeroMQ socket error".to_string(), source: Some(Box::new(err)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn messages_carry_their_context(
            port in 1u16..,
            topic in "[a-z.]{1,20}",
            reason in ".*",
            pid in 1u32..100_000u32,
        ) {
            let port_msg = CaptureError::PortInUse { port }.to_string();
            prop_assert!(port_msg.contains(&port.to_string()));

            let malformed = CaptureError::malformed(topic.clone(), reason.clone()).to_string();
            prop_assert!(malformed.contains(&topic));
            prop_assert!(malformed.contains(&reason));

            let reap = CaptureError::ProcessReap { pid, reason: reason.clone() }.to_string();
            prop_assert!(reap.contains(&pid.to_string()));
        }
    }

    #[test]
    fn fatality_follows_phase_policy() {
        assert!(CaptureError::PortInUse { port: 50020 }.is_fatal());
        assert!(CaptureError::transport("subscribe").is_fatal());
        assert!(CaptureError::ControlTimeout { duration: Duration::from_secs(1) }.is_fatal());
        assert!(!CaptureError::malformed("frame.world", "size mismatch").is_fatal());
        assert!(!CaptureError::ProcessReap { pid: 1, reason: "gone".into() }.is_fatal());
    }

    #[test]
    fn spawn_error_chains_io_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let error = CaptureError::spawn_failed("/opt/pupil/capture", io_err);

        assert!(!error.is_retryable());
        let source = std::error::Error::source(&error).expect("io source");
        assert_eq!(source.to_string(), "no such file");
        assert!(error.to_string().contains("/opt/pupil/capture"));
    }

    #[test]
    fn invalid_state_names_operation_and_state() {
        let error = CaptureError::InvalidState {
            operation: "start capture",
            state: ConnectionState::Unconnected,
        };
        let msg = error.to_string();
        assert!(msg.contains("start capture"));
        assert!(msg.contains("unconnected"));
    }

    #[test]
    fn every_variant_has_suggestions() {
        let errors = [
            CaptureError::PortInUse { port: 1 },
            CaptureError::spawn_failed("x", std::io::Error::other("x")),
            CaptureError::transport("x"),
            CaptureError::ControlTimeout { duration: Duration::from_millis(1) },
            CaptureError::malformed("t", "r"),
            CaptureError::ProcessReap { pid: 1, reason: "r".into() },
            CaptureError::config("bad alpha"),
        ];
        for error in &errors {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty(), "{error} has no suggestions");
            assert!(suggestions.iter().all(|s| s.len() > 5));
        }
    }

    #[test]
    fn error_is_send_sync_static() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<CaptureError>();
    }
}
