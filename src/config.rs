//! Capture session configuration
//!
//! Every field has a default matching a stock Pupil Capture checkout, so an empty YAML
//! document is a valid configuration:
//!
//! ```yaml
//! program: python3
//! args: [pupil/pupil_src/main.py, capture, --hide-ui]
//! process_name: pupil
//! control_port: 50020
//! smoothing_alpha: 0.03
//! control_timeout_ms: 20000   # null waits forever
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::DEFAULT_SMOOTHING_ALPHA;
use crate::{CaptureError, Result};

/// Well-known control port of Pupil Capture's remote plugin
pub const DEFAULT_CONTROL_PORT: u16 = 50020;

/// Configuration for a [`CaptureSession`](crate::CaptureSession)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Executable to launch
    pub program: PathBuf,

    /// Arguments requesting capture mode with a hidden UI
    pub args: Vec<String>,

    /// Case-insensitive name fragment identifying capture processes to reap
    pub process_name: String,

    /// Also match `process_name` against the full command line
    ///
    /// Needed when the program runs under an interpreter, whose process name
    /// is the interpreter's.
    pub match_command_line: bool,

    /// Host the capture service listens on
    pub host: String,

    /// Control (request/reply) port
    pub control_port: u16,

    /// Topic prefixes to subscribe to
    pub subscriptions: Vec<String>,

    /// EMA factor for gaze smoothing, in `(0, 1]`
    pub smoothing_alpha: f64,

    /// Send `service_process.should_stop` before killing the process
    pub notify_on_shutdown: bool,

    /// Port probe connect timeout
    pub probe_timeout_ms: u64,

    /// Bound on control-channel startup and replies; `None` waits forever
    pub control_timeout_ms: Option<u64>,

    /// Bounded wait for the capture loop to stop
    pub join_timeout_ms: u64,

    /// Wait for the process group to exit after the kill signal
    pub kill_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: vec![
                "pupil/pupil_src/main.py".to_string(),
                "capture".to_string(),
                "--hide-ui".to_string(),
            ],
            process_name: "pupil".to_string(),
            match_command_line: true,
            host: "127.0.0.1".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            subscriptions: vec!["frame.".to_string(), "pupil.".to_string()],
            smoothing_alpha: DEFAULT_SMOOTHING_ALPHA,
            notify_on_shutdown: true,
            probe_timeout_ms: 200,
            control_timeout_ms: Some(20_000),
            join_timeout_ms: 1_000,
            kill_timeout_ms: 5_000,
        }
    }
}

impl CaptureConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml_ng::from_str(yaml)
                .map_err(|e| CaptureError::config_with_source("YAML parse failed", e))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            CaptureError::config_with_source(format!("cannot read {}", path.display()), e)
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.program.as_os_str().is_empty() {
            return Err(CaptureError::config("program must not be empty"));
        }
        if self.process_name.trim().is_empty() {
            return Err(CaptureError::config("process_name must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(CaptureError::config("host must not be empty"));
        }
        if self.control_port == 0 {
            return Err(CaptureError::config("control_port must be non-zero"));
        }
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return Err(CaptureError::config(format!(
                "smoothing_alpha must be in (0, 1], got {}",
                self.smoothing_alpha
            )));
        }
        if self.subscriptions.is_empty() {
            return Err(CaptureError::config("at least one subscription is required"));
        }
        Ok(())
    }

    /// `tcp://host:control_port`
    pub fn control_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.control_port)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn control_timeout(&self) -> Option<Duration> {
        self.control_timeout_ms.map(Duration::from_millis)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}
