//! Capture session: the lifecycle façade over process, channels and capture loop
//!
//! ```text
//! connect()        reap stale -> probe port -> spawn -> SUB_PORT -> subscribe
//! start_capture()  spawn the capture loop
//! terminate()      stop loop -> notify -> close channels -> kill group -> reap
//! ```
//!
//! Any failure inside `connect()` runs the same teardown as `terminate()`, so a session
//! never holds a half-built set of resources once a call has returned.

use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::control::SHOULD_STOP_SUBJECT;
use crate::channel::{ControlChannel, SubscriberChannel};
use crate::config::CaptureConfig;
use crate::demux::Demultiplexer;
use crate::driver::{Driver, LoopSummary, Snapshots};
use crate::probe;
use crate::provider::Provider;
use crate::stream::ThrottleExt;
use crate::supervisor::{CaptureProcess, ProcessSupervisor};
use crate::types::{ConnectionState, FieldMap, FrameBuffer, GazePoint, UpdateRate};
use crate::{CaptureError, Result};

#[cfg(test)]
mod tests;

/// What one `terminate()` call actually did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Counters from the capture loop, if it was running and stopped in time
    pub loop_summary: Option<LoopSummary>,

    /// The loop missed the join deadline and was aborted
    pub loop_aborted: bool,

    /// The shutdown notification was acknowledged
    pub notified: bool,

    pub control_closed: bool,
    pub stream_closed: bool,

    /// The capture program exited after the group kill
    pub process_killed: bool,

    /// Leftover instances signaled by the final reap
    pub reaped: Vec<u32>,
}

impl TeardownReport {
    /// Whether the call found nothing to release.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One supervised capture session
///
/// Owns the capture program, both channels and the capture loop. Frame and gaze snapshots
/// are readable at any time and survive `terminate()`; a later `connect()` starts a fresh
/// session and clears them.
///
/// Dropping a session that still owns a capture program kills its process group.
pub struct CaptureSession {
    config: CaptureConfig,
    supervisor: ProcessSupervisor,
    state: ConnectionState,
    process: Option<CaptureProcess>,
    control: Option<ControlChannel>,
    stream: Option<SubscriberChannel>,
    capture: Option<JoinHandle<LoopSummary>>,
    stop: CancellationToken,
    snapshots: Arc<Snapshots>,
}

impl CaptureSession {
    /// Create an unconnected session. Fails if `config` does not validate.
    pub fn new(config: CaptureConfig) -> Result<Self> {
        config.validate()?;
        let supervisor = ProcessSupervisor::new(&config.process_name, config.match_command_line);

        Ok(Self {
            config,
            supervisor,
            state: ConnectionState::Unconnected,
            process: None,
            control: None,
            stream: None,
            capture: None,
            stop: CancellationToken::new(),
            snapshots: Arc::new(Snapshots::new()),
        })
    }

    /// Launch the capture program and open both channels.
    ///
    /// Valid from `Unconnected` and `Terminated`. On failure every resource acquired so far
    /// is released, the state ends `Terminated` and the originating error is returned.
    pub async fn connect(&mut self) -> Result<()> {
        if !self.state.can_connect() {
            return Err(CaptureError::InvalidState { operation: "connect", state: self.state });
        }
        if self.state == ConnectionState::Terminated {
            debug!("Starting fresh session");
            self.snapshots.reset();
            self.stop = CancellationToken::new();
        }

        self.state = ConnectionState::Connecting;
        info!(
            program = %self.config.program.display(),
            endpoint = %self.config.control_endpoint(),
            "Connecting to capture service"
        );

        match self.establish().await {
            Ok(()) => {
                self.state = ConnectionState::Streaming;
                info!(pid = ?self.process_id(), "Capture service connected");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Connect failed, tearing down");
                let report = self.teardown().await;
                debug!(?report, "Teardown after failed connect");
                Err(e)
            }
        }
    }

    async fn establish(&mut self) -> Result<()> {
        let config = &self.config;

        let stale = self.supervisor.reap_stale().await;
        for warning in &stale.warnings {
            debug!(%warning, "Stale instance not reaped");
        }
        if !stale.signaled.is_empty() {
            self.supervisor.wait_for_exit(&stale.signaled, config.kill_timeout()).await;
        }

        if probe::port_in_use(&config.host, config.control_port, config.probe_timeout()).await {
            return Err(CaptureError::PortInUse { port: config.control_port });
        }

        let mut process = self.supervisor.spawn(&config.program, &config.args)?;
        let control = ControlChannel::connect_with_retry(
            &config.control_endpoint(),
            config.control_timeout(),
            startup_exit(&mut process),
        )
        .await;
        self.process = Some(process);

        let control = self.control.insert(control?);
        let sub_port = control.request_sub_port().await?;

        let stream = SubscriberChannel::connect(
            &config.host,
            sub_port,
            &config.subscriptions,
            config.control_timeout(),
        )
        .await?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Spawn the capture loop. Valid from `Streaming`.
    ///
    /// A second call while the loop exists logs a warning and does nothing. The loop can
    /// stop on its own (streaming channel closed, or ten consecutive receive errors); the
    /// session then stays `Streaming` with its last snapshots and
    /// [`is_capturing`](Self::is_capturing) turns `false`.
    pub fn start_capture(&mut self) -> Result<()> {
        if self.state != ConnectionState::Streaming {
            return Err(CaptureError::InvalidState { operation: "start_capture", state: self.state });
        }
        if self.capture.is_some() {
            warn!("Capture loop already started");
            return Ok(());
        }

        let stream = self
            .stream
            .take()
            .ok_or_else(|| CaptureError::transport("streaming channel is not open"))?;
        let demux = Demultiplexer::new(self.config.smoothing_alpha);
        self.capture =
            Some(Driver::spawn(stream, demux, Arc::clone(&self.snapshots), self.stop.clone()));

        info!("Capture started");
        Ok(())
    }

    /// Release everything this session holds. Valid from any state and idempotent.
    ///
    /// Each step is best-effort; failures are logged and the remaining steps still run.
    pub async fn terminate(&mut self) -> TeardownReport {
        self.teardown().await
    }

    async fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.state == ConnectionState::Terminated {
            debug!("Session already terminated");
            return report;
        }

        self.state = ConnectionState::Terminating;
        self.stop.cancel();

        if let Some(mut handle) = self.capture.take() {
            let timeout = self.config.join_timeout();
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(summary)) => report.loop_summary = Some(summary),
                Ok(Err(e)) => warn!(error = %e, "Capture loop task failed"),
                Err(_) => {
                    warn!("Capture loop did not stop within {:?}, aborting", timeout);
                    handle.abort();
                    report.loop_aborted = true;
                }
            }
        }

        if let Some(mut control) = self.control.take() {
            if self.config.notify_on_shutdown {
                match control.notify(SHOULD_STOP_SUBJECT, FieldMap::new()).await {
                    Ok(ack) => {
                        debug!(ack = %ack, "Shutdown notification acknowledged");
                        report.notified = true;
                    }
                    Err(e) => warn!(error = %e, "Shutdown notification failed"),
                }
            }
            report.control_closed = control.close().await;
        }

        if let Some(mut stream) = self.stream.take() {
            stream.close().await;
            report.stream_closed = true;
        }

        if let Some(mut process) = self.process.take() {
            report.process_killed =
                self.supervisor.kill_group(&mut process, self.config.kill_timeout()).await;

            let leftovers = self.supervisor.reap_stale().await;
            for warning in &leftovers.warnings {
                debug!(%warning, "Leftover instance not reaped");
            }
            report.reaped = leftovers.signaled;
        }

        self.state = ConnectionState::Terminated;
        info!(
            notified = report.notified,
            process_killed = report.process_killed,
            reaped = report.reaped.len(),
            "Capture session terminated"
        );
        report
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the capture loop is running
    pub fn is_capturing(&self) -> bool {
        self.capture.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Pid (and process group id) of the running capture program
    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().map(CaptureProcess::pid)
    }

    /// Most recent validated world frame, if any arrived
    pub fn latest_frame(&self) -> Option<Arc<FrameBuffer>> {
        self.snapshots.latest_frame()
    }

    /// Current smoothed gaze, `(0, 0)` until the first pupil sample
    pub fn gaze(&self) -> GazePoint {
        self.snapshots.gaze()
    }

    /// Gaze in pixel coordinates of the latest frame; `None` before the first frame.
    pub fn gaze_pixel(&self) -> Option<(f64, f64)> {
        let frame = self.latest_frame()?;
        Some(self.gaze().to_pixel(&frame))
    }

    /// Stream of published frames, ending when the session terminates.
    ///
    /// Yields the current frame first if one exists. With [`UpdateRate::Max`] the stream
    /// is throttled and only the latest frame of each interval is delivered.
    pub fn frame_updates(&self, rate: UpdateRate) -> BoxStream<'static, Arc<FrameBuffer>> {
        let frames = WatchStream::new(self.snapshots.subscribe_frames())
            .filter_map(|frame| async move { frame })
            .take_until(self.stop.clone().cancelled_owned());

        match rate.throttle_interval() {
            Some(interval) => frames.throttle(interval).boxed(),
            None => frames.boxed(),
        }
    }

    /// Stream of smoothed gaze updates, ending when the session terminates.
    pub fn gaze_updates(&self) -> BoxStream<'static, GazePoint> {
        WatchStream::new(self.snapshots.subscribe_gaze())
            .take_until(self.stop.clone().cancelled_owned())
            .boxed()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.capture.take() {
            handle.abort();
        }
        if let Some(mut process) = self.process.take() {
            warn!(pid = process.pid(), "Session dropped while capture program running, killing group");
            process.signal_group_kill();
        }
    }
}

/// Resolves once the freshly spawned program exits.
async fn startup_exit(process: &mut CaptureProcess) -> CaptureError {
    match process.wait_exit().await {
        Ok(status) => CaptureError::ProcessExited { status },
        Err(e) => CaptureError::transport_with_source("wait for capture program", e),
    }
}
