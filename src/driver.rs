//! Capture loop: pulls stream messages and publishes frame and gaze snapshots

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::demux::{Demultiplexer, Dispatch};
use crate::provider::Provider;
use crate::types::{FrameBuffer, GazePoint};

/// Consecutive transport errors after which the loop gives up
const MAX_ERRORS: u32 = 10;

/// Latest-value snapshots shared between the capture loop and readers
///
/// Each value is replaced whole, so a reader never sees a frame whose dimensions
/// disagree with its pixels.
#[derive(Debug)]
pub struct Snapshots {
    frame: watch::Sender<Option<Arc<FrameBuffer>>>,
    gaze: watch::Sender<GazePoint>,
}

impl Snapshots {
    pub fn new() -> Self {
        let (frame, _) = watch::channel(None);
        let (gaze, _) = watch::channel(GazePoint::default());
        Self { frame, gaze }
    }

    pub fn latest_frame(&self) -> Option<Arc<FrameBuffer>> {
        self.frame.borrow().clone()
    }

    pub fn gaze(&self) -> GazePoint {
        *self.gaze.borrow()
    }

    pub fn subscribe_frames(&self) -> watch::Receiver<Option<Arc<FrameBuffer>>> {
        self.frame.subscribe()
    }

    pub fn subscribe_gaze(&self) -> watch::Receiver<GazePoint> {
        self.gaze.subscribe()
    }

    pub fn publish_frame(&self, frame: Arc<FrameBuffer>) {
        self.frame.send_replace(Some(frame));
    }

    pub fn publish_gaze(&self, gaze: GazePoint) {
        self.gaze.send_replace(gaze);
    }

    /// Back to "no frame yet" and gaze `(0, 0)`.
    pub fn reset(&self) {
        self.frame.send_replace(None);
        self.gaze.send_replace(GazePoint::default());
    }
}

impl Default for Snapshots {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the capture loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopExit {
    /// Stop flag was set
    #[default]
    Cancelled,

    /// Provider reported its channel torn down
    ProviderEnded,

    /// [`MAX_ERRORS`] consecutive transport errors
    TooManyErrors,
}

/// Counters returned by the capture loop when it exits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopSummary {
    pub messages: u64,
    pub frames: u64,
    pub gaze_samples: u64,
    pub ignored: u64,
    pub dropped: u64,
    pub transport_errors: u64,
    pub exit: LoopExit,
}

/// Spawns the capture loop task
///
/// The task owns the provider and the demultiplexer. It is the only writer of the
/// [`Snapshots`]; the stop flag is the only way in.
pub struct Driver;

impl Driver {
    pub fn spawn<P>(
        provider: P,
        demux: Demultiplexer,
        snapshots: Arc<Snapshots>,
        cancel: CancellationToken,
    ) -> JoinHandle<LoopSummary>
    where
        P: Provider,
    {
        tokio::spawn(Self::capture_loop(provider, demux, snapshots, cancel))
    }

    async fn capture_loop<P>(
        mut provider: P,
        mut demux: Demultiplexer,
        snapshots: Arc<Snapshots>,
        cancel: CancellationToken,
    ) -> LoopSummary
    where
        P: Provider,
    {
        info!("Capture loop started");
        let mut summary = LoopSummary::default();
        let mut error_count = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Capture loop cancelled");
                    summary.exit = LoopExit::Cancelled;
                    break;
                }
                result = provider.next_message() => result,
            };

            match result {
                Ok(Some(raw)) => {
                    summary.messages += 1;
                    error_count = 0;

                    match demux.handle(raw) {
                        Dispatch::Frame(frame) => {
                            summary.frames += 1;
                            trace!(width = frame.width, height = frame.height, "Publishing frame");
                            snapshots.publish_frame(Arc::new(frame));
                        }
                        Dispatch::Gaze(gaze) => {
                            summary.gaze_samples += 1;
                            snapshots.publish_gaze(gaze);
                        }
                        Dispatch::Ignored => summary.ignored += 1,
                        Dispatch::Dropped(reason) => {
                            summary.dropped += 1;
                            debug!(reason = %reason, "Dropped malformed message");
                        }
                    }
                }
                Ok(None) => {
                    info!(messages = summary.messages, "Streaming channel closed");
                    summary.exit = LoopExit::ProviderEnded;
                    break;
                }
                Err(e) => {
                    error_count += 1;
                    summary.transport_errors += 1;
                    error!("Stream receive error ({}/{}): {}", error_count, MAX_ERRORS, e);

                    if error_count >= MAX_ERRORS {
                        error!("Too many stream errors, stopping capture loop");
                        summary.exit = LoopExit::TooManyErrors;
                        break;
                    }

                    // 100ms, 200ms, ... capped at 1.6s
                    let backoff = Duration::from_millis(50 * (1 << error_count.min(5)));
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            summary.exit = LoopExit::Cancelled;
                            break;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        provider.close().await;
        info!(
            messages = summary.messages,
            frames = summary.frames,
            gaze_samples = summary.gaze_samples,
            dropped = summary.dropped,
            exit = ?summary.exit,
            "Capture loop ended"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CaptureError;
    use crate::test_utils::{ScriptedProvider, pupil_message, world_frame_message};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn publishes_until_provider_ends() {
        let _ = tracing_subscriber::fmt::try_init();
        let provider = ScriptedProvider::from_messages(vec![
            world_frame_message(2, 1, &[10, 20, 30, 40, 50, 60]),
            pupil_message("pupil.0.2d", 1.0, 1.0),
            world_frame_message(2, 2, &[0; 10]),
            pupil_message("blinks", 0.0, 0.0),
        ]);
        let closed = provider.closed_flag();
        let snapshots = Arc::new(Snapshots::new());

        let summary = Driver::spawn(
            provider,
            Demultiplexer::new(0.5),
            Arc::clone(&snapshots),
            CancellationToken::new(),
        )
        .await
        .expect("loop task");

        assert_eq!(summary.exit, LoopExit::ProviderEnded);
        assert_eq!(
            (summary.messages, summary.frames, summary.gaze_samples, summary.dropped, summary.ignored),
            (4, 1, 1, 1, 1)
        );
        assert!(closed.load(Ordering::SeqCst));

        let frame = snapshots.latest_frame().expect("published frame");
        assert_eq!((frame.width, frame.height), (2, 1));
        assert_eq!(&frame.data[..], &[30, 20, 10, 60, 50, 40]);
        assert_eq!(snapshots.gaze(), GazePoint::new(0.5, 0.5));
    }

    #[tokio::test]
    async fn cancel_interrupts_pending_receive() {
        let (provider, _tx) = ScriptedProvider::channel();
        let closed = provider.closed_flag();
        let cancel = CancellationToken::new();

        let handle =
            Driver::spawn(provider, Demultiplexer::new(0.03), Arc::new(Snapshots::new()), cancel.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let summary = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop stops promptly")
            .expect("loop task");
        assert_eq!(summary.exit, LoopExit::Cancelled);
        assert_eq!(summary.messages, 0);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_consecutive_errors() {
        let (provider, tx) = ScriptedProvider::channel();
        for _ in 0..MAX_ERRORS {
            tx.send(Err(CaptureError::transport("connection reset"))).expect("queue error");
        }

        let summary = Driver::spawn(
            provider,
            Demultiplexer::new(0.03),
            Arc::new(Snapshots::new()),
            CancellationToken::new(),
        )
        .await
        .expect("loop task");

        assert_eq!(summary.exit, LoopExit::TooManyErrors);
        assert_eq!(summary.transport_errors, MAX_ERRORS as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_message_resets_error_count() {
        let (provider, tx) = ScriptedProvider::channel();
        for _ in 0..MAX_ERRORS - 1 {
            tx.send(Err(CaptureError::transport("connection reset"))).expect("queue error");
        }
        tx.send(Ok(pupil_message("pupil.0", 0.2, 0.4))).expect("queue message");
        for _ in 0..MAX_ERRORS - 1 {
            tx.send(Err(CaptureError::transport("connection reset"))).expect("queue error");
        }
        drop(tx);

        let summary = Driver::spawn(
            provider,
            Demultiplexer::new(1.0),
            Arc::new(Snapshots::new()),
            CancellationToken::new(),
        )
        .await
        .expect("loop task");

        assert_eq!(summary.exit, LoopExit::ProviderEnded);
        assert_eq!(summary.transport_errors, 2 * (MAX_ERRORS as u64 - 1));
        assert_eq!(summary.gaze_samples, 1);
    }

    #[test]
    fn reset_clears_snapshots() {
        let snapshots = Snapshots::new();
        let frame = FrameBuffer::from_bgr(1, 1, &[1, 2, 3]).expect("frame");
        snapshots.publish_frame(Arc::new(frame));
        snapshots.publish_gaze(GazePoint::new(0.3, 0.7));
        let mut frames = snapshots.subscribe_frames();

        snapshots.reset();
        assert!(snapshots.latest_frame().is_none());
        assert_eq!(snapshots.gaze(), GazePoint::default());
        assert!(frames.has_changed().expect("sender alive"));
        assert!(frames.borrow_and_update().is_none());
    }
}
