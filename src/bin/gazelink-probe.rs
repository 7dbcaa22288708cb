use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gazelink::{CaptureConfig, CaptureSession, UpdateRate};

/// Launch Pupil Capture, stream frames and gaze, and log what arrives.
///
/// Ctrl-C (or SIGTERM) shuts the capture program down cleanly.
#[derive(Parser, Debug)]
#[command(name = "gazelink-probe")]
#[command(about = "Supervise a Pupil Capture instance and log its frame and gaze stream")]
struct Args {
    /// YAML configuration file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the capture program
    #[arg(long)]
    program: Option<PathBuf>,

    /// Override the control port
    #[arg(long)]
    control_port: Option<u16>,

    /// Log at most this many frame updates per second
    #[arg(short, long, default_value_t = 2)]
    rate: u32,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(short, long)]
    duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => CaptureConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CaptureConfig::default(),
    };
    if let Some(program) = args.program {
        config.program = program;
    }
    if let Some(port) = args.control_port {
        config.control_port = port;
    }

    let mut session = CaptureSession::new(config)?;
    if let Err(e) = session.connect().await {
        for suggestion in e.recovery_suggestions() {
            warn!("  - {}", suggestion);
        }
        return Err(e).context("connecting to the capture service");
    }
    session.start_capture()?;

    let mut frames = session.frame_updates(UpdateRate::Max(args.rate));
    let stop = shutdown_signal(args.duration.map(Duration::from_secs));
    tokio::pin!(stop);

    let mut logged = 0u64;
    loop {
        tokio::select! {
            _ = &mut stop => break,
            frame = frames.next() => match frame {
                Some(frame) => {
                    logged += 1;
                    info!(
                        width = frame.width,
                        height = frame.height,
                        gaze = ?session.gaze(),
                        gaze_px = ?session.gaze_pixel(),
                        "Frame"
                    );
                }
                None => {
                    warn!("Frame stream ended");
                    break;
                }
            },
        }
    }

    let report = session.terminate().await;
    info!(logged, ?report, "Done");
    Ok(())
}

/// Resolves on Ctrl-C, SIGTERM (unix) or after `limit`.
async fn shutdown_signal(limit: Option<Duration>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received"),
        _ = terminate => info!("SIGTERM received"),
        _ = deadline => info!("Duration elapsed"),
    }
}
