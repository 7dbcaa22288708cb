//! Lifecycle scenarios against an in-process fake capture service
//!
//! The capture program is `/bin/sh`: it creates a gate file, which makes the fake service
//! bind the control port, and then sleeps until killed. This keeps the real order of
//! probe, spawn and connect intact.

#![cfg(unix)]

use super::*;
use crate::supervisor::{CaptureProcess, ProcessSupervisor};
use crate::test_utils::{
    FakeCaptureService, FakeServiceOptions, pupil_message, unused_port, world_frame_message,
};
use std::net::TcpListener;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Config launching a shell that opens `gate` and then idles, tagged with a unique marker.
fn shell_config(port: u16, gate: &Path) -> CaptureConfig {
    let marker = format!("gazelink-session-{}-{port}", std::process::id());
    CaptureConfig {
        program: "/bin/sh".into(),
        args: vec![
            "-c".to_string(),
            format!("touch '{}'; sleep 30; echo {marker}", gate.display()),
        ],
        process_name: marker,
        match_command_line: true,
        control_port: port,
        control_timeout_ms: Some(5_000),
        ..CaptureConfig::default()
    }
}

async fn gated_service(port: u16, gate: &Path) -> FakeCaptureService {
    FakeCaptureService::start_with(FakeServiceOptions {
        control_port: Some(port),
        gate: Some(gate.to_path_buf()),
        mute: false,
    })
    .await
}

async fn wait_for_frame(session: &CaptureSession) -> Arc<FrameBuffer> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(frame) = session.latest_frame() {
            return frame;
        }
        assert!(Instant::now() < deadline, "no frame published in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn normal_lifecycle() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = TempDir::new().expect("temp dir");
    let gate = dir.path().join("ready");
    let port = unused_port();

    let service = gated_service(port, &gate).await;
    let payload: Vec<u8> = (0..12).collect();
    service.publish_repeatedly(vec![
        world_frame_message(2, 2, &payload),
        pupil_message("pupil.0.2d", 1.0, 1.0),
    ]);

    let mut session = CaptureSession::new(shell_config(port, &gate)).expect("valid config");
    assert_eq!(session.state(), ConnectionState::Unconnected);
    assert!(session.latest_frame().is_none());
    assert!(session.gaze_pixel().is_none());

    session.connect().await.expect("connect");
    assert_eq!(session.state(), ConnectionState::Streaming);
    let pid = session.process_id().expect("capture program running");

    let mut frames = session.frame_updates(UpdateRate::Max(30));
    assert!(!session.is_capturing());
    session.start_capture().expect("start");
    session.start_capture().expect("second start is a no-op");
    assert!(session.is_capturing());

    let frame = wait_for_frame(&session).await;
    assert_eq!((frame.width, frame.height, frame.channels), (2, 2, 3));
    assert_eq!(frame.len(), 12);
    assert_eq!(frame.pixel(1, 1), Some([11, 10, 9]));

    let streamed = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("frame update in time")
        .expect("stream open");
    assert_eq!(streamed.width, 2);

    let gaze = session.gaze();
    assert!(gaze.x > 0.0 && gaze.x <= 1.0, "gaze {gaze:?}");
    let (px, py) = session.gaze_pixel().expect("frame exists");
    assert!((px - gaze.x * 2.0).abs() < 1e-9 && (py - gaze.y * 2.0).abs() < 1e-9);

    let report = session.terminate().await;
    assert_eq!(session.state(), ConnectionState::Terminated);
    assert!(session.process_id().is_none());
    assert!(report.notified);
    assert!(report.control_closed);
    assert!(report.process_killed);
    assert!(!report.loop_aborted);
    assert!(report.reaped.is_empty(), "own program was already killed: {report:?}");
    assert!(!session.is_capturing());
    let summary = report.loop_summary.expect("loop joined");
    assert!(summary.frames >= 1);

    assert!(service.notifications().await.contains(&SHOULD_STOP_SUBJECT.to_string()));
    assert!(
        ProcessSupervisor::new("unused", false)
            .wait_for_exit(&[pid], Duration::from_secs(5))
            .await
            .is_empty()
    );

    // Snapshots survive terminate; subscriptions end with it
    assert!(session.latest_frame().is_some());
    let ended = tokio::time::timeout(Duration::from_secs(1), async {
        while frames.next().await.is_some() {}
    })
    .await;
    assert!(ended.is_ok(), "frame stream should end after terminate");

    assert!(session.terminate().await.is_empty());
}

/// A program outside the session whose command line carries `marker`
fn spawn_leftover(marker: &str) -> CaptureProcess {
    let args = vec!["-c".to_string(), format!("sleep 30; echo {marker}")];
    ProcessSupervisor::new("unused", false)
        .spawn(Path::new("/bin/sh"), &args)
        .expect("spawn leftover instance")
}

#[tokio::test]
async fn stale_instances_are_reaped_around_the_session() {
    let dir = TempDir::new().expect("temp dir");
    let gate = dir.path().join("ready");
    let port = unused_port();
    let _service = gated_service(port, &gate).await;
    let config = shell_config(port, &gate);

    let mut stale = spawn_leftover(&config.process_name);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut session = CaptureSession::new(config.clone()).expect("valid config");
    session.connect().await.expect("connect");
    assert_ne!(session.process_id(), Some(stale.pid()));

    let status = tokio::time::timeout(Duration::from_secs(1), stale.wait_exit())
        .await
        .expect("stale instance terminated before connect returned")
        .expect("exit status");
    assert!(!status.success());
    stale.signal_group_kill();

    // Started behind the session's back, so only the final reap can catch it
    let mut stray = spawn_leftover(&config.process_name);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = session.terminate().await;
    assert!(report.process_killed);
    assert_eq!(report.reaped, vec![stray.pid()]);

    let status = tokio::time::timeout(Duration::from_secs(5), stray.wait_exit())
        .await
        .expect("stray instance terminated")
        .expect("exit status");
    assert!(!status.success());
    stray.signal_group_kill();
}

#[tokio::test]
async fn port_conflict_fails_before_spawn() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let config = CaptureConfig {
        program: "/nonexistent/gazelink-capture".into(),
        process_name: format!("gazelink-conflict-{port}"),
        control_port: port,
        ..CaptureConfig::default()
    };
    let mut session = CaptureSession::new(config).expect("valid config");

    let err = session.connect().await.expect_err("port is taken");
    assert!(matches!(err, CaptureError::PortInUse { port: p } if p == port), "{err:?}");
    assert_eq!(session.state(), ConnectionState::Terminated);
    assert!(session.process_id().is_none());
}

#[tokio::test]
async fn spawn_failure_leaves_nothing_to_tear_down() {
    let port = unused_port();
    let config = CaptureConfig {
        program: "/nonexistent/gazelink-capture".into(),
        process_name: format!("gazelink-missing-{port}"),
        control_port: port,
        ..CaptureConfig::default()
    };
    let mut session = CaptureSession::new(config).expect("valid config");

    let err = session.connect().await.expect_err("missing program");
    assert!(matches!(err, CaptureError::Spawn { .. }), "{err:?}");
    assert_eq!(session.state(), ConnectionState::Terminated);

    assert!(session.terminate().await.is_empty());
    assert!(session.terminate().await.is_empty());
}

#[tokio::test]
async fn early_exit_is_reported() {
    let port = unused_port();
    let config = CaptureConfig {
        program: "/bin/sh".into(),
        args: vec!["-c".to_string(), "exit 3".to_string()],
        process_name: format!("gazelink-early-exit-{port}"),
        control_port: port,
        control_timeout_ms: Some(5_000),
        ..CaptureConfig::default()
    };
    let mut session = CaptureSession::new(config).expect("valid config");

    let started = Instant::now();
    let err = session.connect().await.expect_err("program exits");
    let CaptureError::ProcessExited { status } = err else { panic!("unexpected error {err:?}") };
    assert_eq!(status.code(), Some(3));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(session.state(), ConnectionState::Terminated);
}

#[tokio::test]
async fn silent_service_times_out_and_tears_down() {
    let dir = TempDir::new().expect("temp dir");
    let gate = dir.path().join("ready");
    let port = unused_port();
    let _service = FakeCaptureService::start_with(FakeServiceOptions {
        control_port: Some(port),
        gate: Some(gate.clone()),
        mute: true,
    })
    .await;

    let config = CaptureConfig { control_timeout_ms: Some(500), ..shell_config(port, &gate) };
    let mut session = CaptureSession::new(config).expect("valid config");

    let err = session.connect().await.expect_err("no reply");
    assert!(matches!(err, CaptureError::ControlTimeout { .. }), "{err:?}");
    assert_eq!(session.state(), ConnectionState::Terminated);
    assert!(session.process_id().is_none());
}

#[tokio::test]
async fn operations_check_lifecycle_state() {
    let mut session = CaptureSession::new(CaptureConfig::default()).expect("defaults validate");

    let err = session.start_capture().expect_err("not connected");
    assert!(matches!(
        err,
        CaptureError::InvalidState { operation: "start_capture", state: ConnectionState::Unconnected }
    ));

    assert!(session.terminate().await.is_empty());
    assert_eq!(session.state(), ConnectionState::Terminated);

    let err = session.start_capture().expect_err("terminated");
    assert!(matches!(err, CaptureError::InvalidState { state: ConnectionState::Terminated, .. }));
}

#[tokio::test]
async fn reconnect_starts_fresh_session() {
    let dir = TempDir::new().expect("temp dir");
    let gate = dir.path().join("ready");
    let port = unused_port();
    let service = gated_service(port, &gate).await;
    service.publish_repeatedly(vec![world_frame_message(1, 1, &[1, 2, 3])]);

    let mut session = CaptureSession::new(shell_config(port, &gate)).expect("valid config");
    session.connect().await.expect("first connect");
    let err = session.connect().await.expect_err("already streaming");
    assert!(matches!(err, CaptureError::InvalidState { operation: "connect", .. }));

    session.start_capture().expect("start");
    wait_for_frame(&session).await;
    session.terminate().await;
    service.shutdown();

    // Nothing answers the second run, but published state is cleared before it starts
    assert!(session.latest_frame().is_some());
    assert!(session.connect().await.is_err());
    assert_eq!(session.state(), ConnectionState::Terminated);
    assert!(session.latest_frame().is_none());
    assert_eq!(session.gaze(), GazePoint::default());
}

#[tokio::test]
async fn dropping_session_kills_capture_program() {
    let dir = TempDir::new().expect("temp dir");
    let gate = dir.path().join("ready");
    let port = unused_port();
    let _service = gated_service(port, &gate).await;

    let mut session = CaptureSession::new(shell_config(port, &gate)).expect("valid config");
    session.connect().await.expect("connect");
    let pid = session.process_id().expect("running");

    drop(session);

    let alive = ProcessSupervisor::new("unused", false)
        .wait_for_exit(&[pid], Duration::from_secs(5))
        .await;
    assert!(alive.is_empty(), "capture program {pid} survived its session");
}
