//! Supervision of the external capture program
//!
//! The capture program is launched as the leader of a fresh process group, so that it and
//! every helper it forks can be killed with one group-wide signal. Stale instances left
//! behind by earlier runs are found by name and asked to terminate before a new one starts.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, Signal, System, UpdateKind};
use tokio::process::{Child, Command};
use tracing::{debug, info, trace, warn};

use crate::{CaptureError, Result};

/// Poll interval while waiting for reaped processes to disappear
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of a stale-instance scan
#[derive(Debug, Default)]
pub struct ReapReport {
    /// Pids that were sent a terminate signal
    pub signaled: Vec<u32>,

    /// Matching processes that could not be signaled ([`CaptureError::ProcessReap`])
    pub warnings: Vec<CaptureError>,
}

/// A launched capture program, leader of its own process group
#[derive(Debug)]
pub struct CaptureProcess {
    child: Child,
    pid: u32,
}

impl CaptureProcess {
    /// Process id, which is also the process group id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit status if the process has already exited
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Wait for the process to exit. Cancel-safe.
    pub async fn wait_exit(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Send SIGKILL to the whole process group without waiting.
    ///
    /// Falls back to killing the child alone when the group signal fails. Returns whether
    /// any signal was delivered.
    pub fn signal_group_kill(&mut self) -> bool {
        #[cfg(unix)]
        {
            // SAFETY: killpg has no memory-safety preconditions
            let rc = unsafe { libc::killpg(self.pid as libc::pid_t, libc::SIGKILL) };
            if rc == 0 {
                return true;
            }
            trace!(
                pid = self.pid,
                error = %std::io::Error::last_os_error(),
                "Group kill failed, killing child directly"
            );
        }
        self.child.start_kill().is_ok()
    }
}

/// Finds, launches and kills capture program instances
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    /// Lowercased name fragment
    name_fragment: String,
    match_command_line: bool,
}

impl ProcessSupervisor {
    pub fn new(process_name: &str, match_command_line: bool) -> Self {
        Self { name_fragment: process_name.to_lowercase(), match_command_line }
    }

    /// Whether a process with this name and command line belongs to the capture program.
    pub fn matches(&self, name: &str, cmd: &[String]) -> bool {
        if name.to_lowercase().contains(&self.name_fragment) {
            return true;
        }
        self.match_command_line && cmd.join(" ").to_lowercase().contains(&self.name_fragment)
    }

    /// [`reap_stale_instances`](Self::reap_stale_instances) on the blocking pool.
    pub async fn reap_stale(&self) -> ReapReport {
        let supervisor = self.clone();
        match tokio::task::spawn_blocking(move || supervisor.reap_stale_instances()).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Stale instance scan failed");
                ReapReport::default()
            }
        }
    }

    /// Send a graceful terminate signal to every live instance of the capture program.
    ///
    /// Scans the full process table, so prefer [`reap_stale`](Self::reap_stale) from async
    /// code. Best-effort: processes that vanish, refuse the signal or are already zombies are
    /// recorded as warnings, never returned as errors. The current process and its parent
    /// are never signaled.
    pub fn reap_stale_instances(&self) -> ReapReport {
        // Command lines are not loaded by a plain refresh
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::Always));

        let own_pid = sysinfo::get_current_pid().ok();
        let parent_pid = own_pid.and_then(|pid| system.process(pid)).and_then(|p| p.parent());

        let mut report = ReapReport::default();
        for (pid, process) in system.processes() {
            if Some(*pid) == own_pid || Some(*pid) == parent_pid {
                continue;
            }
            if !self.matches(process.name(), process.cmd()) {
                continue;
            }

            let pid = pid.as_u32();
            if process.status() == ProcessStatus::Zombie {
                debug!(pid, "Skipping zombie capture process");
                report.warnings.push(reap_warning(pid, "already a zombie"));
                continue;
            }

            match process.kill_with(Signal::Term) {
                Some(true) => {
                    info!(pid, name = process.name(), "Terminated stale capture process");
                    report.signaled.push(pid);
                }
                Some(false) => {
                    debug!(pid, "Stale capture process refused terminate signal");
                    report.warnings.push(reap_warning(pid, "signal not delivered"));
                }
                None => {
                    // SIGTERM is unsupported on this platform
                    if process.kill() {
                        info!(pid, "Killed stale capture process");
                        report.signaled.push(pid);
                    } else {
                        report.warnings.push(reap_warning(pid, "kill not delivered"));
                    }
                }
            }
        }

        if !report.signaled.is_empty() || !report.warnings.is_empty() {
            debug!(
                signaled = report.signaled.len(),
                warnings = report.warnings.len(),
                "Stale instance scan complete"
            );
        }
        report
    }

    /// Wait until every pid in `pids` has exited, or `timeout` passes.
    ///
    /// Returns the pids still alive at the deadline. Zombies count as exited.
    pub async fn wait_for_exit(&self, pids: &[u32], timeout: Duration) -> Vec<u32> {
        let deadline = Instant::now() + timeout;
        let mut system = System::new();
        let mut alive: Vec<u32> = pids.to_vec();

        loop {
            alive.retain(|&pid| {
                let sys_pid = Pid::from_u32(pid);
                system.refresh_process(sys_pid)
                    && system.process(sys_pid).is_some_and(|p| p.status() != ProcessStatus::Zombie)
            });
            if alive.is_empty() {
                return alive;
            }
            if Instant::now() >= deadline {
                warn!(?alive, "Stale capture processes still alive after {:?}", timeout);
                return alive;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Launch the capture program as the leader of a new process group.
    pub fn spawn(&self, program: &Path, args: &[String]) -> Result<CaptureProcess> {
        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        let child = command
            .spawn()
            .map_err(|e| CaptureError::spawn_failed(program.display().to_string(), e))?;
        let pid = child.id().ok_or_else(|| {
            CaptureError::spawn_failed(
                program.display().to_string(),
                std::io::Error::other("child exited before its pid could be read"),
            )
        })?;

        info!(pid, program = %program.display(), ?args, "Launched capture program");
        Ok(CaptureProcess { child, pid })
    }

    /// Kill the process group and wait up to `timeout` for the leader to exit.
    ///
    /// Descendants that moved to another process group are killed individually. A timeout
    /// is logged and reported as `false`, never escalated.
    pub async fn kill_group(&self, process: &mut CaptureProcess, timeout: Duration) -> bool {
        let leader = process.pid;
        let strays = tokio::task::spawn_blocking(move || descendants_of(leader))
            .await
            .unwrap_or_default();

        if !process.signal_group_kill() {
            debug!(pid = process.pid, "No kill signal delivered, process likely gone");
        }
        kill_pids(&strays);

        match tokio::time::timeout(timeout, process.child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = process.pid, %status, "Capture program exited");
                true
            }
            Ok(Err(e)) => {
                warn!(pid = process.pid, error = %e, "Failed to collect capture program exit status");
                false
            }
            Err(_) => {
                warn!(pid = process.pid, "Capture program did not exit within {:?}", timeout);
                false
            }
        }
    }
}

fn reap_warning(pid: u32, reason: &str) -> CaptureError {
    CaptureError::ProcessReap { pid, reason: reason.to_string() }
}

/// All transitive children of `root`, deepest last
fn descendants_of(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes();

    let mut found = Vec::new();
    let mut frontier = vec![Pid::from_u32(root)];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) && !found.contains(&pid.as_u32()) {
                found.push(pid.as_u32());
                frontier.push(*pid);
            }
        }
    }
    found
}

fn kill_pids(pids: &[u32]) {
    if pids.is_empty() {
        return;
    }
    let mut system = System::new();
    for &pid in pids {
        let sys_pid = Pid::from_u32(pid);
        if !system.refresh_process(sys_pid) {
            continue;
        }
        if system.process(sys_pid).is_some_and(|process| process.kill()) {
            debug!(pid, "Killed stray capture descendant");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_name_case_insensitively() {
        let supervisor = ProcessSupervisor::new("Pupil", false);
        assert!(supervisor.matches("pupil_capture", &[]));
        assert!(supervisor.matches("PUPIL_SERVICE", &[]));
        assert!(!supervisor.matches("python3", &["python3".into(), "pupil/main.py".into()]));
    }

    #[test]
    fn command_line_matching_is_opt_in() {
        let supervisor = ProcessSupervisor::new("pupil", true);
        let cmd = vec!["python3".to_string(), "pupil/pupil_src/main.py".to_string()];
        assert!(supervisor.matches("python3", &cmd));
        assert!(!supervisor.matches("python3", &["python3".into(), "other.py".into()]));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let supervisor = ProcessSupervisor::new("gazelink-missing", false);
        let err = supervisor
            .spawn(Path::new("/nonexistent/gazelink-capture-program"), &[])
            .expect_err("missing executable");
        assert!(matches!(err, CaptureError::Spawn { .. }));
    }

    #[tokio::test]
    async fn reap_with_unmatched_name_signals_nothing() {
        let supervisor = ProcessSupervisor::new("gazelink-no-such-process-7f3a", true);
        let report = supervisor.reap_stale().await;
        assert!(report.signaled.is_empty());
        assert!(supervisor.wait_for_exit(&report.signaled, Duration::from_millis(10)).await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_group_takes_down_forked_children() {
        let supervisor = ProcessSupervisor::new("gazelink-kill-group-test", false);
        let args = vec!["-c".to_string(), "sleep 30 & sleep 30; wait".to_string()];
        let mut process = supervisor.spawn(Path::new("/bin/sh"), &args).expect("spawn sh");
        let leader = process.pid();

        // Let the shell fork its background child
        tokio::time::sleep(Duration::from_millis(100)).await;
        let strays = descendants_of(leader);
        assert!(!strays.is_empty(), "shell should have forked sleepers");

        assert!(supervisor.kill_group(&mut process, Duration::from_secs(5)).await);
        assert!(process.try_exit_status().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reaps_stale_instance_by_command_line() {
        let marker = format!("gazelink-reap-{}", std::process::id());
        let supervisor = ProcessSupervisor::new(&marker, true);
        // Two commands so the shell cannot exec into sleep and drop the marker
        let args = vec!["-c".to_string(), format!("sleep 30; echo {marker}")];
        let mut process = supervisor.spawn(Path::new("/bin/sh"), &args).expect("spawn sh");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = supervisor.reap_stale_instances();
        assert!(report.signaled.contains(&process.pid()), "report: {report:?}");

        // The leader is our own child, so collect it to avoid a zombie
        let status = tokio::time::timeout(Duration::from_secs(5), process.child.wait())
            .await
            .expect("exit in time")
            .expect("status");
        assert!(!status.success());
        process.signal_group_kill();
    }
}
