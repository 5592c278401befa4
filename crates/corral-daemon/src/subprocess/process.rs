//! OS process plumbing: spawning, stderr capture, and termination.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::record::CommandSpec;

/// Spawn `spec` in `working_dir` with stdout and stderr piped.
///
/// On unix the child leads its own process group, so termination also
/// reaches anything it forked.
pub(super) fn spawn_child(spec: &CommandSpec, working_dir: &Path) -> std::io::Result<Child> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    info!(
        program = %spec.program,
        args = spec.args.len(),
        working_dir = %working_dir.display(),
        "Spawning subprocess"
    );
    cmd.spawn()
}

/// Log every stderr line of an execution at warn level.
pub(super) fn spawn_stderr_logger(session_id: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let reader = BufReader::new(stderr);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(session_id = %session_id, "stderr: {}", line);
        }
        debug!(session_id = %session_id, "stderr reader finished");
    });
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Signals go to the child's whole process group. Returns the exit status
/// when the process could be reaped.
pub(super) async fn terminate_process(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let pid = child.id();
    if let Some(pid) = pid {
        signal_group(pid, Signal::Term);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(?status, "Process exited after SIGTERM");
            Some(status)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Error waiting for process");
            let _ = child.kill().await;
            None
        }
        Err(_) => {
            warn!("Grace period expired, sending SIGKILL");
            if let Some(pid) = pid {
                signal_group(pid, Signal::Kill);
            }
            let _ = child.kill().await;
            child.try_wait().ok().flatten()
        }
    }
}

/// Stop the rest of a process group whose leader has already exited.
///
/// Waits up to `grace` for `reader` to see end of output after SIGTERM, then
/// sends SIGKILL and aborts the reader.
pub(super) async fn terminate_group(
    pid: Option<u32>,
    reader: &mut JoinHandle<()>,
    grace: Duration,
) {
    let Some(pid) = pid else {
        reader.abort();
        return;
    };

    signal_group(pid, Signal::Term);
    if tokio::time::timeout(grace, &mut *reader).await.is_err() {
        warn!(pid, "Output still open after grace period, sending SIGKILL to group");
        signal_group(pid, Signal::Kill);
        reader.abort();
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: pid is the group id set at spawn; a negative pid addresses the group.
    #[allow(unsafe_code, clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(-(pid as i32), signo) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!(pid, ?signal, "Process group already gone");
        } else {
            warn!(pid, ?signal, error = %err, "Failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, signal: Signal) {
    debug!(pid, ?signal, "Process group signals are unix only");
}

#[cfg(test)]
#[cfg(unix)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn spawn_reports_missing_program() {
        let spec = CommandSpec::new("/nonexistent/corral-test-binary");
        assert!(spawn_child(&spec, Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn terminate_stops_long_running_process() {
        let spec = CommandSpec::shell("exec sleep 30");
        let mut child = spawn_child(&spec, Path::new("/")).unwrap();
        let started = Instant::now();
        let status = terminate_process(&mut child, Duration::from_secs(5)).await;
        assert!(status.is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn sigkill_after_grace_when_sigterm_ignored() {
        let spec = CommandSpec::shell("trap '' TERM; while true; do sleep 0.1; done");
        let mut child = spawn_child(&spec, Path::new("/")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        terminate_process(&mut child, Duration::from_millis(300)).await;
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn terminate_reaches_forked_children() {
        let dir = tempfile::TempDir::new().unwrap();
        let spec = CommandSpec::shell("(sleep 1; touch orphan-ran) & wait");
        let mut child = spawn_child(&spec, dir.path()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        terminate_process(&mut child, Duration::from_secs(2)).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("orphan-ran").exists());
    }

    #[tokio::test]
    async fn terminate_group_closes_output_held_by_grandchild() {
        let spec = CommandSpec::shell("sleep 30 & echo started");
        let mut child = spawn_child(&spec, Path::new("/")).unwrap();
        let pid = child.id();
        let mut stdout = child.stdout.take().unwrap();
        let mut reader = tokio::spawn(async move {
            let mut sink = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut sink).await;
        });
        child.wait().await.unwrap();

        let started = Instant::now();
        terminate_group(pid, &mut reader, Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(reader.is_finished());
    }
}
