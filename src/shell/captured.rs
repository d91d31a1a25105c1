//! Captured command execution
//!
//! Runs `<shell> -c <command>` in its own process group, reads stdout and
//! stderr incrementally into byte-capped buffers, and on timeout or
//! cancellation terminates the whole group: SIGTERM first, SIGKILL once the
//! grace period has passed.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exit code reported when the process was killed by the runtime
pub const KILLED_EXIT_CODE: i32 = -1;

/// Byte buffer that keeps the head of a stream up to a cap
#[derive(Debug)]
pub(crate) struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    dropped: usize,
}

impl CappedBuffer {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        let take = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }

    pub(crate) fn is_truncated(&self) -> bool {
        self.dropped > 0
    }

    /// Lossy UTF-8 text with a truncation marker when bytes were dropped
    pub(crate) fn to_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.dropped > 0 {
            if !text.ends_with('\n') && !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!(
                "[output truncated: {} bytes omitted]",
                self.dropped
            ));
        }
        text
    }
}

pub(crate) type SharedBuffer = Arc<Mutex<CappedBuffer>>;

/// Copy a pipe into a shared buffer until EOF; bytes past the cap are drained
pub(crate) fn spawn_reader<R>(mut pipe: R, buffer: SharedBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buffer.lock().await.push(&chunk[..n]),
                Err(e) => {
                    tracing::debug!(error = %e, "Output reader stopped");
                    break;
                }
            }
        }
    })
}

/// Build the `<shell> -c <command>` invocation in its own process group
pub(crate) fn shell_command(shell: &str, command: &str, cwd: Option<&PathBuf>) -> Command {
    let mut cmd = Command::new(shell);
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        tracing::debug!(pid, ?signal, error = %e, "killpg failed");
    }
}

/// Terminate a child and its process group with SIGTERM → grace → SIGKILL
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::Signal;
        if let Some(pid) = child.id() {
            signal_group(pid, Signal::SIGTERM);
            if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                return Some(status);
            }
            tracing::debug!(pid, "Grace period elapsed, sending SIGKILL");
            signal_group(pid, Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill().await;
    child.wait().await.ok()
}

/// Numeric exit code; signals map to 128 + signo on unix
pub(crate) fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    KILLED_EXIT_CODE
}

/// Options for a captured run
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub shell: String,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    /// Per-stream byte cap
    pub max_output_bytes: usize,
    pub kill_grace: Duration,
    /// How long to wait for readers once the process is gone
    pub reader_drain: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            cwd: None,
            timeout: Duration::from_secs(120),
            max_output_bytes: 30_000,
            kill_grace: Duration::from_secs(2),
            reader_drain: Duration::from_millis(500),
        }
    }
}

/// Result of a finished (or killed) command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the runtime killed the process
    pub exit_code: i32,
    pub timed_out: bool,
    pub cancelled: bool,
    pub truncated: bool,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }
}

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Run a command to completion, capturing its output
///
/// Spawn failures are returned as errors; a timeout or cancellation is a
/// normal result with partial output and exit code `-1`.
pub async fn run_captured(
    command: &str,
    opts: &CaptureOptions,
    cancel: CancellationToken,
) -> Result<CommandOutput> {
    let started = Instant::now();
    let mut child = shell_command(&opts.shell, command, opts.cwd.as_ref()).spawn()?;
    tracing::debug!(pid = ?child.id(), command, timeout_ms = opts.timeout.as_millis() as u64, "Spawned command");

    let stdout_buf: SharedBuffer = Arc::new(Mutex::new(CappedBuffer::new(opts.max_output_bytes)));
    let stderr_buf: SharedBuffer = Arc::new(Mutex::new(CappedBuffer::new(opts.max_output_bytes)));
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, stdout_buf.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, stderr_buf.clone()));
    }

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status?),
        _ = tokio::time::sleep(opts.timeout) => Outcome::TimedOut,
        _ = cancel.cancelled() => Outcome::Cancelled,
    };

    let (exit_code, timed_out, cancelled) = match outcome {
        Outcome::Exited(status) => (exit_code_of(status), false, false),
        Outcome::TimedOut => {
            tracing::warn!(command, timeout_ms = opts.timeout.as_millis() as u64, "Command timed out");
            terminate(&mut child, opts.kill_grace).await;
            (KILLED_EXIT_CODE, true, false)
        }
        Outcome::Cancelled => {
            tracing::info!(command, "Command cancelled");
            terminate(&mut child, opts.kill_grace).await;
            (KILLED_EXIT_CODE, false, true)
        }
    };

    // Detached grandchildren can keep a pipe open; don't wait on them forever
    for mut reader in readers {
        if tokio::time::timeout(opts.reader_drain, &mut reader).await.is_err() {
            reader.abort();
        }
    }

    let stdout = stdout_buf.lock().await;
    let stderr = stderr_buf.lock().await;
    Ok(CommandOutput {
        stdout: stdout.to_text(),
        stderr: stderr.to_text(),
        exit_code,
        timed_out,
        cancelled,
        truncated: stdout.is_truncated() || stderr.is_truncated(),
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn opts() -> CaptureOptions {
        CaptureOptions {
            timeout: Duration::from_secs(10),
            kill_grace: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn test_capped_buffer_marker() {
        let mut buf = CappedBuffer::new(4);
        buf.push(b"abcdef");
        buf.push(b"gh");
        assert!(buf.is_truncated());
        assert_eq!(buf.to_text(), "abcd\n[output truncated: 4 bytes omitted]");
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let out = run_captured("echo out; echo err >&2", &opts(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.exit_code, 0);
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let out = run_captured("exit 3", &opts(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let options = CaptureOptions {
            timeout: Duration::from_millis(300),
            ..opts()
        };
        let started = Instant::now();
        let out = run_captured("echo started; sleep 5", &options, CancellationToken::new())
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, KILLED_EXIT_CODE);
        assert_eq!(out.stdout, "started\n");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let out = run_captured("sleep 5", &opts(), token).await.unwrap();
        assert!(out.cancelled);
        assert!(!out.timed_out);
        assert_eq!(out.exit_code, KILLED_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_output_truncated_at_cap() {
        let options = CaptureOptions {
            max_output_bytes: 100,
            ..opts()
        };
        let out = run_captured("yes x | head -c 5000", &options, CancellationToken::new())
            .await
            .unwrap();
        assert!(out.truncated);
        assert!(out.stdout.contains("[output truncated: 4900 bytes omitted]"));
    }

    #[tokio::test]
    async fn test_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let options = CaptureOptions {
            cwd: Some(dir.path().to_path_buf()),
            ..opts()
        };
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let out = run_captured("ls", &options, CancellationToken::new())
            .await
            .unwrap();
        assert!(out.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let options = CaptureOptions {
            shell: "/nonexistent/shell".to_string(),
            ..opts()
        };
        assert!(run_captured("true", &options, CancellationToken::new())
            .await
            .is_err());
    }
}
