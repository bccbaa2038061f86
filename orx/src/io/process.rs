//! Helpers for running child processes with timeouts, heartbeats and bounded output.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// How often the wait loop checks for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cooperative cancellation flag shared between the runner and child processes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Limits and hooks for one child process.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Short name used in log events.
    pub label: String,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Emit an `info!` event at this interval while the child runs.
    pub heartbeat: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl ProcessOptions {
    pub fn new(label: impl Into<String>, timeout: Duration) -> Self {
        Self {
            label: label.into(),
            timeout,
            output_limit_bytes: 1_000_000,
            heartbeat: None,
            cancel: None,
        }
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl CommandOutput {
    /// Exit code, `None` when killed by a signal (including our own kill).
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Run a command to completion, timeout or cancellation, capturing stdout/stderr
/// without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the
/// amount of stdout/stderr stored in memory (bytes beyond this are drained and dropped).
/// On timeout or cancellation the child is killed and the partial output returned.
#[instrument(skip_all, fields(label = %opts.label, timeout_secs = opts.timeout.as_secs()))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    opts: &ProcessOptions,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {}", opts.label));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let limit = opts.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // The child may exit without reading its input.
        if let Err(e) = child_stdin.write_all(input) {
            warn!(err = %e, "child closed stdin early");
        }
    }

    let mut timed_out = false;
    let mut cancelled = false;
    let mut last_beat = started;
    let status = loop {
        if let Some(status) = child
            .wait_timeout(POLL_INTERVAL)
            .context("wait for command")?
        {
            break status;
        }
        let elapsed = started.elapsed();
        if opts.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            warn!(label = %opts.label, "cancellation requested, killing");
            cancelled = true;
        } else if elapsed >= opts.timeout {
            warn!(
                label = %opts.label,
                timeout_secs = opts.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
        }
        if cancelled || timed_out {
            child.kill().context("kill command")?;
            break child.wait().context("wait command after kill")?;
        }
        if let Some(interval) = opts.heartbeat
            && last_beat.elapsed() >= interval
        {
            info!(
                label = %opts.label,
                elapsed_secs = elapsed.as_secs(),
                "command still running"
            );
            last_beat = Instant::now();
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let duration = started.elapsed();
    debug!(
        exit_code = ?status.code(),
        timed_out,
        cancelled,
        duration_ms = duration.as_millis() as u64,
        "command finished"
    );
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
        duration,
    })
}

/// Search `PATH` for an executable named `binary`. Paths containing `/` are checked directly.
pub fn find_on_path(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if binary.contains('/') {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|full| full.is_file())
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let opts = ProcessOptions::new("sh", Duration::from_secs(10));
        let out = run_command(sh("echo out; echo err >&2; exit 3"), None, &opts).expect("run");
        assert_eq!(out.code(), Some(3));
        assert_eq!(out.stdout_lossy(), "out\n");
        assert_eq!(out.stderr_lossy(), "err\n");
        assert!(!out.timed_out);
    }

    #[test]
    fn feeds_stdin() {
        let opts = ProcessOptions::new("cat", Duration::from_secs(10));
        let out = run_command(Command::new("cat"), Some(b"prompt text"), &opts).expect("run");
        assert_eq!(out.stdout_lossy(), "prompt text");
    }

    #[test]
    fn kills_on_timeout() {
        let opts = ProcessOptions::new("sleep", Duration::from_millis(300));
        let out = run_command(sh("exec sleep 5"), None, &opts).expect("run");
        assert!(out.timed_out);
        assert!(out.duration < Duration::from_secs(5));
    }

    #[test]
    fn kills_on_cancel() {
        let token = CancelToken::new();
        token.cancel();
        let mut opts = ProcessOptions::new("sleep", Duration::from_secs(30));
        opts.cancel = Some(token);
        let out = run_command(sh("exec sleep 5"), None, &opts).expect("run");
        assert!(out.cancelled);
        assert!(!out.timed_out);
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let mut opts = ProcessOptions::new("sh", Duration::from_secs(10));
        opts.output_limit_bytes = 4;
        let out = run_command(sh("printf 0123456789"), None, &opts).expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.stdout_truncated_notice("x").contains("truncated 6 bytes"));
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let opts = ProcessOptions::new("missing", Duration::from_secs(1));
        assert!(run_command(Command::new("definitely-not-a-binary-orx"), None, &opts).is_err());
    }

    #[test]
    fn finds_sh_on_path() {
        assert!(find_on_path("sh").is_some());
        assert!(find_on_path("definitely-not-a-binary-orx").is_none());
    }
}
