//! Subprocess invocation with timeout, cancellation, and graceful kill.
//!
//! One entry point, [`run_cli`], spawns a provider binary, feeds the prompt
//! on standard input, drains stdout/stderr concurrently, and terminates the
//! child with SIGTERM followed by SIGKILL after a grace period when the
//! caller's timeout or cancellation fires.

use crate::agentmux::provider::ProviderError;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// How long a child gets to exit after SIGTERM before SIGKILL is sent.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Description of one CLI invocation.
#[derive(Debug, Clone)]
pub struct CliInvocation {
    /// Resolved program path or name.
    pub command: String,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// Payload written to the child's standard input, then closed.
    pub stdin_payload: Option<String>,
    /// Wall-clock budget for the whole invocation.
    pub timeout: Option<Duration>,
    /// Cooperative cancellation handle.
    pub cancellation: CancellationToken,
}

/// Captured output of a completed CLI invocation.
#[derive(Debug, Clone)]
pub struct CliOutput {
    /// Full standard output.
    pub stdout: String,
    /// Full standard error.
    pub stderr: String,
    /// Exit code, `-1` when the child was terminated by a signal.
    pub exit_code: i32,
    /// Wall-clock duration of the invocation.
    pub duration: Duration,
}

/// Spawn the CLI and wait for it to finish, honouring timeout and
/// cancellation.
///
/// Output is drained on dedicated tasks so a chatty child cannot deadlock on
/// a full pipe while we wait for exit. On timeout or cancellation the child
/// receives SIGTERM, then SIGKILL after [`KILL_GRACE`].
pub async fn run_cli(invocation: CliInvocation) -> Result<CliOutput, ProviderError> {
    let started = Instant::now();

    let mut command = Command::new(&invocation.command);
    command
        .args(&invocation.args)
        .stdin(if invocation.stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| ProviderError::SpawnFailed {
        command: invocation.command.clone(),
        message: e.to_string(),
    })?;

    if let Some(payload) = invocation.stdin_payload {
        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits without draining stdin surfaces EPIPE here;
            // its exit status is what matters, so the write error is not
            // fatal. Dropping stdin closes the pipe so the CLI sees EOF.
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                log::debug!("stdin write to provider failed: {}", e);
            }
        }
    }

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let timeout_ms = invocation.timeout.map(|t| t.as_millis() as u64);
    let expired = async {
        match invocation.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };

    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|e| ProviderError::Io(e.to_string()))?
        }
        _ = invocation.cancellation.cancelled() => {
            graceful_kill(&mut child).await;
            return Err(ProviderError::Cancelled);
        }
        _ = expired => {
            graceful_kill(&mut child).await;
            return Err(ProviderError::Timeout {
                timeout_ms: timeout_ms.unwrap_or(0),
            });
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(CliOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: status.code().unwrap_or(-1),
        duration: started.elapsed(),
    })
}

/// SIGTERM, wait for the grace period, then SIGKILL whatever is left.
async fn graceful_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
                return;
            }
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}
