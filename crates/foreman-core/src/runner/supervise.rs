//! Launching and supervising one agent process.
//!
//! stdout is newline-delimited JSON fed to the harness's stream handler;
//! stderr is only kept as a bounded tail for failure diagnostics.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

use foreman_db::models::JobStatus;

use crate::harness::{HarnessCommand, StreamHandler};

use super::process;

/// Bytes of stderr kept for diagnostics.
const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// How long to wait for the stderr reader once the process is gone.
const STDERR_SETTLE: Duration = Duration::from_secs(2);

/// How long stdout may keep flowing after the leader exited.
const STDOUT_SETTLE: Duration = Duration::from_millis(500);

const TRUNCATED_NOTE: &str = "\n[truncated]";

/// Everything needed to start an agent process.
#[derive(Debug, Clone)]
pub(crate) struct Launch {
    pub command: HarnessCommand,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Supervision limits for one job.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub timeout: Duration,
    pub grace: Duration,
    pub result_limit: usize,
}

/// How a job ended, ready to be written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: JobStatus,
    pub result: String,
    pub resume_token: Option<String>,
}

impl Outcome {
    pub(crate) fn failed(result: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            result: result.into(),
            resume_token: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Complete
    }
}

/// Spawn the agent as the leader of a new process group.
pub(crate) fn spawn_agent(launch: &Launch) -> std::io::Result<Child> {
    let mut cmd = Command::new(&launch.command.program);
    cmd.args(&launch.command.args)
        .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &launch.working_dir {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);
    cmd.spawn()
}

/// Drive `child` to completion (or timeout) and classify the outcome.
///
/// The outcome follows the leader's exit, not stdout EOF: tools the agent
/// left running in the background may hold the pipe open. Once the leader
/// is gone the reader gets [`STDOUT_SETTLE`] to drain, then the whole
/// process group is killed.
pub(crate) async fn supervise(
    mut child: Child,
    mut handler: Box<dyn StreamHandler>,
    limits: Limits,
) -> Outcome {
    let pid = child.id();
    let stdout = child.stdout.take();
    let mut stderr_task = child.stderr.take().map(|s| tokio::spawn(read_tail(s)));

    let waited = {
        let pump = async {
            if let Some(stdout) = stdout {
                pump_stdout(stdout, handler.as_mut()).await;
            }
        };
        tokio::pin!(pump);
        let deadline = tokio::time::sleep(limits.timeout);
        tokio::pin!(deadline);

        let mut pump_done = false;
        let waited = loop {
            tokio::select! {
                status = child.wait() => break Some(status),
                _ = &mut pump, if !pump_done => pump_done = true,
                _ = &mut deadline => break None,
            }
        };

        if waited.is_none() {
            tracing::warn!(pid, timeout_secs = limits.timeout.as_secs(), "agent timed out");
            process::terminate(&mut child, limits.grace).await;
        }
        if !pump_done && tokio::time::timeout(STDOUT_SETTLE, &mut pump).await.is_err() {
            tracing::debug!(pid, "stdout still open after agent exit");
        }
        waited
    };

    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            if let Err(e) = process::signal_group(pid, libc::SIGKILL) {
                tracing::warn!(pid, error = %e, "failed to kill leftover agent processes");
            }
        }
    }

    let marker = match waited {
        Some(Ok(status)) if status.success() && handler.is_complete() => None,
        Some(Ok(status)) => Some(exit_marker(status)),
        Some(Err(e)) => Some(format!("Failed to wait for agent: {e}")),
        None => Some(format!("Timeout after {}s", limits.timeout.as_secs())),
    };

    let stderr_tail = match stderr_task.as_mut() {
        Some(task) => match tokio::time::timeout(STDERR_SETTLE, &mut *task).await {
            Ok(Ok(tail)) => tail,
            _ => {
                task.abort();
                String::new()
            }
        },
        None => String::new(),
    };

    let partial = handler.result();
    let resume_token = handler.resume_token();
    let (status, result) = match marker {
        None => (JobStatus::Complete, partial),
        Some(marker) => (
            JobStatus::Failed,
            failure_report(&marker, &partial, &stderr_tail),
        ),
    };

    Outcome {
        status,
        result: truncate_result(result, limits.result_limit),
        resume_token,
    }
}

/// Read newline-delimited JSON, feeding every parseable line to `handler`.
///
/// Lines are split on raw bytes so a chunk boundary inside a multi-byte
/// character or a JSON object never corrupts a line.
async fn pump_stdout(stdout: ChildStdout, handler: &mut dyn StreamHandler) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::with_capacity(4096);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(event) => handler.on_event(&event),
                    Err(e) => tracing::debug!(error = %e, "skipping malformed stream line"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "error reading agent stdout");
                break;
            }
        }
    }
}

/// Read `reader` to EOF keeping only the last [`STDERR_TAIL_BYTES`].
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > 2 * STDERR_TAIL_BYTES {
                    tail.drain(..tail.len() - STDERR_TAIL_BYTES);
                }
            }
        }
    }
    if tail.len() > STDERR_TAIL_BYTES {
        tail.drain(..tail.len() - STDERR_TAIL_BYTES);
    }
    String::from_utf8_lossy(&tail).trim().to_string()
}

fn exit_marker(status: ExitStatus) -> String {
    if status.success() {
        return "Stream ended without a success result".to_string();
    }
    if let Some(code) = status.code() {
        return format!("Process exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("Process killed by signal {signal}");
        }
    }
    format!("Process ended abnormally ({status})")
}

fn failure_report(marker: &str, partial: &str, stderr_tail: &str) -> String {
    let mut out = marker.to_string();
    if !partial.trim().is_empty() {
        out.push_str("\n\nPartial output:\n");
        out.push_str(partial.trim());
    }
    if !stderr_tail.is_empty() {
        out.push_str("\n\nstderr (tail):\n");
        out.push_str(stderr_tail);
    }
    out
}

/// Cap `result` at `limit` bytes on a char boundary, noting the cut.
pub(crate) fn truncate_result(mut result: String, limit: usize) -> String {
    if result.len() <= limit {
        return result;
    }
    let mut cut = limit.saturating_sub(TRUNCATED_NOTE.len());
    while !result.is_char_boundary(cut) {
        cut -= 1;
    }
    result.truncate(cut);
    result.push_str(TRUNCATED_NOTE);
    result
}
