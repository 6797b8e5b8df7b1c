//! Child-process invoker for external agent CLIs.
//!
//! Contract: given a prompt and a working directory, the CLI either prints
//! its reply on stdout and exits 0, or it failed. Exit 0 with empty stdout
//! counts as failure. A child that outlives its timeout is terminated
//! progressively: SIGTERM, a 3 second grace period, then SIGKILL.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::process::Command;

use crate::error::Result;
use crate::error::RoundtableErr;

/// How long a SIGTERM'd child gets to exit before SIGKILL.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(3);

/// Environment variables forwarded to agent CLIs. Everything else is
/// dropped so the child never sees markers identifying it as a nested
/// session.
const KEPT_ENV_VARS: [&str; 4] = ["HOME", "PATH", "USER", "TERM"];

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub binary: PathBuf,
    /// Preset arguments; the prompt is appended as the final argument.
    pub args: Vec<String>,
    pub prompt: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

/// Build the scrubbed environment map handed to agent CLIs.
pub fn scrubbed_env() -> HashMap<String, String> {
    KEPT_ENV_VARS
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect()
}

/// Run the CLI to completion and return its stdout. Resolves exactly once:
/// the timeout path and the normal exit path cannot both produce a result.
pub async fn invoke(request: InvokeRequest) -> Result<String> {
    let InvokeRequest {
        binary,
        args,
        prompt,
        cwd,
        env,
        timeout,
    } = request;

    let mut cmd = Command::new(&binary);
    cmd.args(&args)
        .arg(&prompt)
        .current_dir(&cwd)
        .env_clear()
        .envs(&env)
        // No stdin descriptor: some CLIs probe stdin and would otherwise
        // hang waiting for input.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    let stdout_reader = child
        .stdout
        .take()
        .ok_or_else(|| RoundtableErr::Invocation("stdout pipe not available".to_string()))?;
    let stderr_reader = child
        .stderr
        .take()
        .ok_or_else(|| RoundtableErr::Invocation("stderr pipe not available".to_string()))?;
    let stdout_handle = tokio::spawn(read_to_end(stdout_reader));
    let stderr_handle = tokio::spawn(read_to_end(stderr_reader));

    let mut timed_out = false;
    let exit_status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            timed_out = true;
            tracing::warn!(binary = %binary.display(), ?timeout, "child exceeded timeout, sending SIGTERM");
            send_sigterm(&child);
            match tokio::time::timeout(TERMINATION_GRACE, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    tracing::warn!(binary = %binary.display(), "child ignored SIGTERM, sending SIGKILL");
                    if let Err(err) = child.start_kill() {
                        tracing::debug!(%err, "child already gone");
                    }
                    child.wait().await?
                }
            }
        }
    };

    if timed_out {
        // Orphaned grandchildren may still hold the pipes open; do not
        // wait for EOF on output we are going to discard.
        stdout_handle.abort();
        stderr_handle.abort();
        return Err(RoundtableErr::Timeout);
    }

    // The pipes close when the process exits, so these cannot hang.
    let stdout = stdout_handle.await??;
    let stderr = stderr_handle.await??;

    let stdout = String::from_utf8_lossy(&stdout).to_string();
    let exit_code = exit_status.code().unwrap_or(-1);
    if exit_code == 0 && !stdout.trim().is_empty() {
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&stderr);
        let error = match stderr.trim() {
            "" => format!("exit {exit_code}"),
            stderr => stderr.to_string(),
        };
        Err(RoundtableErr::Invocation(error))
    }
}

async fn read_to_end<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on a pid we own; no memory is touched.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &Child) {
    // No SIGTERM equivalent; the grace timer will escalate to kill.
    let _ = child;
}
