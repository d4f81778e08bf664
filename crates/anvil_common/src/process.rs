//! Subprocess execution with optional timeout.
//!
//! Build functions shell out to compilers and linkers; this module runs such
//! commands to completion, captures their output, and enforces an optional
//! wall-clock timeout by killing the child on expiry. A timeout reports a
//! [`BuildError::Timeout`], distinct from a nonzero exit.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::BuildError;

/// How often the runner polls a child that has a timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captured output of a command that exited successfully.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Runs a command to completion, killing it if `timeout` expires.
///
/// Stdout and stderr are captured on reader threads so a chatty child cannot
/// deadlock against a full pipe while we poll for exit. Returns
/// [`BuildError::ToolNotFound`] if the executable cannot be spawned,
/// [`BuildError::CommandFailed`] on nonzero exit, and [`BuildError::Timeout`]
/// if the deadline passes before the child exits.
pub fn run_with_timeout(
    mut cmd: Command,
    timeout: Option<Duration>,
) -> Result<CommandOutput, BuildError> {
    let command = cmd.get_program().to_string_lossy().into_owned();

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => BuildError::ToolNotFound {
            tool: command.clone(),
        },
        _ => BuildError::Other(format!("failed to spawn `{command}`: {e}")),
    })?;

    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let deadline = timeout.map(|t| Instant::now() + t);
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                return Err(BuildError::Other(format!(
                    "failed to wait for `{command}`: {e}"
                )))
            }
        }

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                warn!(command = %command, "command exceeded its timeout; killing");
                let _ = child.kill();
                let _ = child.wait();
                return Err(BuildError::Timeout {
                    command,
                    timeout_secs: timeout.unwrap_or_default().as_secs(),
                });
            }
        }

        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    if status.success() {
        Ok(CommandOutput { stdout, stderr })
    } else {
        Err(BuildError::CommandFailed {
            command,
            status: status.code().unwrap_or(-1),
            stderr,
        })
    }
}

/// Drains a child pipe on its own thread, returning everything it produced.
fn spawn_reader<R: Read + Send + 'static>(src: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut src) = src {
            let _ = src.read_to_string(&mut buf);
        }
        buf
    })
}
