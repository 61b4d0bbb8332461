//! Process management for rendered commands.
//!
//! Commands run under `sh -c` in their own process group so they outlive
//! the agent's request handling and are not hit by signals sent to the
//! agent's group.

use std::process::{Output, Stdio};

use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::{Execution, ExecutionOutput, ExecutorError};

/// Shell used to interpret commands unless the agent configures another.
pub const DEFAULT_SHELL: &str = "sh";

fn build(shell: &str, command: &str) -> Command {
    let mut cmd = Command::new(shell);
    cmd.arg("-c").arg(command);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Spawn `shell -c command`.
///
/// With `wait`, the call returns once the command exits, carrying its exit
/// code and output. Otherwise the command is detached and a background task
/// collects and logs its output.
pub async fn spawn_command(
    shell: &str,
    command: &str,
    wait: bool,
) -> Result<Execution, ExecutorError> {
    let child = build(shell, command).spawn().map_err(|e| {
        error!(shell = %shell, command = %command, error = %e, "Failed to spawn command");
        ExecutorError::Spawn(e)
    })?;
    let pid = child.id();
    info!(pid = ?pid, command = %command, "Command spawned");

    if wait {
        let output = child.wait_with_output().await.map_err(|e| {
            error!(pid = ?pid, error = %e, "Failed to collect command output");
            ExecutorError::Spawn(e)
        })?;
        let output = ExecutionOutput::from(output);
        log_output(pid, &output);
        return Ok(Execution {
            pid,
            output: Some(output),
        });
    }

    tokio::spawn(collect_detached(child));
    Ok(Execution { pid, output: None })
}

async fn collect_detached(child: Child) {
    let pid = child.id();
    match child.wait_with_output().await {
        Ok(output) => log_output(pid, &ExecutionOutput::from(output)),
        Err(e) => warn!(pid = ?pid, error = %e, "Lost track of detached command"),
    }
}

fn log_output(pid: Option<u32>, output: &ExecutionOutput) {
    if !output.stdout.is_empty() {
        debug!(pid = ?pid, stdout = %output.stdout.trim_end(), "Command stdout");
    }
    if !output.stderr.is_empty() {
        debug!(pid = ?pid, stderr = %output.stderr.trim_end(), "Command stderr");
    }
    match output.exit_code {
        Some(0) => info!(pid = ?pid, "Command finished"),
        code => warn!(pid = ?pid, exit_code = ?code, "Command exited unsuccessfully"),
    }
}

impl From<Output> for ExecutionOutput {
    fn from(output: Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}
