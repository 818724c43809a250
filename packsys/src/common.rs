use anyhow::{Context, Result};
use log::debug;
use std::process::Output;
use tokio::process::Command;

pub(crate) mod fs;

/// Outcome of a child process whose output we capture instead of streaming.
#[derive(Debug, Clone)]
pub(crate) struct CapturedRun {
    /// Exit code; -1 when the process was killed by a signal.
    pub(crate) code: i32,
    /// Combined stdout and stderr.
    pub(crate) output: String,
}

/// Run a `tokio::process::Command`, capturing stdout and stderr. The exit
/// status is returned to the caller rather than treated as an error, since
/// buildpack binaries use exit codes as part of their protocol.
pub(crate) async fn capture(cmd: &mut Command) -> Result<CapturedRun> {
    debug!("Running: {:?}", cmd);
    // If the caller is cancelled while waiting, the child goes with it.
    let output = cmd
        .kill_on_drop(true)
        .output()
        .await
        .context(format!("Unable to start command {:?}", cmd))?;
    Ok(CapturedRun {
        code: output.status.code().unwrap_or(-1),
        output: merged_output(&output),
    })
}

fn merged_output(output: &Output) -> String {
    let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        merged.push_str(&stderr);
    }
    merged
}
