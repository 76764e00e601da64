//! External command execution
//!
//! Every kernel-facing operation ends up here: spawn the command, capture
//! stdout and stderr together, and bound the whole run by a timeout so a hung
//! `ip`/`iptables` cannot stall a reconciliation pass.

use crate::core::error::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs a command and returns its combined stdout/stderr.
///
/// A non-zero exit is still treated as success when the combined output
/// contains one of `ignore` (e.g. `"File exists"` for an idempotent create).
///
/// # Errors
///
/// - `Error::Command` if the command cannot be spawned or exits unsuccessfully
/// - `Error::Timeout` if it does not finish within `timeout`; the child is killed
pub async fn run_combined(
    command: &mut Command,
    ignore: &[&str],
    timeout: Duration,
) -> Result<String> {
    let program = describe(command);

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| Error::Command {
        program: program.clone(),
        message: format!("failed to spawn: {e}"),
        output: e.to_string(),
        exit_code: None,
    })?;

    let Ok(output) = tokio::time::timeout(timeout, child.wait_with_output()).await else {
        warn!("Command timed out after {}s: {program}", timeout.as_secs());
        return Err(Error::Timeout {
            program,
            secs: timeout.as_secs(),
        });
    };
    let output = output?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        return Ok(combined);
    }

    if let Some(pattern) = ignore.iter().find(|p| combined.contains(**p)) {
        debug!("Ignoring failure of {program} (matched {pattern:?})");
        return Ok(combined);
    }

    Err(Error::Command {
        program,
        message: first_line(&combined).unwrap_or_else(|| format!("exit status {}", output.status)),
        output: combined,
        exit_code: output.status.code(),
    })
}

/// Renders a command line for logs and error messages.
pub fn describe(command: &Command) -> String {
    let std = command.as_std();
    let mut line = std.get_program().to_string_lossy().into_owned();
    for arg in std.get_args() {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}

fn first_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches("Error: ").to_string())
}
