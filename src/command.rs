//! Subprocess execution for the program-builder pipeline.
//!
//! Build steps are killed outright on cancellation; the migration program
//! itself gets a graceful SIGTERM → SIGKILL shutdown and is always reaped.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{MigrateError, MigrateResult};

/// How long a SIGTERM'd child may linger before SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(3);

fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

fn build(program: &str, args: &[&str], dir: &Path, envs: &[(&str, String)]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(dir)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    for (key, value) in envs {
        cmd.env(key, value);
    }
    cmd
}

/// Run to completion, killing the child if the token fires first.
pub async fn run(
    token: &CancellationToken,
    program: &str,
    args: &[&str],
    dir: &Path,
    envs: &[(&str, String)],
) -> MigrateResult<()> {
    let line = command_line(program, args);
    let mut child = build(program, args, dir, envs)
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| MigrateError::Command {
            command: line.clone(),
            detail: err.to_string(),
        })?;

    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = token.cancelled() => None,
    };

    let Some(status) = status else {
        let _ = child.kill().await;
        return Err(MigrateError::Interrupted);
    };

    check_status(line, status)
}

/// Run to completion with graceful shutdown: on cancellation send SIGTERM,
/// wait a grace period, then SIGKILL. The child is reaped on every path.
pub async fn run_with_graceful_shutdown(
    token: &CancellationToken,
    program: &str,
    args: &[&str],
    dir: &Path,
    envs: &[(&str, String)],
) -> MigrateResult<()> {
    let line = command_line(program, args);
    let mut child = build(program, args, dir, envs)
        .spawn()
        .map_err(|err| MigrateError::Command {
            command: line.clone(),
            detail: err.to_string(),
        })?;

    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = token.cancelled() => None,
    };

    let Some(status) = status else {
        terminate(&mut child).await;
        return Err(MigrateError::Interrupted);
    };

    check_status(line, status)
}

fn check_status(line: String, status: std::io::Result<std::process::ExitStatus>) -> MigrateResult<()> {
    let status = status.map_err(|err| MigrateError::Command {
        command: line.clone(),
        detail: err.to_string(),
    })?;
    if !status.success() {
        return Err(MigrateError::Command {
            command: line,
            detail: format!("exited with {status}"),
        });
    }
    Ok(())
}

async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    // No pid (already reaped) or the grace period expired.
    let _ = child.kill().await;
}
