// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Child-process plumbing shared by the daemon and validators.
//!
//! Three concerns live here because they are easy to get wrong per-platform:
//!
//! - spawning a supervised child in its own process group, so a later kill
//!   reaches the whole tree (shell → package manager → dev server),
//! - terminating that tree with a TERM→KILL escalation,
//! - probing whether a pid is alive without sending anything that could
//!   terminate the target. On Windows a signal-style probe is a terminate
//!   operation; the probe there must go through `tasklist`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Build a command for a supervised child process.
///
/// stdout is piped (stdout lines are the child's heartbeat), stderr is piped
/// for diagnostics, stdin is closed. On Unix the child gets its own process
/// group so the entire tree can be signalled at once.
pub fn supervised_command(program: &str, args: &[&str], cwd: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    cmd
}

/// Build a supervised command that runs a shell line (validator commands
/// from the project index are shell strings).
pub fn supervised_shell(line: &str, cwd: &Path) -> Command {
    #[cfg(unix)]
    {
        supervised_command("sh", &["-c", line], cwd)
    }
    #[cfg(windows)]
    {
        supervised_command("cmd", &["/C", line], cwd)
    }
}

/// Kill a child's whole process tree: TERM, wait out the grace period, KILL.
pub async fn kill_tree(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return; // already reaped
    };

    signal_tree(pid, false);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {
            debug!(pid, "process tree exited after TERM");
            return;
        }
        Err(_) => {
            warn!(pid, "process tree survived TERM, escalating to KILL");
        }
    }

    signal_tree(pid, true);
    let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
    // Last resort: the direct child via the handle.
    let _ = child.start_kill();
}

#[cfg(unix)]
fn signal_tree(pid: u32, force: bool) {
    let sig = if force { "-KILL" } else { "-TERM" };
    // Negative pid addresses the process group created at spawn.
    let status = std::process::Command::new("kill")
        .args([sig, &format!("-{pid}")])
        .status();
    if status.map(|s| !s.success()).unwrap_or(true) {
        // Group gone or not ours; fall back to the single pid.
        let _ = std::process::Command::new("kill")
            .args([sig, &pid.to_string()])
            .status();
    }
}

#[cfg(windows)]
fn signal_tree(pid: u32, force: bool) {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/T", "/PID", &pid.to_string()]);
    if force {
        cmd.arg("/F");
    }
    let _ = cmd.status();
}

/// Non-destructive liveness probe for an arbitrary pid.
///
/// Used for lock-file contention checks against processes we did not spawn,
/// so it must never signal anything that could terminate the target.
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 performs permission and existence checks only on POSIX.
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
    #[cfg(windows)]
    {
        // tasklist is query-only; never use taskkill-style probes here.
        let output = std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
            .output();
        match output {
            Ok(out) => String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")),
            Err(_) => false,
        }
    }
}

/// Run a shell line to completion with a timeout, capturing combined output.
///
/// Returns `(success, output)`. On timeout the tree is killed and the output
/// notes the timeout. This is the building block for validator commands.
/// stdout and stderr are drained concurrently with the wait so a chatty
/// child never deadlocks on a full pipe.
pub async fn run_shell_captured(line: &str, cwd: &Path, timeout: Duration) -> (bool, String) {
    let mut cmd = supervised_shell(line, cwd);
    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return (false, format!("failed to spawn `{line}`: {e}")),
    };
    let pid = child.id();

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.is_empty() {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&stderr);
            }
            (output.status.success(), text)
        }
        Ok(Err(e)) => (false, format!("wait failed: {e}")),
        Err(_) => {
            if let Some(pid) = pid {
                signal_tree(pid, true);
            }
            (
                false,
                format!("command timed out after {}s: {line}", timeout.as_secs()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn test_bogus_pid_is_dead() {
        // Max pid space on Linux defaults to ~4 million; this is far above
        // anything a test machine will allocate.
        assert!(!pid_alive(3_999_999));
    }

    #[tokio::test]
    async fn test_run_shell_captures_output() {
        let dir = TempDir::new().unwrap();
        let (ok, output) = run_shell_captured("echo hello", dir.path(), Duration::from_secs(10)).await;
        assert!(ok);
        assert!(output.contains("hello"));
    }

    #[tokio::test]
    async fn test_run_shell_reports_failure() {
        let dir = TempDir::new().unwrap();
        let (ok, _) = run_shell_captured("exit 3", dir.path(), Duration::from_secs(10)).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_run_shell_timeout() {
        let dir = TempDir::new().unwrap();
        let (ok, output) =
            run_shell_captured("sleep 30", dir.path(), Duration::from_millis(200)).await;
        assert!(!ok);
        assert!(output.contains("timed out"));
    }
}
