//! External command execution with a wall-clock budget.

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Failure raised when a command outlives its budget.
#[derive(Debug)]
pub struct BudgetExceeded {
    pub program: String,
    pub budget: Duration,
}

impl std::fmt::Display for BudgetExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "'{}' killed after exceeding its {:?} budget",
            self.program, self.budget
        )
    }
}

impl std::error::Error for BudgetExceeded {}

/// Resolve `program` in PATH, failing with an actionable message.
pub fn ensure_exists(program: &str) -> Result<PathBuf> {
    which::which(program).with_context(|| format!("required host tool '{}' not found in PATH", program))
}

/// Run `cmd` to completion, killing it once `budget` elapses.
///
/// stdout/stderr are drained on helper threads so a chatty child cannot
/// block on a full pipe while we poll.
pub fn run_with_budget(cmd: &mut Command, budget: Duration) -> Result<CommandOutput> {
    let program = cmd.get_program().to_string_lossy().to_string();
    let started = Instant::now();

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning '{}'", program))?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("waiting for '{}'", program))?
        {
            break status;
        }
        if started.elapsed() >= budget {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BudgetExceeded { program, budget }.into());
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout.map(join_drain).unwrap_or_default();
    let stderr = stderr.map(join_drain).unwrap_or_default();

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        elapsed: started.elapsed(),
    })
}

/// Run `cmd` and fail with its captured output on a non-zero exit.
pub fn run_checked(cmd: &mut Command, budget: Duration) -> Result<CommandOutput> {
    let rendered = render(cmd);
    let output = run_with_budget(cmd, budget)?;
    if output.status.success() {
        tracing::debug!(command = %rendered, elapsed = ?output.elapsed, "command finished");
        return Ok(output);
    }
    bail!(
        "command failed: {}\n  Exit code: {}\n  stdout: {}\n  stderr: {}",
        rendered,
        output.status.code().unwrap_or(-1),
        output.stdout.trim(),
        output.stderr.trim()
    )
}

/// Program and args joined for logs and error messages.
pub fn render(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|part| part.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `root` joined with an in-image absolute path.
pub fn rootfs_path(root: &Path, in_image: &str) -> PathBuf {
    root.join(in_image.trim_start_matches('/'))
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).to_string()
    })
}

fn join_drain(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_with_budget_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2");
        let output = run_with_budget(&mut cmd, Duration::from_secs(10)).unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn test_run_with_budget_kills_slow_command() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = run_with_budget(&mut cmd, Duration::from_millis(100)).unwrap_err();
        assert!(err.downcast_ref::<BudgetExceeded>().is_some());
    }

    #[test]
    fn test_run_checked_reports_failure() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo boom >&2; exit 3");
        let err = run_checked(&mut cmd, Duration::from_secs(10)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Exit code: 3"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_ensure_exists() {
        assert!(ensure_exists("sh").is_ok());
        assert!(ensure_exists("definitely_not_a_real_command_12345").is_err());
    }

    #[test]
    fn test_rootfs_path_strips_leading_slash() {
        assert_eq!(
            rootfs_path(Path::new("/tmp/root"), "/opt/venv"),
            PathBuf::from("/tmp/root/opt/venv")
        );
    }
}
