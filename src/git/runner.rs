use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::AppError;

/// Captured output of a finished git subprocess.
#[derive(Debug)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
}

/// Run `git <args>` in `dir`, failing on a non-zero exit.
///
/// The subprocess is killed once `timeout` elapses; a timed-out command is
/// reported as a git error with no exit code so callers can distinguish it
/// from a real failure.
pub fn run_git(dir: &Path, args: &[&str], timeout: Duration) -> Result<GitOutput, AppError> {
    let output = run_git_lenient(dir, args, timeout)?;
    if !output.success {
        return Err(AppError::Git {
            command: command_label(args),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// Run `git <args>` in `dir`, reporting a non-zero exit through the returned
/// `success` flag instead of an error. Used for probe queries where failure
/// is an answer (`rev-parse --verify`, upstream lookups).
pub fn run_git_lenient(
    dir: &Path,
    args: &[&str],
    timeout: Duration,
) -> Result<GitOutput, AppError> {
    let mut child = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| AppError::git(command_label(args), format!("failed to spawn: {}", e)))?;

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {
                if start.elapsed() > timeout {
                    warn!(command = %command_label(args), dir = %dir.display(), "Git command timed out, killing");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(AppError::git(
                        command_label(args),
                        format!("timed out after {:?}", timeout),
                    ));
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(AppError::git(
                    command_label(args),
                    format!("error waiting for process: {}", e),
                ));
            }
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|e| AppError::git(command_label(args), format!("failed to collect output: {}", e)))?;

    Ok(GitOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
        success: output.status.success(),
    })
}

fn command_label(args: &[&str]) -> String {
    let mut label = String::from("git");
    for arg in args {
        label.push(' ');
        label.push_str(arg);
    }
    label
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_exit_code_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_git(
            dir.path(),
            &["rev-parse", "--verify", "HEAD"],
            Duration::from_secs(10),
        )
        .unwrap_err();
        match err {
            AppError::Git { command, exit_code, .. } => {
                assert!(command.starts_with("git rev-parse"));
                assert!(exit_code.is_some());
            }
            other => panic!("expected git error, got {other:?}"),
        }
    }

    #[test]
    fn lenient_run_surfaces_failure_as_flag() {
        let dir = tempfile::tempdir().unwrap();
        let output = run_git_lenient(
            dir.path(),
            &["rev-parse", "--verify", "HEAD"],
            Duration::from_secs(10),
        )
        .unwrap();
        assert!(!output.success);
    }

    #[test]
    fn captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let output = run_git(dir.path(), &["--version"], Duration::from_secs(10)).unwrap();
        assert!(output.stdout.starts_with("git version"));
    }
}
