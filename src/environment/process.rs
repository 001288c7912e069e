//! Spawning substrate tools with a deadline.
//!
//! Every tool call runs in its own process group. On timeout the whole group
//! is killed, so a `bash -lc` pipeline does not outlive its command.

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }

    /// Best single-line reason for a failed provisioning call
    pub fn failure_reason(&self) -> String {
        let stderr = self.stderr.trim();
        let detail = if stderr.is_empty() { self.stdout.trim() } else { stderr };
        format!("exit code {}: {}", self.exit_code, detail)
    }
}

/// Render `program args...` for logs
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    for arg in args {
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            parts.push(format!("'{}'", arg.replace('\'', "'\\''")));
        } else {
            parts.push(arg.clone());
        }
    }
    parts.join(" ")
}

/// Run `program args` to completion or until `timeout`, optionally feeding `stdin`.
pub async fn run(
    program: &str,
    args: &[String],
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput, ProcessError> {
    let mut command = Command::new(program);
    command.args(args);
    run_command(command, program, stdin, timeout).await
}

/// Like `run`, for callers that need to set cwd or env on the command first
pub async fn run_command(
    mut command: Command,
    program: &str,
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput, ProcessError> {
    let io_err = |source| ProcessError::Io {
        program: program.to_string(),
        source,
    };

    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(io_err)?;
    let pid = child.id();

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input.as_bytes()).await.map_err(io_err)?;
            // pipe dropped here so the tool sees EOF
        }
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output.map_err(io_err)?;
            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
            })
        }
        Err(_) => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            Err(ProcessError::Timeout(timeout))
        }
    }
}

#[cfg(unix)]
pub fn kill_process_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pgid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let out = run("sh", &sh("echo out; echo err >&2; exit 3"), None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.combined(), "out\nerr\n");
        assert!(!out.success());
        assert_eq!(out.failure_reason(), "exit code 3: err");
    }

    #[tokio::test]
    async fn test_feeds_stdin() {
        let out = run("sh", &sh("cat"), Some("hello\n"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_group() {
        let start = std::time::Instant::now();
        let err = run("sh", &sh("sleep 30 & sleep 30"), None, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = run("rollout-no-such-binary", &[], None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Io { .. }));
    }

    #[test]
    fn test_command_line_quotes_spaces() {
        let line = command_line("docker", &["exec".into(), "bash -lc".into(), "".into()]);
        assert_eq!(line, "docker exec 'bash -lc' ''");
    }
}
