//! Local command execution
//!
//! Everything that leaves this machine (ssh, rsync, aws, gsutil, kubectl,
//! the composed launch script itself) is run through a [`CommandRunner`], so
//! tests can swap in [`RecordingShell`](crate::mock::RecordingShell) and
//! inspect exactly what would have been executed.

mod quote;

pub use quote::{join_background, quote, wait_all, RUN_STATUS_VAR};

use std::io::{self, Write};
use std::process::{Command, Stdio};

/// A bash script to run locally.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShellCommand {
    pub script: String,
    /// Written to the child's stdin, then stdin is closed.
    pub stdin: Option<String>,
    /// Capture stdout/stderr instead of inheriting them.
    pub capture: bool,
    /// Return once the child is spawned and its stdin written.
    pub detach: bool,
}

impl ShellCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn captured(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn detached(mut self) -> Self {
        self.detach = true;
        self
    }
}

/// What a command left behind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code; `None` for detached commands and signal deaths.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Process id of a detached command.
    pub pid: Option<u32>,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Turn a non-zero exit into [`ShellError::Failed`]. Detached commands
    /// pass.
    pub fn check(self, command: &ShellCommand) -> Result<Self, ShellError> {
        if command.detach || self.success() {
            Ok(self)
        } else {
            Err(ShellError::Failed {
                status: self.status,
                command: summarize(&command.script),
                stderr: self.stderr,
            })
        }
    }
}

/// Errors for local command execution
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("failed to spawn shell: {0}")]
    Spawn(#[source] io::Error),

    #[error("IO error talking to child: {0}")]
    Io(#[from] io::Error),

    #[error("`{command}` exited with {status:?}: {stderr}")]
    Failed {
        status: Option<i32>,
        command: String,
        stderr: String,
    },
}

/// Runs bash scripts on the submitting machine.
pub trait CommandRunner: Send + Sync {
    /// Run the command; a non-zero exit is reported in the output, not as an
    /// error.
    fn run(&self, command: &ShellCommand) -> Result<CommandOutput, ShellError>;

    /// Run and require a zero exit.
    fn run_checked(&self, command: &ShellCommand) -> Result<CommandOutput, ShellError> {
        self.run(command)?.check(command)
    }
}

/// Runs commands with the local `bash`.
#[derive(Debug, Clone)]
pub struct LocalShell {
    program: String,
}

impl Default for LocalShell {
    fn default() -> Self {
        Self {
            program: "bash".to_string(),
        }
    }
}

impl LocalShell {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandRunner for LocalShell {
    fn run(&self, command: &ShellCommand) -> Result<CommandOutput, ShellError> {
        tracing::debug!(script = %command.script, detach = command.detach, "running local command");

        let mut cmd = Command::new(&self.program);
        cmd.arg("-c").arg(&command.script);
        cmd.stdin(if command.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        if command.capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(ShellError::Spawn)?;

        if let Some(ref input) = command.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes())?;
            }
        }

        if command.detach {
            return Ok(CommandOutput {
                pid: Some(child.id()),
                ..CommandOutput::default()
            });
        }

        let output = child.wait_with_output()?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            pid: None,
        })
    }
}

/// First line of a script, for error messages.
fn summarize(script: &str) -> String {
    let first = script.trim().lines().next().unwrap_or_default();
    if script.trim().lines().nth(1).is_some() {
        format!("{} ...", first)
    } else {
        first.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_shell_captures_output() {
        let shell = LocalShell::new();
        let output = shell
            .run(&ShellCommand::new("echo hi; echo there >&2; exit 3").captured())
            .unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout, "hi\n");
        assert_eq!(output.stderr, "there\n");
    }

    #[test]
    fn test_local_shell_feeds_stdin() {
        let shell = LocalShell::new();
        let output = shell
            .run(&ShellCommand::new("bash -s").with_stdin("echo from-stdin").captured())
            .unwrap();
        assert_eq!(output.stdout, "from-stdin\n");
    }

    #[test]
    fn test_run_checked_reports_failure() {
        let shell = LocalShell::new();
        let err = shell
            .run_checked(&ShellCommand::new("echo nope >&2\nexit 1").captured())
            .unwrap_err();
        match err {
            ShellError::Failed {
                status,
                command,
                stderr,
            } => {
                assert_eq!(status, Some(1));
                assert_eq!(command, "echo nope >&2 ...");
                assert_eq!(stderr, "nope\n");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_detached_returns_pid() {
        let shell = LocalShell::new();
        let output = shell
            .run(&ShellCommand::new("sleep 0").detached())
            .unwrap();
        assert!(output.pid.is_some());
        assert_eq!(output.status, None);
    }
}
