//! `POST /exec` request and reply bodies.

use serde::{Deserialize, Serialize};

/// Body of `POST /exec`.
///
/// Exactly one of `cmd` / `cmds` is expected. A request carrying neither is
/// answered with an empty list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// A single shell command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    /// Commands to run concurrently; the reply is a list in the same order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmds: Option<Vec<String>>,
    /// Seconds to wait for each command before answering with the sentinel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

impl ExecRequest {
    pub fn single(cmd: impl Into<String>) -> Self {
        Self {
            cmd: Some(cmd.into()),
            ..Self::default()
        }
    }

    pub fn batch(cmds: Vec<String>) -> Self {
        Self {
            cmds: Some(cmds),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Option<f64>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Output of one finished command. On the wire: `[stdout, stderr, exit_code]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String, i32)", into = "(String, String, i32)")]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code; `-1` when the process was terminated by a signal.
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl From<(String, String, i32)> for ExecResult {
    fn from((stdout, stderr, exit_code): (String, String, i32)) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
        }
    }
}

impl From<ExecResult> for (String, String, i32) {
    fn from(result: ExecResult) -> Self {
        (result.stdout, result.stderr, result.exit_code)
    }
}

/// Returned in place of a result when a command outlives its timeout.
///
/// The command itself keeps running on the agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutSentinel {
    pub timeout: f64,
}

/// Reply for a single command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecReply {
    Finished(ExecResult),
    TimedOut(TimeoutSentinel),
}

/// Full `POST /exec` response body.
///
/// `Batch` is tried first: a single `[stdout, stderr, code]` triple never
/// parses as a list of replies because its first element is a bare string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecResponse {
    Batch(Vec<ExecReply>),
    Single(ExecReply),
}
