//! Shell command execution.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use futures::future::join_all;
use remlaunch_protocol::{ExecReply, ExecRequest, ExecResponse, ExecResult, TimeoutSentinel};
use tokio::process::Command;

use crate::{AgentError, AgentState};

/// `POST /exec`.
///
/// `cmd` yields one reply, `cmds` a list of replies in request order. All
/// commands of a batch run concurrently and are awaited together.
pub async fn exec(
    State(state): State<AgentState>,
    Json(request): Json<ExecRequest>,
) -> Result<Json<ExecResponse>, AgentError> {
    let timeout = parse_timeout(request.timeout)?;

    if let Some(cmd) = request.cmd {
        let reply = run_command(&cmd, state.file_root(), timeout).await?;
        return Ok(Json(ExecResponse::Single(reply)));
    }

    let cmds = request.cmds.unwrap_or_default();
    let replies = join_all(
        cmds.iter()
            .map(|cmd| run_command(cmd, state.file_root(), timeout)),
    )
    .await
    .into_iter()
    .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(ExecResponse::Batch(replies)))
}

fn parse_timeout(timeout: Option<f64>) -> Result<Option<f64>, AgentError> {
    match timeout {
        None => Ok(None),
        Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(Some(secs)),
        Some(secs) => Err(AgentError::InvalidRequest(format!(
            "timeout must be a non-negative number of seconds, got {}",
            secs
        ))),
    }
}

/// Run `cmd` under `bash -c` in `cwd`.
///
/// When the timeout elapses the sentinel is returned and the child is left
/// running; nothing here kills it.
async fn run_command(
    cmd: &str,
    cwd: &Path,
    timeout: Option<f64>,
) -> Result<ExecReply, AgentError> {
    tracing::debug!(cmd, "exec");

    let child = Command::new("bash")
        .arg("-c")
        .arg(cmd)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let output = match timeout {
        Some(secs) => {
            let limit = Duration::from_secs_f64(secs);
            match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    tracing::warn!(cmd, timeout = secs, "command timed out");
                    return Ok(ExecReply::TimedOut(TimeoutSentinel { timeout: secs }));
                }
            }
        }
        None => child.wait_with_output().await?,
    };

    Ok(ExecReply::Finished(ExecResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timeout_rejects_negative() {
        assert!(parse_timeout(Some(-1.0)).is_err());
        assert!(parse_timeout(Some(f64::NAN)).is_err());
        assert_eq!(parse_timeout(Some(0.5)).unwrap(), Some(0.5));
        assert_eq!(parse_timeout(None).unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_command_captures_streams_and_code() {
        let dir = tempfile::tempdir().unwrap();
        let reply = run_command("echo out; echo err >&2; exit 3", dir.path(), None)
            .await
            .unwrap();
        assert_eq!(
            reply,
            ExecReply::Finished(ExecResult {
                stdout: "out\n".to_string(),
                stderr: "err\n".to_string(),
                exit_code: 3,
            })
        );
    }

    #[tokio::test]
    async fn test_run_command_uses_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();
        let reply = run_command("ls", dir.path(), None).await.unwrap();
        match reply {
            ExecReply::Finished(result) => assert!(result.stdout.contains("marker")),
            other => panic!("unexpected reply {:?}", other),
        }
    }
}
