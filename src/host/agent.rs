//! Client for the `remlaunch-agent` exec server.
//!
//! Blocking HTTP, like the rest of the submitting side. A command that
//! outlives its timeout comes back as [`ExecReply::TimedOut`]; the process on
//! the agent is not cancelled.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use remlaunch_protocol::{ExecReply, ExecRequest, ExecResponse, FileAck};
use reqwest::blocking::{Body, Client, Response};

use crate::error::TransportError;

/// Extra time given to the HTTP request beyond the command timeout, so the
/// agent's own sentinel normally arrives first.
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct AgentClient {
    base_url: String,
    http: Client,
}

impl AgentClient {
    /// `base_url` is the agent root, e.g. `http://10.0.0.5:8092`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        // Launch scripts run as long as their workload; only per-request
        // timeouts apply.
        let http = Client::builder().timeout(None).build()?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn file_url(&self, remote: &str) -> String {
        format!("{}{}/{}", self.base_url, remlaunch_protocol::FILES_ROUTE, remote)
    }

    /// Write `bytes` to `remote`, replacing it.
    pub fn put_bytes(&self, remote: &str, bytes: Vec<u8>) -> Result<FileAck, TransportError> {
        let response = self.http.put(self.file_url(remote)).body(bytes).send()?;
        parse_json(response)
    }

    /// Stream a local file to `remote`, replacing it.
    pub fn upload_file(&self, local: &Path, remote: &str) -> Result<FileAck, TransportError> {
        tracing::debug!(local = %local.display(), remote, "uploading file to agent");
        let file = File::open(local)?;
        let response = self
            .http
            .put(self.file_url(remote))
            .body(Body::from(file))
            .send()?;
        parse_json(response)
    }

    /// Write a local file to `remote`, appending when `overwrite` is false.
    pub fn update_file(
        &self,
        local: &Path,
        remote: &str,
        overwrite: bool,
    ) -> Result<FileAck, TransportError> {
        let file = File::open(local)?;
        let response = self
            .http
            .post(self.file_url(remote))
            .query(&[("overwrite", overwrite)])
            .body(Body::from(file))
            .send()?;
        parse_json(response)
    }

    /// Run one command in the agent's file root.
    pub fn execute(&self, cmd: &str, timeout: Option<f64>) -> Result<ExecReply, TransportError> {
        match self.send_exec(ExecRequest::single(cmd).with_timeout(timeout))? {
            ExecResponse::Single(reply) => Ok(reply),
            ExecResponse::Batch(_) => Err(TransportError::Protocol(
                "expected a single reply, got a list".to_string(),
            )),
        }
    }

    /// Run `cmds` concurrently on the agent; replies come back in order.
    pub fn map(&self, cmds: &[String], timeout: Option<f64>) -> Result<Vec<ExecReply>, TransportError> {
        match self.send_exec(ExecRequest::batch(cmds.to_vec()).with_timeout(timeout))? {
            ExecResponse::Batch(replies) if replies.len() == cmds.len() => Ok(replies),
            ExecResponse::Batch(replies) => Err(TransportError::Protocol(format!(
                "sent {} commands, got {} replies",
                cmds.len(),
                replies.len()
            ))),
            ExecResponse::Single(_) => Err(TransportError::Protocol(
                "expected a list of replies".to_string(),
            )),
        }
    }

    fn send_exec(&self, request: ExecRequest) -> Result<ExecResponse, TransportError> {
        let url = format!("{}{}", self.base_url, remlaunch_protocol::EXEC_ROUTE);
        let timeout = request.timeout;
        let mut builder = self.http.post(url).json(&request);
        if let Some(secs) = timeout.filter(|s| s.is_finite() && *s >= 0.0) {
            builder = builder.timeout(Duration::from_secs_f64(secs) + TIMEOUT_GRACE);
        }

        match builder.send() {
            Ok(response) => parse_json(response),
            Err(e) if e.is_timeout() => {
                let secs = timeout.unwrap_or_default();
                tracing::warn!(timeout = secs, "agent did not answer before the timeout");
                let sentinel = ExecReply::TimedOut(remlaunch_protocol::TimeoutSentinel { timeout: secs });
                Ok(match request.cmds {
                    Some(cmds) => ExecResponse::Batch(vec![sentinel; cmds.len()]),
                    None => ExecResponse::Single(sentinel),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json()?)
}
